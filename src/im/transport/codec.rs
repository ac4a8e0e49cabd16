//! 长连接帧编解码
//!
//! 上行：`OutboundCommand` -> JSON，开启压缩时以 gzip 二进制帧发送，否则为文本帧。
//! 下行：文本帧直接解析；二进制帧按 gzip 魔数判断是否需要解压。

use crate::im::serialization::{compress_gzip, decompress_gzip, is_gzip};
use crate::im::types::{InboundEvent, OutboundCommand};
use anyhow::{Context, Result};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// 下行帧解码结果
#[derive(Debug)]
pub enum DecodedFrame {
    Event(InboundEvent),
    /// 未识别的事件名（忽略，仅记录日志）
    Unknown(String),
    /// 无法解析的载荷
    Malformed(String),
}

/// 编码上行命令
pub fn encode_command(command: &OutboundCommand, compress: bool) -> Result<WsMessage> {
    let json = serde_json::to_vec(command)
        .with_context(|| format!("序列化命令失败: {}", command.name()))?;
    if compress {
        let compressed = compress_gzip(&json).context("压缩命令失败")?;
        Ok(WsMessage::Binary(compressed))
    } else {
        Ok(WsMessage::Text(
            String::from_utf8(json).context("命令不是合法 UTF-8")?,
        ))
    }
}

/// 解码二进制帧（可能经过 gzip 压缩）
pub fn decode_binary(data: &[u8]) -> DecodedFrame {
    if is_gzip(data) {
        match decompress_gzip(data) {
            Ok(raw) => decode_payload(&raw),
            Err(e) => DecodedFrame::Malformed(format!("解压失败: {e}")),
        }
    } else {
        decode_payload(data)
    }
}

/// 解码 `{"event": ..., "data": ...}` 载荷
pub fn decode_payload(raw: &[u8]) -> DecodedFrame {
    match serde_json::from_slice::<InboundEvent>(raw) {
        Ok(event) => DecodedFrame::Event(event),
        Err(parse_err) => {
            // 区分"未知事件"与"格式错误"
            let name = serde_json::from_slice::<serde_json::Value>(raw)
                .ok()
                .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(str::to_string));
            match name {
                Some(name) if !is_known_event(&name) => DecodedFrame::Unknown(name),
                _ => DecodedFrame::Malformed(format!(
                    "{parse_err}, 原始数据: {}",
                    String::from_utf8_lossy(raw)
                )),
            }
        }
    }
}

fn is_known_event(name: &str) -> bool {
    matches!(
        name,
        "receive-message"
            | "message-sent-success"
            | "message-error"
            | "message-deleted"
            | "messages-read-by-receiver"
            | "message-marked-read"
            | "user-status-change"
            | "block-success"
            | "unblock-success"
            | "you-are-blocked"
    )
}
