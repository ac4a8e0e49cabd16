use crate::im::message::models::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// 长连接事件名
pub mod event_name {
    pub const SEND_MESSAGE: &str = "send-message";
    pub const DELETE_MESSAGE: &str = "delete-message";
    pub const BLOCK_USER: &str = "block-user";
    pub const UNBLOCK_USER: &str = "unblock-user";
    pub const MARK_MESSAGES_READ: &str = "mark-messages-read";
}

// ========== 上行命令 ==========

/// send-message 载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub receiver_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub local_id: String,
}

/// delete-message 载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessagePayload {
    pub message_id: String,
    pub user_id: String,
    pub match_id: String,
}

/// block-user / unblock-user 载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPayload {
    pub blocked_user_id: String,
}

/// 客户端 -> 服务器命令，编码为 `{"event": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundCommand {
    SendMessage(SendMessagePayload),
    DeleteMessage(DeleteMessagePayload),
    BlockUser(BlockPayload),
    UnblockUser(BlockPayload),
    /// 载荷为会话（配对）ID
    MarkMessagesRead(String),
}

impl OutboundCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundCommand::SendMessage(_) => event_name::SEND_MESSAGE,
            OutboundCommand::DeleteMessage(_) => event_name::DELETE_MESSAGE,
            OutboundCommand::BlockUser(_) => event_name::BLOCK_USER,
            OutboundCommand::UnblockUser(_) => event_name::UNBLOCK_USER,
            OutboundCommand::MarkMessagesRead(_) => event_name::MARK_MESSAGES_READ,
        }
    }
}

// ========== 下行事件 ==========

/// message-error 载荷
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageErrorPayload {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub local_id: Option<String>,
}

/// message-deleted 载荷
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub message_id: String,
    #[serde(default)]
    pub receiver_id: String,
    pub user_id: String,
}

/// messages-read-by-receiver 载荷
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadByReceiverPayload {
    pub reader_id: String,
    pub sender_id: String,
}

/// message-marked-read 载荷
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMarkedReadPayload {
    pub message_id: String,
}

/// user-status-change 载荷
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserStatusPayload {
    pub id: String,
    pub online: bool,
}

/// block-success / unblock-success 载荷
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResultPayload {
    pub blocked_id: String,
}

/// you-are-blocked 载荷
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YouAreBlockedPayload {
    pub blocker_id: String,
}

/// 服务器 -> 客户端事件
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InboundEvent {
    ReceiveMessage(Message),
    /// 服务器确认的消息，`localId` 对应乐观插入的记录
    MessageSentSuccess(Message),
    MessageError(MessageErrorPayload),
    MessageDeleted(MessageDeletedPayload),
    MessagesReadByReceiver(ReadByReceiverPayload),
    MessageMarkedRead(MessageMarkedReadPayload),
    UserStatusChange(UserStatusPayload),
    BlockSuccess(BlockResultPayload),
    UnblockSuccess(BlockResultPayload),
    YouAreBlocked(YouAreBlockedPayload),
}

/// 传输层交给 binder 的事件（含连接状态变化）
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected(String),
    Inbound(InboundEvent),
}

// ========== HTTP ==========

/// 历史消息分页响应
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub has_more: bool,
}

/// 图片上传响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResp {
    #[serde(alias = "imageUrl")]
    pub url: String,
}

/// 通用 HTTP 响应处理函数：检查状态码后直接反序列化 body
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> anyhow::Result<T> {
    use anyhow::Context;

    let status = response.status();

    // 读取 body bytes（只能读取一次）
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, body_str));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    serde_json::from_slice::<T>(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::im::message::models::MessageStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// 本地回环 HTTP 服务：接受一次请求，返回固定状态码和 JSON body
    ///
    /// 返回 `(base_url, 请求头)`；请求头在响应写出后送达
    pub(crate) async fn serve_once(
        status: u16,
        body: &str,
    ) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = body.to_string();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status} Test\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            let _ = tx.send(head);
        });

        (format!("http://{addr}"), rx)
    }

    /// 读完请求头和 body（content-length 或 chunked），返回请求头
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return String::from_utf8_lossy(&buf).into_owned();
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok());
        let chunked = head.contains("transfer-encoding: chunked");

        loop {
            let body = &buf[head_end..];
            let done = match content_length {
                Some(len) => body.len() >= len,
                None if chunked => body.ends_with(b"0\r\n\r\n"),
                None => true,
            };
            if done {
                break;
            }
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        head
    }

    #[tokio::test]
    async fn non_success_status_is_an_error_with_the_body() {
        let (base, _) = serve_once(503, r#"{"error":"maintenance"}"#).await;
        let response = reqwest::get(format!("{base}/anything")).await.unwrap();
        let err = handle_http_response::<HistoryPage>(response, "测试")
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("503"));
        assert!(err.contains("maintenance"));
    }

    #[test]
    fn outbound_commands_use_event_envelope() {
        let cmd = OutboundCommand::SendMessage(SendMessagePayload {
            receiver_id: "u2".into(),
            content: Some("hi".into()),
            image_url: None,
            local_id: "L1".into(),
        });
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "send-message",
                "data": {"receiverId": "u2", "content": "hi", "localId": "L1"}
            })
        );
        assert_eq!(cmd.name(), event_name::SEND_MESSAGE);

        let read = serde_json::to_value(OutboundCommand::MarkMessagesRead("u2".into())).unwrap();
        assert_eq!(
            read,
            serde_json::json!({"event": "mark-messages-read", "data": "u2"})
        );
    }

    #[test]
    fn inbound_events_decode_by_name() {
        let ack: InboundEvent = serde_json::from_str(
            r#"{"event":"message-sent-success","data":{
                "id":"m1","localId":"L1","senderId":"u1","receiverId":"u2",
                "content":"hi","createdAt":"2024-05-01T10:00:00Z"}}"#,
        )
        .unwrap();
        match ack {
            InboundEvent::MessageSentSuccess(msg) => {
                assert_eq!(msg.local_id.as_deref(), Some("L1"));
                assert_eq!(msg.status, MessageStatus::Sent);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let blocked: InboundEvent =
            serde_json::from_str(r#"{"event":"you-are-blocked","data":{"blockerId":"u3"}}"#)
                .unwrap();
        assert_eq!(
            blocked,
            InboundEvent::YouAreBlocked(YouAreBlockedPayload {
                blocker_id: "u3".into()
            })
        );

        let err: InboundEvent =
            serde_json::from_str(r#"{"event":"message-error","data":{"error":"blocked"}}"#)
                .unwrap();
        assert_eq!(
            err,
            InboundEvent::MessageError(MessageErrorPayload {
                error: "blocked".into(),
                local_id: None
            })
        );
    }

    #[test]
    fn unknown_event_is_an_error_not_a_panic() {
        let parsed = serde_json::from_str::<InboundEvent>(r#"{"event":"typing","data":{}}"#);
        assert!(parsed.is_err());
    }
}
