//! 长连接会话
//!
//! 每个登录身份对应一个会话：后台任务负责建连、心跳、收发帧和无限次重连，
//! 下行事件与连接状态变化通过 mpsc 通道交给 binder。

use super::backoff::ReconnectPolicy;
use super::codec::{decode_binary, decode_payload, encode_command, DecodedFrame};
use crate::im::error::{SyncError, SyncResult};
use crate::im::types::{OutboundCommand, TransportEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 命令发送接口（binder 只依赖该 trait，便于替换为测试实现）
pub trait Transport: Send + Sync {
    /// 发出命令。未连接时同步返回 `TransportUnavailable`，命令不会排队
    fn emit(&self, command: OutboundCommand) -> SyncResult<()>;

    fn is_connected(&self) -> bool;
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// 第 n 次重连等待中
    Reconnecting(u32),
    Closed,
}

/// 传输层配置
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket 服务器 URL
    pub ws_url: String,
    /// 认证 token
    pub token: String,
    /// 上行帧是否 gzip 压缩
    pub compress: bool,
    /// 心跳间隔
    pub heartbeat_interval: Duration,
    /// 超过该时长未收到任何帧视为连接已死
    pub heartbeat_timeout: Duration,
    /// 单次建连超时
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl TransportConfig {
    pub fn new(ws_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            token: token.into(),
            compress: true,
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// 构建连接 URL，身份通过查询参数携带
    fn build_url(&self, user_id: &str) -> String {
        let sep = if self.ws_url.contains('?') { '&' } else { '?' };
        let mut url = format!("{}{}userId={}", self.ws_url, sep, user_id);
        if !self.token.is_empty() {
            url.push_str(&format!("&token={}", self.token));
        }
        if self.compress {
            url.push_str("&compression=gzip");
        }
        url
    }
}

/// 长连接会话句柄
///
/// drop 或 `close()` 后后台任务结束，不再重连。
pub struct TransportSession {
    user_id: String,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<OutboundCommand>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TransportSession {
    /// 为 `user_id` 打开会话（需在 tokio 运行时内调用）
    pub fn open(
        config: TransportConfig,
        user_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!("[Transport] 🔗 打开长连接会话 (user={})", user_id);
        let task = tokio::spawn(run_session(
            config,
            user_id.to_string(),
            state_tx,
            outbound_rx,
            shutdown_rx,
            events,
        ));

        Self {
            user_id: user_id.to_string(),
            state: state_rx,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 订阅连接状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// 主动关闭：发送 Close 帧并停止重连
    pub fn close(&self) {
        info!("[Transport] 👋 关闭长连接会话 (user={})", self.user_id);
        let _ = self.shutdown.send(true);
    }
}

impl Transport for TransportSession {
    fn emit(&self, command: OutboundCommand) -> SyncResult<()> {
        if !self.is_connected() {
            warn!(
                "[Transport] ⚠️ 未连接，命令被拒绝: {} (state={:?})",
                command.name(),
                self.state()
            );
            return Err(SyncError::TransportUnavailable);
        }
        debug!("[Transport] 📤 {}", command.name());
        self.outbound
            .send(command)
            .map_err(|_| SyncError::TransportUnavailable)
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// 单次连接结束的原因
enum PumpExit {
    Shutdown,
    Lost(String),
}

async fn run_session(
    config: TransportConfig,
    user_id: String,
    state_tx: watch::Sender<ConnectionState>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let url = config.build_url(&user_id);
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        debug!("[Transport] 连接 {} (attempt={})", config.ws_url, attempt);

        let connected = tokio::select! {
            r = timeout(config.connect_timeout, connect_async(url.as_str())) => r,
            _ = shutdown_rx.changed() => break,
        };

        match connected {
            Ok(Ok((ws_stream, response))) => {
                info!(
                    "[Transport] ✅ WebSocket 连接成功, 状态: {}",
                    response.status()
                );
                attempt = 0;
                state_tx.send_replace(ConnectionState::Connected);
                if events.send(TransportEvent::Connected).is_err() {
                    break;
                }

                let (write, read) = ws_stream.split();
                match pump(&config, write, read, &mut outbound_rx, &mut shutdown_rx, &events).await
                {
                    PumpExit::Shutdown => break,
                    PumpExit::Lost(reason) => {
                        warn!("[Transport] ⚠️ 连接断开: {}", reason);
                        state_tx.send_replace(ConnectionState::Reconnecting(1));
                        if events.send(TransportEvent::Disconnected(reason)).is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(Err(e)) => warn!("[Transport] ❌ 连接失败: {}", e),
            Err(_) => warn!(
                "[Transport] ❌ 连接超时 ({}s)",
                config.connect_timeout.as_secs()
            ),
        }

        let delay = config.reconnect.next_delay(attempt);
        attempt = attempt.saturating_add(1);
        state_tx.send_replace(ConnectionState::Reconnecting(attempt));
        info!(
            "[Transport] 🔄 {}ms 后第 {} 次重连",
            delay.as_millis(),
            attempt
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    state_tx.send_replace(ConnectionState::Closed);
    info!("[Transport] 会话结束 (user={})", user_id);
}

/// 单次连接的收发循环：下行帧、上行命令、心跳、关闭信号
async fn pump(
    config: &TransportConfig,
    mut write: WsWriter,
    mut read: WsReader,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundCommand>,
    shutdown_rx: &mut watch::Receiver<bool>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> PumpExit {
    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval 的第一次 tick 立即返回
    heartbeat.tick().await;
    let mut last_seen = Instant::now();
    let dead_after = config.heartbeat_interval + config.heartbeat_timeout;

    loop {
        tokio::select! {
            frame = read.next() => {
                last_seen = Instant::now();
                let decoded = match frame {
                    Some(Ok(WsMessage::Text(text))) => decode_payload(text.as_bytes()),
                    Some(Ok(WsMessage::Binary(data))) => decode_binary(&data),
                    Some(Ok(WsMessage::Close(frame))) => {
                        return PumpExit::Lost(format!("服务器关闭连接: {frame:?}"));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return PumpExit::Lost(format!("WebSocket 错误: {e}")),
                    None => return PumpExit::Lost("连接已结束".to_string()),
                };
                match decoded {
                    DecodedFrame::Event(event) => {
                        if events.send(TransportEvent::Inbound(event)).is_err() {
                            return PumpExit::Shutdown;
                        }
                    }
                    DecodedFrame::Unknown(name) => debug!("[Transport] 忽略未知事件: {}", name),
                    DecodedFrame::Malformed(e) => error!("[Transport] 下行帧解析失败: {}", e),
                }
            }
            command = outbound_rx.recv() => {
                let Some(command) = command else {
                    return PumpExit::Shutdown;
                };
                match encode_command(&command, config.compress) {
                    Ok(frame) => {
                        if let Err(e) = write.send(frame).await {
                            return PumpExit::Lost(format!("发送 {} 失败: {e}", command.name()));
                        }
                    }
                    Err(e) => error!("[Transport] 编码命令失败: {:#}", e),
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > dead_after {
                    return PumpExit::Lost("心跳超时".to_string());
                }
                debug!("[Transport] 💓 ping");
                if write.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    return PumpExit::Lost("心跳发送失败".to_string());
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return PumpExit::Shutdown;
            }
        }
    }
}
