//! 客户端组合根
//!
//! 持有配置、HTTP 客户端与监听器，并为当前登录身份维护一组运行时组件：
//! 消息存储、长连接会话、binder、history loader 以及事件分发任务。
//! 身份变化时整组销毁重建，旧会话不会继续为旧身份投递事件。

use crate::im::binder::{ActionConfirmer, CommandBinder, DenyAllConfirmer};
use crate::im::conversation::api::ConversationApi;
use crate::im::conversation::listener::{ConversationListener, EmptyConversationListener};
use crate::im::conversation::models::ConversationSummary;
use crate::im::conversation::projector::ConversationListProjector;
use crate::im::error::{SyncError, SyncResult};
use crate::im::history::{HistoryApi, HistoryLoader, HistoryLoaderConfig};
use crate::im::message::listener::{EmptyMessageListener, MessageListener};
use crate::im::message::store::{lock_store, MessageStore, SharedStore};
use crate::im::transport::{ConnectionState, ReconnectPolicy, TransportConfig, TransportSession};
use crate::im::upload::UploadApi;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// HTTP API 基础地址（roster、历史、上传）
    pub api_base_url: String,
    /// WebSocket 服务器 URL
    pub ws_url: String,
    /// 认证 token
    pub token: String,
    /// 压缩方式，"gzip" 或空字符串表示不压缩
    pub compression: String,
    /// 心跳间隔，需与服务器的存活检测匹配
    pub heartbeat_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// 重连延迟的随机抖动比例
    pub reconnect_jitter: f64,
    /// 发送确认超时，超时后消息转为 failed
    pub send_timeout: Duration,
    /// 历史消息每页条数
    pub history_page_size: usize,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(api_base_url: String, ws_url: String, token: String) -> Self {
        Self {
            api_base_url,
            ws_url,
            token,
            compression: "gzip".to_string(),
            heartbeat_interval: Duration::from_secs(25),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_jitter: 0.5,
            send_timeout: Duration::from_secs(15),
            history_page_size: 30,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            compress: self.compression == "gzip",
            heartbeat_interval: self.heartbeat_interval,
            reconnect: ReconnectPolicy {
                base_delay: self.reconnect_base_delay,
                max_delay: self.reconnect_max_delay,
                jitter: self.reconnect_jitter(),
            },
            ..TransportConfig::new(self.ws_url.clone(), self.token.clone())
        }
    }

    /// 配置的抖动比例非有限值时回退到默认值
    fn reconnect_jitter(&self) -> f64 {
        if self.reconnect_jitter.is_finite() {
            self.reconnect_jitter
        } else {
            warn!(
                "[Client] ⚠️ 无效的重连抖动比例 {}，使用默认值",
                self.reconnect_jitter
            );
            ReconnectPolicy::default().jitter
        }
    }

    pub fn history_config(&self) -> HistoryLoaderConfig {
        HistoryLoaderConfig {
            page_size: self.history_page_size,
        }
    }
}

/// 单个登录身份的运行时组件
struct IdentitySession {
    user_id: String,
    store: SharedStore,
    transport: Arc<TransportSession>,
    binder: CommandBinder,
    history: Arc<HistoryLoader>,
    event_loop: JoinHandle<()>,
}

impl IdentitySession {
    fn shutdown(&self) {
        self.transport.close();
        self.event_loop.abort();
    }
}

impl Drop for IdentitySession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 聊天客户端
pub struct ChatClient {
    config: ClientConfig,
    http: reqwest::Client,
    message_listener: Arc<dyn MessageListener>,
    conversation_listener: Arc<dyn ConversationListener>,
    confirmer: Arc<dyn ActionConfirmer>,
    session: Option<IdentitySession>,
}

impl ChatClient {
    /// 创建新的客户端（尚未绑定身份）
    pub fn new(config: ClientConfig) -> Result<Self> {
        // token 通过 default_headers 自动添加
        let http = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::HeaderName::from_static("token"),
                    reqwest::header::HeaderValue::from_str(&config.token)
                        .context("无效的 token")?,
                );
                headers
            })
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self {
            config,
            http,
            message_listener: Arc::new(EmptyMessageListener),
            conversation_listener: Arc::new(EmptyConversationListener),
            confirmer: Arc::new(DenyAllConfirmer),
            session: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 注册消息监听器（下次绑定身份时生效）
    pub fn set_message_listener(&mut self, listener: Arc<dyn MessageListener>) {
        self.message_listener = listener;
    }

    /// 注册会话监听器（下次绑定身份时生效）
    pub fn set_conversation_listener(&mut self, listener: Arc<dyn ConversationListener>) {
        self.conversation_listener = listener;
    }

    /// 注册拉黑确认器（下次绑定身份时生效）
    pub fn set_action_confirmer(&mut self, confirmer: Arc<dyn ActionConfirmer>) {
        self.confirmer = confirmer;
    }

    /// 确保存在绑定到 `user_id` 的会话
    ///
    /// 身份相同则复用；身份不同则销毁旧会话（连同其存储）后重建。
    /// 需在 tokio 运行时内调用。
    pub fn ensure_session(&mut self, user_id: &str) -> &CommandBinder {
        if let Some(old) = self.session.take_if(|s| s.user_id != user_id) {
            info!(
                "[Client] 🔄 身份变化: {} -> {}，销毁旧会话",
                old.user_id, user_id
            );
            old.shutdown();
        }
        let session = match self.session.take() {
            Some(session) => session,
            None => self.build_session(user_id),
        };
        &self.session.insert(session).binder
    }

    fn build_session(&self, user_id: &str) -> IdentitySession {
        info!("[Client] 🔗 为用户 {} 创建会话", user_id);
        let store = MessageStore::shared(user_id);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(TransportSession::open(
            self.config.transport_config(),
            user_id,
            events_tx,
        ));

        let history = Arc::new(
            HistoryLoader::new(
                Arc::new(HistoryApi::new(
                    self.http.clone(),
                    self.config.api_base_url.clone(),
                )),
                store.clone(),
                self.config.history_config(),
            )
            .with_read_receipts(transport.clone()),
        );

        let binder = CommandBinder::new(
            store.clone(),
            transport.clone(),
            Arc::new(ConversationApi::new(
                self.http.clone(),
                self.config.api_base_url.clone(),
                user_id.to_string(),
            )),
            Arc::new(UploadApi::new(
                self.http.clone(),
                self.config.api_base_url.clone(),
            )),
            self.config.send_timeout,
        )
        .with_confirmer(self.confirmer.clone())
        .with_history(history.clone())
        .with_message_listener(self.message_listener.clone())
        .with_conversation_listener(self.conversation_listener.clone());

        // 在内部启动事件分发任务
        let dispatcher = binder.clone();
        let event_loop = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                dispatcher.handle_event(event).await;
            }
            debug!("[Client] 事件通道关闭，分发任务结束");
        });

        IdentitySession {
            user_id: user_id.to_string(),
            store,
            transport,
            binder,
            history,
            event_loop,
        }
    }

    /// 登出：关闭长连接并丢弃该身份的全部内存状态
    pub fn sign_out(&mut self) {
        if let Some(session) = self.session.take() {
            info!("[Client] 👋 用户 {} 登出", session.user_id);
            session.shutdown();
        }
    }

    pub fn current_user(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user_id.as_str())
    }

    pub fn binder(&self) -> SyncResult<&CommandBinder> {
        self.session
            .as_ref()
            .map(|s| &s.binder)
            .ok_or(SyncError::NotSignedIn)
    }

    pub fn history(&self) -> SyncResult<Arc<HistoryLoader>> {
        self.session
            .as_ref()
            .map(|s| s.history.clone())
            .ok_or(SyncError::NotSignedIn)
    }

    pub fn store(&self) -> SyncResult<SharedStore> {
        self.session
            .as_ref()
            .map(|s| s.store.clone())
            .ok_or(SyncError::NotSignedIn)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map(|s| s.transport.state())
            .unwrap_or(ConnectionState::Closed)
    }

    /// 可见会话列表（`query` 按显示名称过滤）
    pub fn conversations(&self, query: Option<&str>) -> SyncResult<Vec<ConversationSummary>> {
        let store = self.store()?;
        let guard = lock_store(&store);
        Ok(ConversationListProjector::project(&guard, query))
    }

    /// 我拉黑的会话
    pub fn blocked_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        let store = self.store()?;
        let guard = lock_store(&store);
        Ok(ConversationListProjector::blocked(&guard))
    }

    pub fn total_unread(&self) -> SyncResult<usize> {
        let store = self.store()?;
        let guard = lock_store(&store);
        Ok(ConversationListProjector::total_unread(&guard))
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.sign_out();
    }
}
