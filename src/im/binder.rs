//! 命令 / 事件绑定层
//!
//! 用户操作在这里变成存储变更加上行命令，长连接下行事件在这里变成存储变更加监听器回调。
//! 除 history loader 外，这是唯一会修改消息存储的地方。

use crate::im::conversation::api::RosterSource;
use crate::im::conversation::listener::{ConversationListener, EmptyConversationListener};
use crate::im::conversation::projector::ConversationListProjector;
use crate::im::error::{SyncError, SyncResult};
use crate::im::history::HistoryLoader;
use crate::im::message::listener::{EmptyMessageListener, MessageListener};
use crate::im::message::models::Message;
use crate::im::message::store::{lock_store, IngestOutcome, SharedStore};
use crate::im::transport::Transport;
use crate::im::types::{
    BlockPayload, DeleteMessagePayload, InboundEvent, OutboundCommand, SendMessagePayload,
    TransportEvent,
};
use crate::im::upload::ImageUploader;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 需要用户确认的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmAction {
    Block(String),
    Unblock(String),
}

/// 用户确认接口（UI 弹窗）
#[async_trait]
pub trait ActionConfirmer: Send + Sync {
    async fn confirm(&self, action: &ConfirmAction) -> bool;
}

/// 默认确认器：一律拒绝
pub struct DenyAllConfirmer;

#[async_trait]
impl ActionConfirmer for DenyAllConfirmer {
    async fn confirm(&self, _action: &ConfirmAction) -> bool {
        false
    }
}

/// 一律同意（CLI `--yes` 使用）
pub struct AutoConfirmer;

#[async_trait]
impl ActionConfirmer for AutoConfirmer {
    async fn confirm(&self, _action: &ConfirmAction) -> bool {
        true
    }
}

/// 命令 / 事件绑定器
#[derive(Clone)]
pub struct CommandBinder {
    user_id: String,
    store: SharedStore,
    transport: Arc<dyn Transport>,
    roster: Arc<dyn RosterSource>,
    uploader: Arc<dyn ImageUploader>,
    confirmer: Arc<dyn ActionConfirmer>,
    history: Option<Arc<HistoryLoader>>,
    message_listener: Arc<dyn MessageListener>,
    conversation_listener: Arc<dyn ConversationListener>,
    active: Arc<Mutex<Option<String>>>,
    /// localId -> 发送次数，用于让旧的超时计时器失效
    send_attempts: Arc<Mutex<HashMap<String, u64>>>,
    send_timeout: Duration,
}

impl CommandBinder {
    pub fn new(
        store: SharedStore,
        transport: Arc<dyn Transport>,
        roster: Arc<dyn RosterSource>,
        uploader: Arc<dyn ImageUploader>,
        send_timeout: Duration,
    ) -> Self {
        let user_id = lock_store(&store).login_user_id().to_string();
        Self {
            user_id,
            store,
            transport,
            roster,
            uploader,
            confirmer: Arc::new(DenyAllConfirmer),
            history: None,
            message_listener: Arc::new(EmptyMessageListener),
            conversation_listener: Arc::new(EmptyConversationListener),
            active: Arc::new(Mutex::new(None)),
            send_attempts: Arc::new(Mutex::new(HashMap::new())),
            send_timeout,
        }
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn ActionConfirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn with_history(mut self, history: Arc<HistoryLoader>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_message_listener(mut self, listener: Arc<dyn MessageListener>) -> Self {
        self.message_listener = listener;
        self
    }

    pub fn with_conversation_listener(mut self, listener: Arc<dyn ConversationListener>) -> Self {
        self.conversation_listener = listener;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_active(&self, conversation_id: Option<String>) {
        *self.active.lock().unwrap_or_else(|p| p.into_inner()) = conversation_id;
    }

    fn is_active(&self, conversation_id: &str) -> bool {
        self.active_conversation().as_deref() == Some(conversation_id)
    }

    // ===================== 上行命令 =====================

    /// 发送消息：乐观插入后发出 send-message
    ///
    /// 连接不可用时消息被标记为 failed 并保留，返回值是最终的存储快照。
    pub async fn send(
        &self,
        receiver_id: &str,
        content: Option<String>,
        image_url: Option<String>,
    ) -> SyncResult<Message> {
        let draft = Message::outgoing(&self.user_id, receiver_id, content, image_url)?;
        let local_id = lock_store(&self.store).add_optimistic(draft);
        info!(
            "[Binder] 📤 发送消息: receiver={}, localId={}",
            receiver_id, local_id
        );
        self.dispatch_send(&local_id).await
    }

    /// 发送图片：先上传，上传失败时不创建任何消息
    pub async fn send_image(
        &self,
        receiver_id: &str,
        bytes: Vec<u8>,
        file_name: &str,
        caption: Option<String>,
    ) -> SyncResult<Message> {
        let url = self
            .uploader
            .upload_image(bytes, file_name)
            .await
            .map_err(|e| {
                error!("[Binder] ❌ 图片上传失败，取消发送: {:#}", e);
                SyncError::upload(e)
            })?;
        self.send(receiver_id, caption, Some(url)).await
    }

    /// 重试发送失败的消息（原位复用同一条记录和 localId）
    pub async fn retry(&self, local_id: &str) -> SyncResult<Message> {
        if lock_store(&self.store).mark_pending(local_id).is_none() {
            return Err(SyncError::MessageNotFound(local_id.to_string()));
        }
        info!("[Binder] 🔁 重试发送: localId={}", local_id);
        self.dispatch_send(local_id).await
    }

    /// 丢弃发送失败的消息
    pub async fn discard(&self, local_id: &str) -> SyncResult<()> {
        let removed = lock_store(&self.store).discard(local_id);
        if !removed {
            return Err(SyncError::MessageNotFound(local_id.to_string()));
        }
        self.attempts().remove(local_id);
        debug!("[Binder] 丢弃失败消息: localId={}", local_id);
        self.publish_conversations().await;
        Ok(())
    }

    /// 删除消息（仅对自己隐藏），本地在收到 message-deleted 后生效
    pub async fn delete(&self, message_id: &str, counterpart_id: &str) -> SyncResult<()> {
        self.transport
            .emit(OutboundCommand::DeleteMessage(DeleteMessagePayload {
                message_id: message_id.to_string(),
                user_id: self.user_id.clone(),
                match_id: counterpart_id.to_string(),
            }))
    }

    /// 拉黑对端；用户未确认时返回 `Ok(false)` 且不发出命令
    pub async fn block(&self, counterpart_id: &str) -> SyncResult<bool> {
        let action = ConfirmAction::Block(counterpart_id.to_string());
        if !self.confirmer.confirm(&action).await {
            info!("[Binder] 用户取消拉黑: {}", counterpart_id);
            return Ok(false);
        }
        self.transport.emit(OutboundCommand::BlockUser(BlockPayload {
            blocked_user_id: counterpart_id.to_string(),
        }))?;
        Ok(true)
    }

    /// 取消拉黑；用户未确认时返回 `Ok(false)` 且不发出命令
    pub async fn unblock(&self, counterpart_id: &str) -> SyncResult<bool> {
        let action = ConfirmAction::Unblock(counterpart_id.to_string());
        if !self.confirmer.confirm(&action).await {
            info!("[Binder] 用户取消解除拉黑: {}", counterpart_id);
            return Ok(false);
        }
        self.transport.emit(OutboundCommand::UnblockUser(BlockPayload {
            blocked_user_id: counterpart_id.to_string(),
        }))?;
        Ok(true)
    }

    /// 将会话设为当前打开的会话：重置历史加载并标记已读
    pub async fn open_conversation(&self, conversation_id: &str) -> SyncResult<usize> {
        info!("[Binder] 打开会话: {}", conversation_id);
        self.set_active(Some(conversation_id.to_string()));
        if let Some(history) = &self.history {
            history.open(conversation_id);
        }
        self.mark_read(conversation_id).await
    }

    pub fn close_conversation(&self) {
        if let Some(previous) = self.active_conversation() {
            debug!("[Binder] 关闭会话: {}", previous);
        }
        self.set_active(None);
        if let Some(history) = &self.history {
            history.close();
        }
    }

    /// 标记会话已读：本地幂等更新并发出 mark-messages-read
    ///
    /// 命令发送失败不影响本地状态。
    pub async fn mark_read(&self, conversation_id: &str) -> SyncResult<usize> {
        let changed = lock_store(&self.store).mark_conversation_read(conversation_id, Utc::now());
        if let Err(e) = self
            .transport
            .emit(OutboundCommand::MarkMessagesRead(conversation_id.to_string()))
        {
            warn!(
                "[Binder] ⚠️ 已读回执未发出: conversation={}: {}",
                conversation_id, e
            );
        }
        if changed > 0 {
            self.publish_conversations().await;
        }
        Ok(changed)
    }

    /// 清空会话的已加载消息
    pub async fn purge_conversation(&self, conversation_id: &str) -> usize {
        let removed = lock_store(&self.store).purge_conversation(conversation_id);
        info!(
            "[Binder] 🗑️ 清空会话消息: conversation={}, removed={}",
            conversation_id, removed
        );
        self.publish_conversations().await;
        removed
    }

    /// 刷新 roster：按 id 合并会话记录，写入各会话最新消息
    pub async fn refresh_roster(&self) -> SyncResult<()> {
        self.conversation_listener.on_sync_server_start().await;

        let entries = match self.roster.fetch_roster().await {
            Ok(entries) => entries,
            Err(e) => {
                error!("[Roster] ❌ 会话列表同步失败: {:#}", e);
                self.conversation_listener
                    .on_sync_server_failed(format!("{e:#}"))
                    .await;
                return Err(SyncError::Http(format!("{e:#}")));
            }
        };
        let latest = match self.roster.fetch_latest_messages().await {
            Ok(latest) => latest,
            Err(e) => {
                // 预览缺失不影响列表本身
                warn!("[Roster] ⚠️ 拉取最新消息失败: {:#}", e);
                Vec::new()
            }
        };

        {
            let mut store = lock_store(&self.store);
            store.set_conversations(entries);
            for msg in latest {
                store.ingest(msg);
            }
        }

        // 打开的会话不累计未读
        if let Some(active) = self.active_conversation() {
            if lock_store(&self.store).unread_count_for(&active) > 0 {
                self.mark_read(&active).await?;
            }
        }

        info!("[Roster] ✅ 会话列表同步完成");
        self.conversation_listener.on_sync_server_finish().await;
        self.publish_conversations().await;
        Ok(())
    }

    /// 后台刷新 roster（事件处理不等待 HTTP）
    pub fn spawn_roster_refresh(&self) {
        let binder = self.clone();
        tokio::spawn(async move {
            let _ = binder.refresh_roster().await;
        });
    }

    // ===================== 下行事件 =====================

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("[Binder] ✅ 长连接已建立");
                self.message_listener
                    .on_connection_status_changed(true, "连接成功".to_string())
                    .await;
                self.spawn_roster_refresh();
            }
            TransportEvent::Disconnected(reason) => {
                warn!("[Binder] ⚠️ 长连接断开: {}", reason);
                self.message_listener
                    .on_connection_status_changed(false, reason)
                    .await;
            }
            TransportEvent::Inbound(event) => self.handle_inbound(event).await,
        }
    }

    async fn handle_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::ReceiveMessage(msg) => self.on_receive_message(msg).await,
            InboundEvent::MessageSentSuccess(msg) => self.on_sent_success(msg).await,
            InboundEvent::MessageError(payload) => {
                warn!(
                    "[Binder] ❌ 服务器拒绝发送: {} (localId={:?})",
                    payload.error, payload.local_id
                );
                let Some(local_id) = payload.local_id else {
                    return;
                };
                let failed = {
                    let mut store = lock_store(&self.store);
                    if store.mark_failed(&local_id) {
                        store.message_by_local_id(&local_id).cloned()
                    } else {
                        None
                    }
                };
                if let Some(msg) = failed {
                    self.settle_attempt(&local_id);
                    self.message_listener
                        .on_send_failed(msg.clone(), SyncError::SendRejected(payload.error))
                        .await;
                    self.message_listener.on_message_status_changed(msg).await;
                }
            }
            InboundEvent::MessageDeleted(payload) => {
                let conversation_id = {
                    let mut store = lock_store(&self.store);
                    if !store.record_deletion(&payload.message_id, &payload.user_id) {
                        debug!("[Binder] 删除的消息未加载: {}", payload.message_id);
                    }
                    store
                        .message_by_id(&payload.message_id)
                        .map(|m| m.conversation_key(&self.user_id).to_string())
                        .unwrap_or(payload.receiver_id)
                };
                if payload.user_id == self.user_id {
                    self.message_listener
                        .on_msg_deleted(conversation_id, payload.message_id)
                        .await;
                    self.publish_conversations().await;
                }
            }
            InboundEvent::MessagesReadByReceiver(payload) => {
                if payload.sender_id != self.user_id {
                    return;
                }
                let changed =
                    lock_store(&self.store).apply_read_receipt(&payload.reader_id, Utc::now());
                debug!(
                    "[Binder] 对端已读: reader={}, changed={}",
                    payload.reader_id, changed
                );
                self.message_listener
                    .on_recv_c2c_read_receipt(payload.reader_id)
                    .await;
            }
            InboundEvent::MessageMarkedRead(payload) => {
                if lock_store(&self.store).mark_message_read(&payload.message_id, Utc::now()) {
                    self.publish_conversations().await;
                }
            }
            InboundEvent::UserStatusChange(payload) => {
                let changed = lock_store(&self.store).update_presence(&payload.id, payload.online);
                if changed {
                    self.conversation_listener
                        .on_user_status_changed(payload.id, payload.online)
                        .await;
                    self.publish_conversations().await;
                }
            }
            InboundEvent::BlockSuccess(payload) => {
                info!("[Binder] 🚫 拉黑成功: {}", payload.blocked_id);
                lock_store(&self.store).update_block_status(&payload.blocked_id, true);
                if self.is_active(&payload.blocked_id) {
                    self.close_active(&payload.blocked_id).await;
                }
                self.conversation_listener
                    .on_block_status_changed(payload.blocked_id, true)
                    .await;
                self.publish_conversations().await;
                self.spawn_roster_refresh();
            }
            InboundEvent::UnblockSuccess(payload) => {
                info!("[Binder] ✅ 解除拉黑成功: {}", payload.blocked_id);
                lock_store(&self.store).update_block_status(&payload.blocked_id, false);
                self.conversation_listener
                    .on_block_status_changed(payload.blocked_id, false)
                    .await;
                self.publish_conversations().await;
                self.spawn_roster_refresh();
            }
            InboundEvent::YouAreBlocked(payload) => {
                warn!("[Binder] 🚫 被对端拉黑: {}", payload.blocker_id);
                lock_store(&self.store).set_blocked_me(&payload.blocker_id, true);
                if self.is_active(&payload.blocker_id) {
                    self.close_active(&payload.blocker_id).await;
                }
                self.publish_conversations().await;
                self.spawn_roster_refresh();
            }
        }
    }

    async fn on_receive_message(&self, msg: Message) {
        let conversation_id = msg.conversation_key(&self.user_id).to_string();
        let from_counterpart = !msg.is_from(&self.user_id);
        let outcome = lock_store(&self.store).ingest(msg.clone());

        match outcome {
            IngestOutcome::Inserted => {
                debug!(
                    "[Binder] 📥 新消息: conversation={}, id={:?}",
                    conversation_id, msg.id
                );
                // 当前打开的会话不累计未读
                if from_counterpart && self.is_active(&conversation_id) {
                    let _ = self.mark_read(&conversation_id).await;
                }
                self.message_listener.on_recv_new_message(msg).await;
                self.publish_conversations().await;
            }
            IngestOutcome::Reconciled => {
                if let Some(local_id) = msg.local_id.as_deref() {
                    self.settle_attempt(local_id);
                    self.notify_status(local_id).await;
                }
                self.publish_conversations().await;
            }
            IngestOutcome::Duplicate | IngestOutcome::Ignored => {}
        }
    }

    async fn on_sent_success(&self, msg: Message) {
        let reconciled = match msg.local_id.clone() {
            Some(local_id) => {
                let ok = lock_store(&self.store).reconcile(&local_id, msg.clone());
                if ok {
                    self.settle_attempt(&local_id);
                    self.notify_status(&local_id).await;
                }
                ok
            }
            None => false,
        };
        if !reconciled {
            // 其他端发出的或本地已丢弃的消息，按普通消息写入
            lock_store(&self.store).ingest(msg);
        }
        self.publish_conversations().await;
    }

    async fn close_active(&self, conversation_id: &str) {
        self.close_conversation();
        self.conversation_listener
            .on_active_conversation_closed(conversation_id.to_string())
            .await;
    }

    // ===================== 内部辅助 =====================

    async fn dispatch_send(&self, local_id: &str) -> SyncResult<Message> {
        let snapshot = lock_store(&self.store)
            .message_by_local_id(local_id)
            .cloned()
            .ok_or_else(|| SyncError::MessageNotFound(local_id.to_string()))?;

        let command = OutboundCommand::SendMessage(SendMessagePayload {
            receiver_id: snapshot.receiver_id.clone(),
            content: snapshot.content.clone(),
            image_url: snapshot.image_url.clone(),
            local_id: local_id.to_string(),
        });

        match self.transport.emit(command) {
            Ok(()) => {
                self.arm_send_timeout(local_id);
                self.message_listener
                    .on_message_status_changed(snapshot.clone())
                    .await;
                self.publish_conversations().await;
                Ok(snapshot)
            }
            Err(e) => {
                warn!("[Binder] ❌ 发送失败，标记为 failed: localId={}: {}", local_id, e);
                let rejected = {
                    let mut store = lock_store(&self.store);
                    store.mark_failed(local_id);
                    store.message_by_local_id(local_id).cloned()
                };
                if let Some(msg) = rejected {
                    self.message_listener.on_send_failed(msg, e).await;
                }
                let failed = self.notify_status(local_id).await;
                self.publish_conversations().await;
                failed.ok_or_else(|| SyncError::MessageNotFound(local_id.to_string()))
            }
        }
    }

    fn attempts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.send_attempts.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn settle_attempt(&self, local_id: &str) {
        self.attempts().remove(local_id);
    }

    /// 到期仍为 pending 时转为 failed；重试会让之前的计时器失效
    fn arm_send_timeout(&self, local_id: &str) {
        let attempt = {
            let mut attempts = self.attempts();
            let counter = attempts.entry(local_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let binder = self.clone();
        let local_id = local_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(binder.send_timeout).await;
            if binder.attempts().get(&local_id) != Some(&attempt) {
                return;
            }
            binder.settle_attempt(&local_id);
            let timed_out = lock_store(&binder.store).mark_failed(&local_id);
            if timed_out {
                warn!(
                    "[Binder] ⏰ 发送超时 ({}s)，标记为 failed: localId={}",
                    binder.send_timeout.as_secs(),
                    local_id
                );
                binder.notify_status(&local_id).await;
            }
        });
    }

    async fn notify_status(&self, local_id: &str) -> Option<Message> {
        let snapshot = lock_store(&self.store).message_by_local_id(local_id).cloned();
        if let Some(msg) = &snapshot {
            self.message_listener
                .on_message_status_changed(msg.clone())
                .await;
        }
        snapshot
    }

    async fn publish_conversations(&self) {
        let (list, total) = {
            let store = lock_store(&self.store);
            (
                ConversationListProjector::project(&store, None),
                ConversationListProjector::total_unread(&store),
            )
        };
        self.conversation_listener.on_conversation_changed(list).await;
        self.conversation_listener
            .on_total_unread_message_count_changed(total)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::conversation::models::{ConversationSummary, RosterItem};
    use crate::im::message::models::MessageStatus;
    use crate::im::message::store::tests::server_msg;
    use crate::im::message::store::MessageStore;
    use crate::im::types::{
        BlockResultPayload, MessageDeletedPayload, MessageErrorPayload, ReadByReceiverPayload,
        YouAreBlockedPayload,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Once;

    static INIT_LOGGER: Once = Once::new();

    fn init_test_logger() {
        INIT_LOGGER.call_once(|| {
            use tracing_subscriber::prelude::*;
            use tracing_subscriber::EnvFilter;

            let filter_layer = EnvFilter::new("info,restochat_sdk_core=debug");
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_test_writer();
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init();
        });
    }

    #[derive(Default)]
    struct FakeTransport {
        connected: AtomicBool,
        sent: Mutex<Vec<OutboundCommand>>,
    }

    impl FakeTransport {
        fn online() -> Arc<Self> {
            let t = Self::default();
            t.connected.store(true, Ordering::SeqCst);
            Arc::new(t)
        }

        fn sent(&self) -> Vec<OutboundCommand> {
            self.sent.lock().unwrap().clone()
        }

        fn read_receipts(&self) -> usize {
            self.sent()
                .iter()
                .filter(|c| matches!(c, OutboundCommand::MarkMessagesRead(_)))
                .count()
        }
    }

    impl Transport for FakeTransport {
        fn emit(&self, command: OutboundCommand) -> SyncResult<()> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(SyncError::TransportUnavailable);
            }
            self.sent.lock().unwrap().push(command);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    /// 模拟服务器上的 roster 状态
    #[derive(Default)]
    struct FakeRoster {
        entries: Mutex<Vec<RosterItem>>,
        latest: Mutex<Vec<Message>>,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RosterSource for FakeRoster {
        async fn fetch_roster(&self) -> anyhow::Result<Vec<RosterItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("HTTP 错误 503");
            }
            Ok(self.entries.lock().unwrap().clone())
        }

        async fn fetch_latest_messages(&self) -> anyhow::Result<Vec<Message>> {
            Ok(self.latest.lock().unwrap().clone())
        }
    }

    struct FakeUploader {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageUploader for FakeUploader {
        async fn upload_image(&self, _bytes: Vec<u8>, file_name: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("HTTP 错误 413");
            }
            Ok(format!("https://cdn.test/{file_name}"))
        }
    }

    struct Answer(bool);

    #[async_trait]
    impl ActionConfirmer for Answer {
        async fn confirm(&self, _action: &ConfirmAction) -> bool {
            self.0
        }
    }

    #[derive(Default)]
    struct RecordingConversationListener {
        closed: Mutex<Vec<String>>,
        totals: Mutex<Vec<usize>>,
        lists: Mutex<Vec<Vec<ConversationSummary>>>,
    }

    #[async_trait]
    impl ConversationListener for RecordingConversationListener {
        async fn on_sync_server_start(&self) {}
        async fn on_sync_server_finish(&self) {}
        async fn on_sync_server_failed(&self, _error: String) {}
        async fn on_conversation_changed(&self, conversation_list: Vec<ConversationSummary>) {
            self.lists.lock().unwrap().push(conversation_list);
        }
        async fn on_total_unread_message_count_changed(&self, total_unread_count: usize) {
            self.totals.lock().unwrap().push(total_unread_count);
        }
        async fn on_user_status_changed(&self, _user_id: String, _online: bool) {}
        async fn on_block_status_changed(&self, _user_id: String, _blocked: bool) {}
        async fn on_active_conversation_closed(&self, conversation_id: String) {
            self.closed.lock().unwrap().push(conversation_id);
        }
    }

    /// 记录发送失败原因
    #[derive(Default)]
    struct RecordingMessageListener {
        failures: Mutex<Vec<(Option<String>, String)>>,
    }

    #[async_trait]
    impl MessageListener for RecordingMessageListener {
        async fn on_recv_new_message(&self, _message: Message) {}
        async fn on_message_status_changed(&self, _message: Message) {}
        async fn on_send_failed(&self, message: Message, error: SyncError) {
            let cause = match error {
                SyncError::TransportUnavailable => "transport".to_string(),
                SyncError::SendRejected(reason) => format!("rejected: {reason}"),
                other => other.to_string(),
            };
            self.failures.lock().unwrap().push((message.local_id, cause));
        }
        async fn on_msg_deleted(&self, _conversation_id: String, _message_id: String) {}
        async fn on_recv_c2c_read_receipt(&self, _reader_id: String) {}
        async fn on_connection_status_changed(&self, _connected: bool, _message: String) {}
    }

    struct Harness {
        binder: CommandBinder,
        store: SharedStore,
        transport: Arc<FakeTransport>,
        roster: Arc<FakeRoster>,
        listener: Arc<RecordingConversationListener>,
    }

    fn harness_with(transport: Arc<FakeTransport>, send_timeout: Duration) -> Harness {
        init_test_logger();
        let store = MessageStore::shared("u1");
        let entries = vec![
            RosterItem::new("u2", "Ana"),
            RosterItem::new("u3", "Beto"),
        ];
        lock_store(&store).set_conversations(entries.clone());
        let roster = Arc::new(FakeRoster::default());
        *roster.entries.lock().unwrap() = entries;
        let listener = Arc::new(RecordingConversationListener::default());

        let binder = CommandBinder::new(
            store.clone(),
            transport.clone(),
            roster.clone(),
            Arc::new(FakeUploader {
                fail: false,
                calls: AtomicUsize::new(0),
            }),
            send_timeout,
        )
        .with_confirmer(Arc::new(Answer(true)))
        .with_conversation_listener(listener.clone());

        Harness {
            binder,
            store,
            transport,
            roster,
            listener,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeTransport::online(), Duration::from_secs(15))
    }

    fn ack(local_id: &str, id: &str, to: &str) -> Message {
        let mut msg = server_msg(id, "u1", to, 100);
        msg.content = Some("hi".into());
        msg.local_id = Some(local_id.to_string());
        msg
    }

    fn sent_local_id(transport: &FakeTransport) -> String {
        transport
            .sent()
            .iter()
            .rev()
            .find_map(|c| match c {
                OutboundCommand::SendMessage(p) => Some(p.local_id.clone()),
                _ => None,
            })
            .expect("no send-message emitted")
    }

    #[tokio::test]
    async fn optimistic_round_trip_reconciles_in_place() {
        let h = harness();
        let pending = h.binder.send("u2", Some("hi".into()), None).await.unwrap();

        assert_eq!(pending.status, MessageStatus::Pending);
        let local_id = pending.local_id.clone().unwrap();
        assert_eq!(sent_local_id(&h.transport), local_id);
        assert_eq!(lock_store(&h.store).messages("u2").len(), 1);

        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::MessageSentSuccess(ack(
                &local_id, "m1", "u2",
            ))))
            .await;

        let msgs = lock_store(&h.store).messages("u2");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id.as_deref(), Some("m1"));
        assert_eq!(msgs[0].status, MessageStatus::Sent);

        // 推送回显同一条消息不会产生第二条
        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::ReceiveMessage(ack(
                &local_id, "m1", "u2",
            ))))
            .await;
        assert_eq!(lock_store(&h.store).messages("u2").len(), 1);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_insert() {
        let h = harness();
        let err = h
            .binder
            .send("u2", Some("   ".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::EmptyMessage));
        assert!(lock_store(&h.store).messages("u2").is_empty());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_send_stays_visible_and_can_be_retried() {
        let h = harness_with(Arc::new(FakeTransport::default()), Duration::from_secs(15));

        let failed = h.binder.send("u2", Some("hi".into()), None).await.unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        let msgs = lock_store(&h.store).messages("u2");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].status, MessageStatus::Failed);

        h.transport.connected.store(true, Ordering::SeqCst);
        let local_id = failed.local_id.unwrap();
        let retried = h.binder.retry(&local_id).await.unwrap();
        assert_eq!(retried.status, MessageStatus::Pending);
        assert_eq!(sent_local_id(&h.transport), local_id);
        assert_eq!(lock_store(&h.store).messages("u2").len(), 1);

        // pending 记录不能被丢弃
        assert!(matches!(
            h.binder.discard(&local_id).await,
            Err(SyncError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn server_error_marks_failed_and_discard_removes() {
        let h = harness();
        let pending = h.binder.send("u2", Some("hi".into()), None).await.unwrap();
        let local_id = pending.local_id.unwrap();

        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::MessageError(
                MessageErrorPayload {
                    error: "blocked".into(),
                    local_id: Some(local_id.clone()),
                },
            )))
            .await;
        assert_eq!(
            lock_store(&h.store).message_by_local_id(&local_id).unwrap().status,
            MessageStatus::Failed
        );

        h.binder.discard(&local_id).await.unwrap();
        assert!(lock_store(&h.store).messages("u2").is_empty());
    }

    #[tokio::test]
    async fn unacknowledged_send_times_out_and_late_ack_still_reconciles() {
        let h = harness_with(FakeTransport::online(), Duration::from_millis(30));
        let pending = h.binder.send("u2", Some("hi".into()), None).await.unwrap();
        let local_id = pending.local_id.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            lock_store(&h.store).message_by_local_id(&local_id).unwrap().status,
            MessageStatus::Failed
        );

        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::MessageSentSuccess(ack(
                &local_id, "m9", "u2",
            ))))
            .await;
        let msgs = lock_store(&h.store).messages("u2");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].status, MessageStatus::Sent);
        assert_eq!(msgs[0].id.as_deref(), Some("m9"));
    }

    #[tokio::test]
    async fn acknowledged_send_does_not_time_out() {
        let h = harness_with(FakeTransport::online(), Duration::from_millis(30));
        let pending = h.binder.send("u2", Some("hi".into()), None).await.unwrap();
        let local_id = pending.local_id.unwrap();
        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::MessageSentSuccess(ack(
                &local_id, "m1", "u2",
            ))))
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            lock_store(&h.store).messages("u2")[0].status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn unread_accrues_only_outside_the_active_conversation() {
        let h = harness();
        h.binder.open_conversation("u2").await.unwrap();
        assert_eq!(h.transport.read_receipts(), 1);

        let receive = |id: &str, from: &str| {
            TransportEvent::Inbound(InboundEvent::ReceiveMessage(server_msg(id, from, "u1", 10)))
        };

        h.binder.handle_event(receive("m1", "u3")).await;
        assert_eq!(lock_store(&h.store).unread_count_for("u3"), 1);
        assert_eq!(h.transport.read_receipts(), 1);

        h.binder.handle_event(receive("m2", "u2")).await;
        assert_eq!(lock_store(&h.store).unread_count_for("u2"), 0);
        assert_eq!(h.transport.read_receipts(), 2);

        // 重复投递不再发已读回执
        h.binder.handle_event(receive("m2", "u2")).await;
        assert_eq!(h.transport.read_receipts(), 2);

        assert_eq!(h.listener.totals.lock().unwrap().last(), Some(&1));

        h.binder.open_conversation("u3").await.unwrap();
        assert_eq!(lock_store(&h.store).unread_count_for("u3"), 0);
        assert_eq!(h.listener.totals.lock().unwrap().last(), Some(&0));
    }

    #[tokio::test]
    async fn block_hides_conversation_and_unblock_restores_history() {
        let h = harness();
        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::ReceiveMessage(
                server_msg("m1", "u3", "u1", 10),
            )))
            .await;

        assert!(h.binder.block("u3").await.unwrap());
        assert!(matches!(
            h.transport.sent().last(),
            Some(OutboundCommand::BlockUser(p)) if p.blocked_user_id == "u3"
        ));

        // 服务器侧状态随之变化
        h.roster.entries.lock().unwrap()[1].is_blocked_by_me = Some(true);
        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::BlockSuccess(
                BlockResultPayload {
                    blocked_id: "u3".into(),
                },
            )))
            .await;

        {
            let store = lock_store(&h.store);
            assert!(store.is_blocked_by_me("u3"));
            let visible = ConversationListProjector::project(&store, None);
            assert!(visible.iter().all(|c| c.id != "u3"));
            assert_eq!(store.messages("u3").len(), 1);
        }

        assert!(h.binder.unblock("u3").await.unwrap());
        h.roster.entries.lock().unwrap()[1].is_blocked_by_me = Some(false);
        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::UnblockSuccess(
                BlockResultPayload {
                    blocked_id: "u3".into(),
                },
            )))
            .await;

        let store = lock_store(&h.store);
        assert!(!store.is_blocked_by_me("u3"));
        let visible = ConversationListProjector::project(&store, None);
        let u3 = visible.iter().find(|c| c.id == "u3").unwrap();
        assert_eq!(u3.last_message_preview.as_deref(), Some("body of m1"));
    }

    #[tokio::test]
    async fn roster_feed_without_block_flags_keeps_conversation_hidden() {
        let h = harness();
        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::BlockSuccess(
                BlockResultPayload {
                    blocked_id: "u3".into(),
                },
            )))
            .await;

        // 服务器 roster 不回传拉黑标记
        h.binder.refresh_roster().await.unwrap();

        let store = lock_store(&h.store);
        assert!(store.is_blocked_by_me("u3"));
        let visible: Vec<String> = ConversationListProjector::project(&store, None)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(visible, vec!["u2".to_string()]);
        let blocked = ConversationListProjector::blocked(&store);
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].id, "u3");
    }

    #[tokio::test]
    async fn block_requires_confirmation() {
        let h = harness();
        let binder = h.binder.clone().with_confirmer(Arc::new(DenyAllConfirmer));
        assert!(!binder.block("u3").await.unwrap());
        assert!(!binder.unblock("u3").await.unwrap());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn being_blocked_closes_the_open_conversation() {
        let h = harness();
        h.binder.open_conversation("u2").await.unwrap();

        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::YouAreBlocked(
                YouAreBlockedPayload {
                    blocker_id: "u2".into(),
                },
            )))
            .await;

        assert_eq!(h.binder.active_conversation(), None);
        assert_eq!(*h.listener.closed.lock().unwrap(), vec!["u2".to_string()]);
        let last_list = h.listener.lists.lock().unwrap().last().cloned().unwrap();
        assert!(last_list.iter().all(|c| c.id != "u2"));
    }

    #[tokio::test]
    async fn deletion_hides_only_for_the_deleting_user() {
        let h = harness();
        for (id, from) in [("m1", "u2"), ("m2", "u1")] {
            let to = if from == "u1" { "u2" } else { "u1" };
            lock_store(&h.store).ingest(server_msg(id, from, to, 10));
        }

        h.binder.delete("m1", "u2").await.unwrap();
        assert!(matches!(
            h.transport.sent().last(),
            Some(OutboundCommand::DeleteMessage(p)) if p.message_id == "m1" && p.match_id == "u2"
        ));

        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::MessageDeleted(
                MessageDeletedPayload {
                    message_id: "m1".into(),
                    receiver_id: "u1".into(),
                    user_id: "u1".into(),
                },
            )))
            .await;
        // 对端删除自己的视图不影响我
        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::MessageDeleted(
                MessageDeletedPayload {
                    message_id: "m2".into(),
                    receiver_id: "u2".into(),
                    user_id: "u2".into(),
                },
            )))
            .await;

        let visible: Vec<String> = lock_store(&h.store)
            .visible_messages("u2")
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        assert_eq!(visible, vec!["m2".to_string()]);
    }

    #[tokio::test]
    async fn read_receipt_updates_my_sent_messages() {
        let h = harness();
        lock_store(&h.store).ingest(server_msg("m1", "u1", "u2", 10));
        lock_store(&h.store).ingest(server_msg("m2", "u2", "u1", 11));

        h.binder
            .handle_event(TransportEvent::Inbound(InboundEvent::MessagesReadByReceiver(
                ReadByReceiverPayload {
                    reader_id: "u2".into(),
                    sender_id: "u1".into(),
                },
            )))
            .await;

        let store = lock_store(&h.store);
        assert!(store.message_by_id("m1").unwrap().read_at.is_some());
        assert!(store.message_by_id("m2").unwrap().read_at.is_none());
    }

    #[tokio::test]
    async fn image_upload_failure_creates_no_message() {
        let h = harness();
        let binder = CommandBinder::new(
            h.store.clone(),
            h.transport.clone(),
            h.roster.clone(),
            Arc::new(FakeUploader {
                fail: true,
                calls: AtomicUsize::new(0),
            }),
            Duration::from_secs(15),
        );
        let err = binder
            .send_image("u2", vec![1, 2, 3], "a.png", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Upload(_)));
        assert!(lock_store(&h.store).messages("u2").is_empty());
        assert!(h.transport.sent().is_empty());

        let msg = h
            .binder
            .send_image("u2", vec![1, 2, 3], "a.png", Some("look".into()))
            .await
            .unwrap();
        assert_eq!(msg.image_url.as_deref(), Some("https://cdn.test/a.png"));
        assert_eq!(msg.content.as_deref(), Some("look"));
    }

    #[tokio::test]
    async fn roster_refresh_merges_entries_and_latest_messages() {
        let h = harness();
        h.roster
            .entries
            .lock()
            .unwrap()
            .push(RosterItem::new("u4", "Carla"));
        *h.roster.latest.lock().unwrap() = vec![server_msg("m7", "u4", "u1", 50)];

        h.binder.refresh_roster().await.unwrap();
        {
            let store = lock_store(&h.store);
            assert_eq!(store.conversations().len(), 3);
            assert_eq!(store.messages("u4").len(), 1);
        }

        // 失败时保留旧数据
        h.roster.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.binder.refresh_roster().await,
            Err(SyncError::Http(_))
        ));
        assert_eq!(lock_store(&h.store).conversations().len(), 3);
        assert_eq!(h.roster.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn roster_refresh_does_not_accrue_unread_in_the_open_conversation() {
        let h = harness();
        h.binder.open_conversation("u2").await.unwrap();
        assert_eq!(h.transport.read_receipts(), 1);

        *h.roster.latest.lock().unwrap() = vec![server_msg("m5", "u2", "u1", 50)];
        h.binder.refresh_roster().await.unwrap();
        assert_eq!(lock_store(&h.store).unread_count_for("u2"), 0);
        assert_eq!(h.transport.read_receipts(), 2);
        assert_eq!(h.listener.totals.lock().unwrap().last(), Some(&0));

        // 重复拉取同一条消息不会再发回执
        h.binder.refresh_roster().await.unwrap();
        assert_eq!(h.transport.read_receipts(), 2);

        // 未打开的会话照常累计
        *h.roster.latest.lock().unwrap() = vec![server_msg("m6", "u3", "u1", 60)];
        h.binder.refresh_roster().await.unwrap();
        assert_eq!(lock_store(&h.store).unread_count_for("u3"), 1);
        assert_eq!(h.transport.read_receipts(), 2);
    }

    #[tokio::test]
    async fn send_failures_report_their_cause() {
        let transport = Arc::new(FakeTransport::default());
        let h = harness_with(transport.clone(), Duration::from_secs(15));
        let messages = Arc::new(RecordingMessageListener::default());
        let binder = h.binder.clone().with_message_listener(messages.clone());

        let offline = binder.send("u2", Some("a".into()), None).await.unwrap();
        assert_eq!(offline.status, MessageStatus::Failed);

        transport.connected.store(true, Ordering::SeqCst);
        let pending = binder.send("u2", Some("b".into()), None).await.unwrap();
        let local_id = pending.local_id.clone().unwrap();
        binder
            .handle_event(TransportEvent::Inbound(InboundEvent::MessageError(
                MessageErrorPayload {
                    error: "blocked".into(),
                    local_id: Some(local_id.clone()),
                },
            )))
            .await;

        let failures = messages.failures.lock().unwrap().clone();
        assert_eq!(
            failures,
            vec![
                (offline.local_id.clone(), "transport".to_string()),
                (Some(local_id), "rejected: blocked".to_string()),
            ]
        );
    }
}
