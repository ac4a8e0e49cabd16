//! 会话监听器回调接口

use crate::im::conversation::models::ConversationSummary;
use async_trait::async_trait;

/// 会话监听器回调接口
#[async_trait]
pub trait ConversationListener: Send + Sync {
    /// roster 同步开始
    async fn on_sync_server_start(&self);

    /// roster 同步完成
    async fn on_sync_server_finish(&self);

    /// roster 同步失败（保留旧数据）
    async fn on_sync_server_failed(&self, error: String);

    /// 可见会话列表变更（重新投影后的完整列表）
    async fn on_conversation_changed(&self, conversation_list: Vec<ConversationSummary>);

    /// 总未读消息数变更
    async fn on_total_unread_message_count_changed(&self, total_unread_count: usize);

    /// 对端在线状态变更
    async fn on_user_status_changed(&self, user_id: String, online: bool);

    /// 拉黑 / 取消拉黑成功
    async fn on_block_status_changed(&self, user_id: String, blocked: bool);

    /// 当前打开的会话被关闭（例如被对端拉黑）
    async fn on_active_conversation_closed(&self, conversation_id: String);
}

/// 空实现（默认监听器）
pub struct EmptyConversationListener;

#[async_trait]
impl ConversationListener for EmptyConversationListener {
    async fn on_sync_server_start(&self) {}
    async fn on_sync_server_finish(&self) {}
    async fn on_sync_server_failed(&self, _error: String) {}
    async fn on_conversation_changed(&self, _conversation_list: Vec<ConversationSummary>) {}
    async fn on_total_unread_message_count_changed(&self, _total_unread_count: usize) {}
    async fn on_user_status_changed(&self, _user_id: String, _online: bool) {}
    async fn on_block_status_changed(&self, _user_id: String, _blocked: bool) {}
    async fn on_active_conversation_closed(&self, _conversation_id: String) {}
}
