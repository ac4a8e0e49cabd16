//! 消息监听器
//!
//! 上层 UI 通过实现该接口接收消息相关事件，随后从存储重新读取投影。

use crate::im::error::SyncError;
use crate::im::message::models::Message;
use async_trait::async_trait;

/// 消息监听器
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// 收到新消息（推送，已写入存储）
    async fn on_recv_new_message(&self, message: Message);

    /// 本地发送的消息状态变化（pending / sent / failed）
    ///
    /// 参数 `message` 是变化后的存储快照
    async fn on_message_status_changed(&self, message: Message);

    /// 发送失败的原因（`TransportUnavailable` 或 `SendRejected`），随后消息以 failed 状态保留
    async fn on_send_failed(&self, message: Message, error: SyncError);

    /// 消息被删除（仅对当前用户隐藏时触发）
    async fn on_msg_deleted(&self, conversation_id: String, message_id: String);

    /// 对端已读回执
    ///
    /// 参数 `reader_id` 是读过我消息的对端用户 ID
    async fn on_recv_c2c_read_receipt(&self, reader_id: String);

    /// 连接状态变化
    async fn on_connection_status_changed(&self, connected: bool, message: String);
}

/// 空的消息监听器实现（默认实现）
pub struct EmptyMessageListener;

#[async_trait]
impl MessageListener for EmptyMessageListener {
    async fn on_recv_new_message(&self, _message: Message) {}
    async fn on_message_status_changed(&self, _message: Message) {}
    async fn on_send_failed(&self, _message: Message, _error: SyncError) {}
    async fn on_msg_deleted(&self, _conversation_id: String, _message_id: String) {}
    async fn on_recv_c2c_read_receipt(&self, _reader_id: String) {}
    async fn on_connection_status_changed(&self, _connected: bool, _message: String) {}
}
