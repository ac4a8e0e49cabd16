//! 消息本地模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::im::error::{SyncError, SyncResult};

/// 消息发送状态（仅客户端维护，不会上送服务器）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// 已乐观插入，等待服务器确认
    Pending,
    /// 服务器已确认（推送、历史拉取得到的消息均为此状态）
    #[default]
    Sent,
    /// 发送失败，保留在会话中供用户重试或丢弃
    Failed,
}

/// 消息标识：确认前以 localId 标识，确认后以服务器 id 标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Pending(String),
    Confirmed(String),
}

impl MessageKey {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKey::Pending(local_id) => local_id,
            MessageKey::Confirmed(id) => id,
        }
    }
}

/// 聊天消息
///
/// 既用于服务器推送 / 历史拉取的反序列化，也用于客户端乐观插入的本地记录。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// 服务器 ID，待确认时为空
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// 客户端关联标识
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// 唯一排序键（升序）
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    /// 对自己隐藏了该消息的用户
    #[serde(default)]
    pub deleted_by: BTreeSet<String>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    /// 构造一条待发送的本地消息（content / imageUrl 至少有一个非空）
    pub fn outgoing(
        sender_id: &str,
        receiver_id: &str,
        content: Option<String>,
        image_url: Option<String>,
    ) -> SyncResult<Self> {
        let content = content.filter(|c| !c.trim().is_empty());
        let image_url = image_url.filter(|u| !u.trim().is_empty());
        if content.is_none() && image_url.is_none() {
            return Err(SyncError::EmptyMessage);
        }
        Ok(Self {
            id: None,
            local_id: None,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content,
            image_url,
            created_at: Utc::now(),
            read_at: None,
            deleted_by: BTreeSet::new(),
            status: MessageStatus::Pending,
        })
    }

    /// 确认后返回服务器 id，否则返回 localId
    pub fn key(&self) -> Option<MessageKey> {
        match (&self.id, &self.local_id) {
            (Some(id), _) => Some(MessageKey::Confirmed(id.clone())),
            (None, Some(local_id)) => Some(MessageKey::Pending(local_id.clone())),
            (None, None) => None,
        }
    }

    /// 会话 key：相对当前用户的对端用户 ID
    pub fn conversation_key(&self, login_user_id: &str) -> &str {
        if self.sender_id == login_user_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    pub fn is_hidden_for(&self, user_id: &str) -> bool {
        self.deleted_by.contains(user_id)
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_requires_content_or_image() {
        let err = Message::outgoing("u1", "u2", Some("   ".into()), None).unwrap_err();
        assert!(matches!(err, SyncError::EmptyMessage));

        let msg = Message::outgoing("u1", "u2", None, Some("https://img/1.png".into())).unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.content.is_none());
        assert!(msg.is_pending());
    }

    #[test]
    fn server_payload_defaults_to_sent() {
        let json = r#"{
            "_id": "m1",
            "senderId": "u2",
            "receiverId": "u1",
            "content": "hola",
            "createdAt": "2024-05-01T10:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id.as_deref(), Some("m1"));
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.conversation_key("u1"), "u2");
        assert_eq!(msg.key(), Some(MessageKey::Confirmed("m1".into())));
        assert!(msg.deleted_by.is_empty());
    }
}
