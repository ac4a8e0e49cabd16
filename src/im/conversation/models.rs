//! 会话本地模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// roster 接口下发的会话记录
///
/// 拉黑标记只有在服务器显式给出时才覆盖本地状态；缺省时沿用
/// block-success / unblock-success / you-are-blocked 事件写入的值。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterItem {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_blocked_by_me: Option<bool>,
    #[serde(default)]
    pub has_blocked_me: Option<bool>,
}

impl RosterItem {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar: None,
            is_blocked_by_me: None,
            has_blocked_me: None,
        }
    }

    pub fn blocked_by_me(mut self, blocked: bool) -> Self {
        self.is_blocked_by_me = Some(blocked);
        self
    }

    /// 合并到本地记录（本地不存在时以默认值起步）
    pub fn merge_into(self, local: Option<&RosterEntry>) -> RosterEntry {
        RosterEntry {
            is_blocked_by_me: self
                .is_blocked_by_me
                .unwrap_or_else(|| local.is_some_and(|c| c.is_blocked_by_me)),
            has_blocked_me: self
                .has_blocked_me
                .unwrap_or_else(|| local.is_some_and(|c| c.has_blocked_me)),
            id: self.id,
            display_name: self.display_name,
            avatar: self.avatar,
        }
    }
}

/// 会话（配对）记录
///
/// 只保存服务器下发的字段和拉黑标记；预览、未读数、在线状态都在投影时推导。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// 对端用户 ID（即会话 ID）
    pub id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    /// 我是否拉黑了对端
    pub is_blocked_by_me: bool,
    /// 对端是否拉黑了我（对端私有状态，仅用于从列表中隐藏）
    pub has_blocked_me: bool,
}

/// 会话摘要（列表渲染使用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub online: bool,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: usize,
    pub is_blocked_by_me: bool,
}
