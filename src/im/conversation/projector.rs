//! 会话列表投影
//!
//! 从消息存储推导出有序、可搜索的会话摘要列表（最新消息预览、时间、未读角标）。
//! 每次调用都重新计算，不缓存任何视图。

use crate::im::conversation::models::{ConversationSummary, RosterEntry};
use crate::im::message::models::Message;
use crate::im::message::store::MessageStore;
use std::cmp::Ordering;

/// 纯图片消息的预览文案
pub const IMAGE_PREVIEW: &str = "[图片]";

/// 会话列表投影器
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationListProjector;

impl ConversationListProjector {
    /// 可见会话列表：排除我拉黑的与拉黑我的会话，按最新消息时间倒序，
    /// `query` 非空时按显示名称（不区分大小写）过滤
    pub fn project(store: &MessageStore, query: Option<&str>) -> Vec<ConversationSummary> {
        let needle = query
            .map(|q| q.trim().to_lowercase())
            .filter(|q| !q.is_empty());

        let mut list: Vec<ConversationSummary> = store
            .conversations()
            .iter()
            .filter(|c| !c.is_blocked_by_me && !c.has_blocked_me)
            .filter(|c| match &needle {
                Some(n) => c.display_name.to_lowercase().contains(n),
                None => true,
            })
            .map(|c| Self::summarize(store, c))
            .collect();
        list.sort_by(Self::compare);
        list
    }

    /// 我拉黑的会话（供取消拉黑入口使用），消息历史仍在存储中
    pub fn blocked(store: &MessageStore) -> Vec<ConversationSummary> {
        let mut list: Vec<ConversationSummary> = store
            .conversations()
            .iter()
            .filter(|c| c.is_blocked_by_me)
            .map(|c| Self::summarize(store, c))
            .collect();
        list.sort_by(Self::compare);
        list
    }

    /// 单个会话摘要（对端不在 roster 中时返回 None）
    pub fn summary(store: &MessageStore, conversation_id: &str) -> Option<ConversationSummary> {
        store
            .conversation(conversation_id)
            .map(|c| Self::summarize(store, c))
    }

    /// 可见会话的总未读数
    pub fn total_unread(store: &MessageStore) -> usize {
        store
            .conversations()
            .iter()
            .filter(|c| !c.is_blocked_by_me && !c.has_blocked_me)
            .map(|c| store.unread_count_for(&c.id))
            .sum()
    }

    /// 消息预览：优先正文，纯图片消息使用固定文案
    pub fn preview(msg: &Message) -> String {
        match msg.content.as_deref() {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => IMAGE_PREVIEW.to_string(),
        }
    }

    fn summarize(store: &MessageStore, entry: &RosterEntry) -> ConversationSummary {
        let latest = store.latest_visible(&entry.id);
        ConversationSummary {
            id: entry.id.clone(),
            display_name: entry.display_name.clone(),
            avatar: entry.avatar.clone(),
            online: store.is_online(&entry.id),
            last_message_preview: latest.map(Self::preview),
            last_message_at: latest.map(|m| m.created_at),
            unread_count: store.unread_count_for(&entry.id),
            is_blocked_by_me: entry.is_blocked_by_me,
        }
    }

    /// 有消息的会话在前（新到旧），无消息的按名称排序
    fn compare(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
        match (a.last_message_at, b.last_message_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.display_name.cmp(&b.display_name))
    }
}
