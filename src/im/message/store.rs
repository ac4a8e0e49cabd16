//! 内存消息存储
//!
//! 所有已加载消息、会话记录、在线状态的唯一数据源。纯数据结构，不做任何 I/O；
//! 变更只由 binder 和 history loader 发起，读取一律返回重新排序、去重后的快照。

use crate::im::conversation::models::{RosterEntry, RosterItem};
use crate::im::message::models::{Message, MessageKey, MessageStatus};
use crate::im::serialization::generate_local_id;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// 共享的消息存储句柄（由组合根持有并注入各组件）
pub type SharedStore = Arc<Mutex<MessageStore>>;

/// 获取存储锁；存储内部每次变更都保持一致，锁中毒时直接沿用内部数据
pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, MessageStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `ingest` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// 新消息已插入
    Inserted,
    /// 携带 localId 的服务器消息替换了本地待确认记录
    Reconciled,
    /// 相同 id 已存在（重放或重复投递）
    Duplicate,
    /// 缺少服务器 id，无法入库
    Ignored,
}

/// 内存消息存储
#[derive(Debug)]
pub struct MessageStore {
    /// 当前登录用户
    login_user_id: String,
    /// 会话 key（对端用户 ID）-> 按插入顺序保存的消息
    threads: HashMap<String, Vec<Message>>,
    /// roster 会话记录（保持首次出现的顺序，从不删除）
    conversations: Vec<RosterEntry>,
    /// 在线状态
    presence: HashMap<String, bool>,
}

impl MessageStore {
    pub fn new(login_user_id: impl Into<String>) -> Self {
        Self {
            login_user_id: login_user_id.into(),
            threads: HashMap::new(),
            conversations: Vec::new(),
            presence: HashMap::new(),
        }
    }

    pub fn shared(login_user_id: impl Into<String>) -> SharedStore {
        Arc::new(Mutex::new(Self::new(login_user_id)))
    }

    pub fn login_user_id(&self) -> &str {
        &self.login_user_id
    }

    // ===================== 消息写入 =====================

    /// 乐观插入：状态置为 pending 并分配 localId（已有 localId 时沿用），返回 localId
    pub fn add_optimistic(&mut self, mut message: Message) -> String {
        let local_id = message.local_id.take().unwrap_or_else(generate_local_id);
        message.local_id = Some(local_id.clone());
        message.id = None;
        message.status = MessageStatus::Pending;

        let conversation_id = message.conversation_key(&self.login_user_id).to_string();
        debug!(
            "[Store] 乐观插入消息: conversation={}, localId={}",
            conversation_id, local_id
        );
        self.threads
            .entry(conversation_id)
            .or_default()
            .push(message);
        local_id
    }

    /// 用服务器确认的消息原位替换 localId 对应的待确认记录
    ///
    /// localId 不存在（例如会话已被清空）或记录已确认时不做任何事。
    pub fn reconcile(&mut self, local_id: &str, server: Message) -> bool {
        let Some(server_id) = server.id.clone() else {
            warn!("[Store] 确认消息缺少服务器 id，忽略: localId={}", local_id);
            return false;
        };
        let Some((conversation_id, mut index)) = self.find_unconfirmed(local_id) else {
            debug!("[Store] 未找到待确认记录，忽略确认: localId={}", local_id);
            return false;
        };
        let Some(thread) = self.threads.get_mut(&conversation_id) else {
            return false;
        };

        // 推送先于确认到达时，同 id 的记录已在会话中，去掉它以保证 id 唯一
        if let Some(dup) = thread
            .iter()
            .position(|m| m.id.as_deref() == Some(server_id.as_str()))
        {
            thread.remove(dup);
            if dup < index {
                index -= 1;
            }
        }

        let slot = &mut thread[index];
        slot.id = Some(server_id);
        slot.created_at = server.created_at;
        slot.content = server.content;
        slot.image_url = server.image_url;
        slot.read_at = server.read_at;
        slot.deleted_by = server.deleted_by;
        slot.status = MessageStatus::Sent;
        debug!(
            "[Store] 消息已确认: conversation={}, localId={}, id={:?}",
            conversation_id, local_id, slot.id
        );
        true
    }

    /// 写入服务器推送的消息；同 id 已存在时为空操作
    pub fn ingest(&mut self, mut server: Message) -> IngestOutcome {
        let Some(id) = server.id.clone() else {
            warn!("[Store] 推送消息缺少 id，忽略");
            return IngestOutcome::Ignored;
        };
        let conversation_id = server.conversation_key(&self.login_user_id).to_string();
        if self.contains_id(&conversation_id, &id) {
            debug!("[Store] 重复投递，忽略: id={}", id);
            return IngestOutcome::Duplicate;
        }

        if let Some(local_id) = server.local_id.clone() {
            if self.find_unconfirmed(&local_id).is_some() && self.reconcile(&local_id, server.clone())
            {
                return IngestOutcome::Reconciled;
            }
        }

        server.status = MessageStatus::Sent;
        self.threads
            .entry(conversation_id)
            .or_default()
            .push(server);
        IngestOutcome::Inserted
    }

    /// pending -> failed；记录保留在会话中
    pub fn mark_failed(&mut self, local_id: &str) -> bool {
        match self.find_by_local_id_mut(local_id) {
            Some(msg) if msg.is_pending() => {
                msg.status = MessageStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// failed -> pending（重试时原位复用同一条记录），返回该记录快照
    pub fn mark_pending(&mut self, local_id: &str) -> Option<Message> {
        match self.find_by_local_id_mut(local_id) {
            Some(msg) if msg.status == MessageStatus::Failed => {
                msg.status = MessageStatus::Pending;
                Some(msg.clone())
            }
            _ => None,
        }
    }

    /// 丢弃一条发送失败的记录
    pub fn discard(&mut self, local_id: &str) -> bool {
        for thread in self.threads.values_mut() {
            if let Some(pos) = thread.iter().position(|m| {
                m.local_id.as_deref() == Some(local_id) && m.status == MessageStatus::Failed
            }) {
                thread.remove(pos);
                return true;
            }
        }
        false
    }

    /// 仅对当前用户隐藏消息
    pub fn hide_for_self(&mut self, message_id: &str) -> bool {
        let me = self.login_user_id.clone();
        self.record_deletion(message_id, &me)
    }

    /// 记录某个用户对消息的软删除
    pub fn record_deletion(&mut self, message_id: &str, user_id: &str) -> bool {
        self.threads
            .values_mut()
            .flat_map(|t| t.iter_mut())
            .find(|m| m.id.as_deref() == Some(message_id))
            .map(|m| m.deleted_by.insert(user_id.to_string()))
            .unwrap_or(false)
    }

    /// 在会话头部合并一页更早的历史消息，按 id 去重，返回实际新增条数
    pub fn prepend_history(&mut self, conversation_id: &str, page: Vec<Message>) -> usize {
        let thread = self.threads.entry(conversation_id.to_string()).or_default();
        let mut seen: HashSet<String> = thread.iter().filter_map(|m| m.id.clone()).collect();

        let mut fresh: Vec<Message> = page
            .into_iter()
            .filter(|m| m.id.as_ref().is_some_and(|id| seen.insert(id.clone())))
            .map(|mut m| {
                m.status = MessageStatus::Sent;
                m
            })
            .collect();
        fresh.sort_by_key(|m| m.created_at);

        let added = fresh.len();
        fresh.append(thread);
        *thread = fresh;
        added
    }

    /// 用首屏历史替换会话消息
    ///
    /// 保留未确认的本地记录，以及拉取期间经推送到达、落在该页时间窗口内或更新的消息。
    pub fn replace_history(&mut self, conversation_id: &str, page: Vec<Message>) -> usize {
        let mut seen: HashSet<String> = HashSet::new();
        let mut fresh: Vec<Message> = page
            .into_iter()
            .filter(|m| m.id.as_ref().is_some_and(|id| seen.insert(id.clone())))
            .map(|mut m| {
                m.status = MessageStatus::Sent;
                m
            })
            .collect();
        fresh.sort_by_key(|m| m.created_at);
        let loaded = fresh.len();
        let window_start = fresh.first().map(|m| m.created_at);

        let previous = self
            .threads
            .remove(conversation_id)
            .unwrap_or_default();
        for msg in previous {
            let keep = match &msg.id {
                None => true,
                Some(id) => {
                    !seen.contains(id) && window_start.map_or(true, |start| msg.created_at >= start)
                }
            };
            if keep {
                fresh.push(msg);
            }
        }
        self.threads.insert(conversation_id.to_string(), fresh);
        loaded
    }

    /// 清空整个会话的已加载消息
    pub fn purge_conversation(&mut self, conversation_id: &str) -> usize {
        self.threads
            .remove(conversation_id)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    // ===================== 已读状态 =====================

    /// 将对端发给我的未读消息标记为已读，返回变更条数（重复调用为幂等）
    pub fn mark_conversation_read(&mut self, conversation_id: &str, at: DateTime<Utc>) -> usize {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return 0;
        };
        let mut changed = 0;
        for msg in thread
            .iter_mut()
            .filter(|m| m.sender_id == conversation_id && m.read_at.is_none())
        {
            msg.read_at = Some(at);
            changed += 1;
        }
        changed
    }

    /// 对端已读回执：更新我发给 reader 的消息的 readAt
    pub fn apply_read_receipt(&mut self, reader_id: &str, at: DateTime<Utc>) -> usize {
        let me = self.login_user_id.clone();
        let Some(thread) = self.threads.get_mut(reader_id) else {
            return 0;
        };
        let mut changed = 0;
        for msg in thread
            .iter_mut()
            .filter(|m| m.sender_id == me && m.id.is_some() && m.read_at.is_none())
        {
            msg.read_at = Some(at);
            changed += 1;
        }
        changed
    }

    /// 单条消息已读
    pub fn mark_message_read(&mut self, message_id: &str, at: DateTime<Utc>) -> bool {
        match self
            .threads
            .values_mut()
            .flat_map(|t| t.iter_mut())
            .find(|m| m.id.as_deref() == Some(message_id))
        {
            Some(msg) if msg.read_at.is_none() => {
                msg.read_at = Some(at);
                true
            }
            _ => false,
        }
    }

    // ===================== 会话 / 在线 / 拉黑 =====================

    /// 合并 roster：按 id 原位更新，新会话追加，缺失的会话保留
    ///
    /// 记录未携带拉黑标记时保留本地值。
    pub fn set_conversations(&mut self, list: Vec<RosterItem>) -> bool {
        let mut changed = false;
        for item in list {
            match self.conversations.iter_mut().find(|c| c.id == item.id) {
                Some(existing) => {
                    let merged = item.merge_into(Some(existing));
                    if *existing != merged {
                        *existing = merged;
                        changed = true;
                    }
                }
                None => {
                    self.conversations.push(item.merge_into(None));
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn update_presence(&mut self, user_id: &str, online: bool) -> bool {
        self.presence.insert(user_id.to_string(), online) != Some(online)
    }

    pub fn update_block_status(&mut self, conversation_id: &str, blocked: bool) -> bool {
        match self.conversation_mut(conversation_id) {
            Some(conv) if conv.is_blocked_by_me != blocked => {
                conv.is_blocked_by_me = blocked;
                true
            }
            _ => false,
        }
    }

    /// 对端拉黑 / 取消拉黑我
    pub fn set_blocked_me(&mut self, conversation_id: &str, blocked: bool) -> bool {
        match self.conversation_mut(conversation_id) {
            Some(conv) if conv.has_blocked_me != blocked => {
                conv.has_blocked_me = blocked;
                true
            }
            _ => false,
        }
    }

    // ===================== 读取 =====================

    /// 会话消息快照：按 createdAt 升序稳定排序，并按 id / localId 去重
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.ordered(conversation_id).into_iter().cloned().collect()
    }

    /// 当前用户可见的消息
    pub fn visible_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.ordered(conversation_id)
            .into_iter()
            .filter(|m| !m.is_hidden_for(&self.login_user_id))
            .cloned()
            .collect()
    }

    /// 最新一条可见消息（用于会话预览）
    pub fn latest_visible(&self, conversation_id: &str) -> Option<&Message> {
        self.ordered(conversation_id)
            .into_iter()
            .rev()
            .find(|m| !m.is_hidden_for(&self.login_user_id))
    }

    /// 分页游标：当前已加载的最早一条已确认消息 id
    pub fn oldest_message_id(&self, conversation_id: &str) -> Option<String> {
        self.ordered(conversation_id)
            .into_iter()
            .find_map(|m| m.id.clone())
    }

    pub fn message_by_local_id(&self, local_id: &str) -> Option<&Message> {
        self.threads
            .values()
            .flat_map(|t| t.iter())
            .find(|m| m.local_id.as_deref() == Some(local_id))
    }

    pub fn message_by_id(&self, message_id: &str) -> Option<&Message> {
        self.threads
            .values()
            .flat_map(|t| t.iter())
            .find(|m| m.id.as_deref() == Some(message_id))
    }

    /// 未读数：对端发来、未对我隐藏、readAt 为空的消息条数
    pub fn unread_count_for(&self, conversation_id: &str) -> usize {
        self.threads
            .get(conversation_id)
            .map(|t| {
                t.iter()
                    .filter(|m| {
                        m.sender_id == conversation_id
                            && m.read_at.is_none()
                            && !m.is_hidden_for(&self.login_user_id)
                    })
                    .filter_map(|m| m.id.as_deref())
                    .collect::<HashSet<_>>()
                    .len()
            })
            .unwrap_or(0)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.get(user_id).copied().unwrap_or(false)
    }

    pub fn is_blocked_by_me(&self, conversation_id: &str) -> bool {
        self.conversation(conversation_id)
            .is_some_and(|c| c.is_blocked_by_me)
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&RosterEntry> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn conversations(&self) -> &[RosterEntry] {
        &self.conversations
    }

    // ===================== 内部辅助 =====================

    fn ordered(&self, conversation_id: &str) -> Vec<&Message> {
        let Some(thread) = self.threads.get(conversation_id) else {
            return Vec::new();
        };
        let mut refs: Vec<&Message> = thread.iter().collect();
        refs.sort_by_key(|m| m.created_at);

        let mut seen: HashSet<MessageKey> = HashSet::with_capacity(refs.len());
        refs.retain(|m| match m.key() {
            Some(key) => seen.insert(key),
            None => true,
        });
        refs
    }

    fn contains_id(&self, conversation_id: &str, id: &str) -> bool {
        self.threads
            .get(conversation_id)
            .is_some_and(|t| t.iter().any(|m| m.id.as_deref() == Some(id)))
    }

    /// 查找尚未确认（pending / failed）的本地记录
    fn find_unconfirmed(&self, local_id: &str) -> Option<(String, usize)> {
        self.threads.iter().find_map(|(conv, thread)| {
            thread
                .iter()
                .position(|m| {
                    m.local_id.as_deref() == Some(local_id) && m.status != MessageStatus::Sent
                })
                .map(|idx| (conv.clone(), idx))
        })
    }

    fn find_by_local_id_mut(&mut self, local_id: &str) -> Option<&mut Message> {
        self.threads
            .values_mut()
            .flat_map(|t| t.iter_mut())
            .find(|m| m.local_id.as_deref() == Some(local_id))
    }

    fn conversation_mut(&mut self, conversation_id: &str) -> Option<&mut RosterEntry> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
    }
}
