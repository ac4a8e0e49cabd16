//! 历史消息分页加载
//!
//! 每个打开的会话维护 `has_more` 和一个隐式游标（当前已加载最早一条消息的 id）。
//! 首屏加载替换会话消息并滚动到底部；之后在最早一条消息进入视口时向前翻页并插入头部，
//! 同时保持滚动锚点。切换会话会使进行中的请求失效，迟到的响应直接丢弃。

use super::api::HistorySource;
use super::viewport::{item_key, ScrollAnchor, Viewport};
use crate::im::error::{SyncError, SyncResult};
use crate::im::message::store::{lock_store, SharedStore};
use crate::im::transport::Transport;
use crate::im::types::OutboundCommand;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// 历史加载配置
#[derive(Debug, Clone, Copy)]
pub struct HistoryLoaderConfig {
    /// 每页条数
    pub page_size: usize,
}

impl Default for HistoryLoaderConfig {
    fn default() -> Self {
        Self { page_size: 30 }
    }
}

/// 一次加载的结果
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// 首屏已替换，视口应滚动到底部
    Initial { loaded: usize },
    /// 更早的一页已插入头部
    Prepended { added: usize },
    /// 未满足加载条件（没有打开的会话、没有更多、已有请求在途）
    Skipped,
    /// 请求期间会话已切换，响应被丢弃
    Stale,
}

#[derive(Debug, Default)]
struct LoaderState {
    conversation_id: Option<String>,
    has_more: bool,
    loading: bool,
    /// 每次打开 / 关闭会话时递增，作为取消标记
    generation: u64,
}

/// 历史消息加载器
pub struct HistoryLoader {
    source: Arc<dyn HistorySource>,
    store: SharedStore,
    config: HistoryLoaderConfig,
    state: Mutex<LoaderState>,
    /// 设置后，打开的会话里新加载的对端消息会被标记已读并发出回执
    read_receipts: Option<Arc<dyn Transport>>,
}

impl HistoryLoader {
    pub fn new(
        source: Arc<dyn HistorySource>,
        store: SharedStore,
        config: HistoryLoaderConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
            state: Mutex::new(LoaderState::default()),
            read_receipts: None,
        }
    }

    pub fn with_read_receipts(mut self, transport: Arc<dyn Transport>) -> Self {
        self.read_receipts = Some(transport);
        self
    }

    fn state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 切换到新会话：重置 `has_more`，使进行中的请求失效
    pub fn open(&self, conversation_id: &str) {
        let mut state = self.state();
        state.generation += 1;
        state.conversation_id = Some(conversation_id.to_string());
        state.has_more = true;
        state.loading = false;
        debug!(
            "[History] 打开会话: {} (generation={})",
            conversation_id, state.generation
        );
    }

    /// 关闭当前会话，进行中的请求同样失效
    pub fn close(&self) {
        let mut state = self.state();
        state.generation += 1;
        state.conversation_id = None;
        state.loading = false;
    }

    pub fn current_conversation(&self) -> Option<String> {
        self.state().conversation_id.clone()
    }

    pub fn has_more(&self) -> bool {
        self.state().has_more
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    /// 顶部可见性探针是否启用：有打开的会话、还有更多、没有在途请求
    pub fn sensor_active(&self) -> bool {
        let state = self.state();
        state.conversation_id.is_some() && state.has_more && !state.loading
    }

    /// 首屏：拉取最新一页并替换会话消息
    pub async fn load_initial(&self) -> SyncResult<LoadOutcome> {
        let (conversation_id, generation) = {
            let mut state = self.state();
            let Some(conversation_id) = state.conversation_id.clone() else {
                return Ok(LoadOutcome::Skipped);
            };
            state.loading = true;
            (conversation_id, state.generation)
        };

        let result = self
            .source
            .fetch_page(&conversation_id, None, self.config.page_size)
            .await;

        let mut state = self.state();
        if state.generation != generation {
            debug!("[History] 丢弃过期的首屏响应: {}", conversation_id);
            return Ok(LoadOutcome::Stale);
        }
        state.loading = false;
        match result {
            Ok(page) => {
                let loaded = lock_store(&self.store).replace_history(&conversation_id, page.messages);
                state.has_more = page.has_more;
                self.mark_loaded_read(&conversation_id);
                info!(
                    "[History] ✅ 首屏加载完成: conversation={}, loaded={}, hasMore={}",
                    conversation_id, loaded, page.has_more
                );
                Ok(LoadOutcome::Initial { loaded })
            }
            Err(e) => {
                warn!("[History] ❌ 首屏加载失败: {}: {:#}", conversation_id, e);
                Err(SyncError::history(e))
            }
        }
    }

    /// 向前翻页：拉取当前最早消息之前的一页并插入头部
    ///
    /// 失败时 `has_more` 与游标保持不变，下次探针触发时重试。
    pub async fn load_older(&self) -> SyncResult<LoadOutcome> {
        let (conversation_id, generation) = {
            let mut state = self.state();
            let Some(conversation_id) = state.conversation_id.clone() else {
                return Ok(LoadOutcome::Skipped);
            };
            if !state.has_more || state.loading {
                return Ok(LoadOutcome::Skipped);
            }
            state.loading = true;
            (conversation_id, state.generation)
        };

        let cursor = lock_store(&self.store).oldest_message_id(&conversation_id);
        let result = self
            .source
            .fetch_page(&conversation_id, cursor.as_deref(), self.config.page_size)
            .await;

        let mut state = self.state();
        if state.generation != generation {
            debug!("[History] 丢弃过期的翻页响应: {}", conversation_id);
            return Ok(LoadOutcome::Stale);
        }
        state.loading = false;
        match result {
            Ok(page) => {
                let added = lock_store(&self.store).prepend_history(&conversation_id, page.messages);
                state.has_more = page.has_more;
                self.mark_loaded_read(&conversation_id);
                debug!(
                    "[History] 翻页完成: conversation={}, before={:?}, added={}, hasMore={}",
                    conversation_id, cursor, added, page.has_more
                );
                Ok(LoadOutcome::Prepended { added })
            }
            Err(e) => {
                warn!(
                    "[History] ❌ 翻页失败: {} (before={:?}): {:#}",
                    conversation_id, cursor, e
                );
                Err(SyncError::history(e))
            }
        }
    }

    /// 首屏加载并把视口滚动到底部
    pub async fn show_latest(&self, viewport: &mut dyn Viewport) -> SyncResult<LoadOutcome> {
        let outcome = self.load_initial().await?;
        if let LoadOutcome::Initial { .. } = outcome {
            self.render(viewport);
            viewport.scroll_to_bottom();
        }
        Ok(outcome)
    }

    /// 最早一条消息进入视口：翻页并保持阅读位置
    pub async fn on_oldest_visible(&self, viewport: &mut dyn Viewport) -> SyncResult<LoadOutcome> {
        if !self.sensor_active() {
            return Ok(LoadOutcome::Skipped);
        }
        let anchor = self
            .topmost_key()
            .and_then(|key| ScrollAnchor::capture(&*viewport, &key));

        let outcome = self.load_older().await?;
        if let LoadOutcome::Prepended { added } = outcome {
            self.render(viewport);
            if let Some(anchor) = anchor {
                let shift = anchor.restore(viewport);
                debug!(
                    "[History] 保持滚动锚点: key={}, added={}, shift={}",
                    anchor.key(),
                    added,
                    shift
                );
            }
        }
        Ok(outcome)
    }

    /// 打开的会话不累计未读：服务器页里 readAt 为空的对端消息在这里补记已读
    fn mark_loaded_read(&self, conversation_id: &str) {
        let Some(transport) = &self.read_receipts else {
            return;
        };
        let changed = lock_store(&self.store).mark_conversation_read(conversation_id, Utc::now());
        if changed == 0 {
            return;
        }
        debug!(
            "[History] 标记已读: conversation={}, changed={}",
            conversation_id, changed
        );
        let receipt = OutboundCommand::MarkMessagesRead(conversation_id.to_string());
        if let Err(e) = transport.emit(receipt) {
            warn!(
                "[History] ⚠️ 已读回执未发出: conversation={}: {}",
                conversation_id, e
            );
        }
    }

    fn topmost_key(&self) -> Option<String> {
        let conversation_id = self.current_conversation()?;
        let store = lock_store(&self.store);
        store
            .visible_messages(&conversation_id)
            .first()
            .and_then(item_key)
    }

    fn render(&self, viewport: &mut dyn Viewport) {
        let Some(conversation_id) = self.current_conversation() else {
            return;
        };
        let messages = lock_store(&self.store).visible_messages(&conversation_id);
        viewport.render(&messages);
    }
}
