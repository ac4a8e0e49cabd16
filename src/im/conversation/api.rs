//! 会话 HTTP API 客户端
//!
//! 负责 roster 与"每个会话最新一条消息"的拉取

use crate::im::conversation::models::RosterItem;
use crate::im::message::models::Message;
use crate::im::serialization::generate_operation_id;
use crate::im::types::handle_http_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// roster 数据源（binder 只依赖该 trait）
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// 当前用户的全部会话（配对）
    async fn fetch_roster(&self) -> Result<Vec<RosterItem>>;

    /// 每个会话最新的一条消息，用于填充列表预览
    async fn fetch_latest_messages(&self) -> Result<Vec<Message>>;
}

/// 会话相关的 HTTP API 客户端
pub struct ConversationApi {
    client: reqwest::Client,
    api_base_url: String,
    user_id: String,
}

impl ConversationApi {
    /// 创建新的会话 API 客户端
    ///
    /// `client` 应该已经在外部配置好认证头
    pub fn new(client: reqwest::Client, api_base_url: String, user_id: String) -> Self {
        Self {
            client,
            api_base_url,
            user_id,
        }
    }
}

#[async_trait]
impl RosterSource for ConversationApi {
    async fn fetch_roster(&self) -> Result<Vec<RosterItem>> {
        let operation_id = generate_operation_id();
        let url = format!("{}/matches", self.api_base_url);

        info!("[Roster] 📡 请求会话列表");
        debug!(
            "[Roster]   请求URL: {}, 用户ID: {}, 操作ID: {}",
            url, self.user_id, operation_id
        );

        let response = self
            .client
            .get(&url)
            .header("operationID", &operation_id)
            .query(&[("userId", self.user_id.as_str())])
            .send()
            .await
            .context("请求会话列表失败")?;

        let entries: Vec<RosterItem> = handle_http_response(response, "会话列表").await?;
        info!("[Roster] ✅ 获取会话列表成功，共 {} 个会话", entries.len());
        Ok(entries)
    }

    async fn fetch_latest_messages(&self) -> Result<Vec<Message>> {
        let operation_id = generate_operation_id();
        let url = format!("{}/messages/latest", self.api_base_url);

        debug!("[Roster] 📡 请求各会话最新消息: {}", url);

        let response = self
            .client
            .get(&url)
            .header("operationID", &operation_id)
            .query(&[("userId", self.user_id.as_str())])
            .send()
            .await
            .context("请求最新消息失败")?;

        let messages: Vec<Message> = handle_http_response(response, "最新消息").await?;
        debug!("[Roster] 获取最新消息 {} 条", messages.len());
        Ok(messages)
    }
}
