//! 历史消息 HTTP API

use crate::im::serialization::generate_operation_id;
use crate::im::types::{handle_http_response, HistoryPage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// 历史消息数据源
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// 拉取 `before` 之前（不含）的一页消息；`before` 为空时拉取最新一页
    async fn fetch_page(
        &self,
        conversation_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage>;
}

/// 历史消息 HTTP API 客户端
pub struct HistoryApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl HistoryApi {
    /// `client` 应该已经在外部配置好认证头
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }
}

#[async_trait]
impl HistorySource for HistoryApi {
    async fn fetch_page(
        &self,
        conversation_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let url = format!("{}/messages/{}", self.api_base_url, conversation_id);
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(cursor) = before {
            query.push(("before", cursor.to_string()));
        }
        debug!(
            "[History] 📡 拉取历史: conversation={}, before={:?}, limit={}",
            conversation_id, before, limit
        );

        let response = self
            .client
            .get(&url)
            .header("operationID", generate_operation_id())
            .query(&query)
            .send()
            .await
            .with_context(|| format!("请求历史消息失败: {conversation_id}"))?;

        handle_http_response(response, "历史消息").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::error::SyncError;
    use crate::im::history::loader::{HistoryLoader, HistoryLoaderConfig};
    use crate::im::message::store::MessageStore;
    use crate::im::types::tests::serve_once;
    use std::sync::Arc;

    #[tokio::test]
    async fn page_request_carries_cursor_and_limit() {
        let body = r#"{"messages":[{"_id":"m8","senderId":"u2","receiverId":"u1","content":"hola","createdAt":"2024-05-01T10:00:00Z"}],"hasMore":true}"#;
        let (base, head) = serve_once(200, body).await;
        let api = HistoryApi::new(reqwest::Client::new(), base);

        let page = api.fetch_page("u2", Some("m9"), 2).await.unwrap();
        assert!(page.has_more);
        assert_eq!(page.messages[0].id.as_deref(), Some("m8"));

        let head = head.await.unwrap();
        assert!(head.starts_with("get /messages/u2?limit=2&before=m9 "));
        assert!(head.contains("operationid:"));
    }

    #[tokio::test]
    async fn server_error_surfaces_as_history_fetch() {
        let (base, _) = serve_once(500, r#"{"error":"db down"}"#).await;
        let api = Arc::new(HistoryApi::new(reqwest::Client::new(), base));
        let store = MessageStore::shared("u1");
        let loader = HistoryLoader::new(api, store, HistoryLoaderConfig { page_size: 30 });
        loader.open("u2");

        let err = loader.load_initial().await.unwrap_err();
        match err {
            SyncError::HistoryFetch(reason) => assert!(reason.contains("500")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(loader.has_more());
        assert!(!loader.is_loading());
    }
}
