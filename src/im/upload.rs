//! 图片上传
//!
//! 图片消息先上传附件拿到 URL，再走普通发送流程；上传失败时不会创建任何消息。

use crate::im::serialization::generate_operation_id;
use crate::im::types::{handle_http_response, UploadResp};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// 图片上传接口
#[async_trait]
pub trait ImageUploader: Send + Sync {
    /// 上传图片，返回可访问的 URL
    async fn upload_image(&self, bytes: Vec<u8>, file_name: &str) -> Result<String>;
}

/// 基于 multipart 的上传 API 客户端
pub struct UploadApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl UploadApi {
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }
}

/// 根据扩展名推断 MIME 类型
fn mime_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

#[async_trait]
impl ImageUploader for UploadApi {
    async fn upload_image(&self, bytes: Vec<u8>, file_name: &str) -> Result<String> {
        let url = format!("{}/upload", self.api_base_url);
        info!("[Upload] 📤 上传图片: {} ({} bytes)", file_name, bytes.len());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_for(file_name))
            .context("构造上传表单失败")?;
        let form = reqwest::multipart::Form::new().part("image", part);

        let response = self
            .client
            .post(&url)
            .header("operationID", generate_operation_id())
            .multipart(form)
            .send()
            .await
            .context("上传请求失败")?;

        let resp: UploadResp = handle_http_response(response, "图片上传").await?;
        if resp.url.trim().is_empty() {
            anyhow::bail!("上传响应缺少图片 URL");
        }
        debug!("[Upload] ✅ 上传完成: {}", resp.url);
        Ok(resp.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::types::tests::serve_once;

    #[test]
    fn mime_is_derived_from_extension() {
        assert_eq!(mime_for("cat.PNG"), "image/png");
        assert_eq!(mime_for("a.b.webp"), "image/webp");
        assert_eq!(mime_for("photo.jpg"), "image/jpeg");
        assert_eq!(mime_for("noext"), "image/jpeg");
    }

    #[tokio::test]
    async fn response_url_accepts_both_field_names() {
        for body in [
            r#"{"url":"https://cdn.test/a.png"}"#,
            r#"{"imageUrl":"https://cdn.test/a.png"}"#,
        ] {
            let (base, head) = serve_once(200, body).await;
            let api = UploadApi::new(reqwest::Client::new(), base);
            let url = api.upload_image(vec![1, 2, 3], "a.png").await.unwrap();
            assert_eq!(url, "https://cdn.test/a.png");

            let head = head.await.unwrap();
            assert!(head.starts_with("post /upload "));
            assert!(head.contains("multipart/form-data"));
        }
    }

    #[tokio::test]
    async fn blank_url_or_error_status_fails_the_upload() {
        let (base, _) = serve_once(200, r#"{"url":"  "}"#).await;
        let api = UploadApi::new(reqwest::Client::new(), base);
        assert!(api.upload_image(vec![1], "a.png").await.is_err());

        let (base, _) = serve_once(413, r#"{"error":"too large"}"#).await;
        let api = UploadApi::new(reqwest::Client::new(), base);
        let err = api.upload_image(vec![1], "a.png").await.unwrap_err();
        assert!(format!("{err:#}").contains("413"));
    }
}
