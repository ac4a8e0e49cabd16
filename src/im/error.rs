//! 同步引擎错误分类
//!
//! 传输不可用与发送被拒绝在用户侧表现一致：乐观消息被标记为 `failed` 并保留在会话中。

use thiserror::Error;

/// 同步引擎错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 当前没有可用的长连接（未建立或已断开）
    #[error("传输连接不可用")]
    TransportUnavailable,

    /// 服务器通过 message-error 事件拒绝了发送
    #[error("发送被服务器拒绝: {0}")]
    SendRejected(String),

    /// 历史消息拉取失败（非成功响应或网络错误）
    #[error("历史消息拉取失败: {0}")]
    HistoryFetch(String),

    /// 图片附件上传失败
    #[error("图片上传失败: {0}")]
    Upload(String),

    /// content 与 imageUrl 均为空
    #[error("消息内容与图片均为空")]
    EmptyMessage,

    /// 尚未绑定登录用户
    #[error("未登录")]
    NotSignedIn,

    #[error("消息不存在: {0}")]
    MessageNotFound(String),

    #[error("HTTP 请求失败: {0}")]
    Http(String),
}

impl SyncError {
    /// 将 HTTP 层的 anyhow 错误收敛为历史拉取错误
    pub fn history(err: anyhow::Error) -> Self {
        SyncError::HistoryFetch(format!("{err:#}"))
    }

    pub fn upload(err: anyhow::Error) -> Self {
        SyncError::Upload(format!("{err:#}"))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
