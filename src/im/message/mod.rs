//! 消息模块
//!
//! 消息模型、内存存储与消息事件监听器

pub mod listener;
pub mod models;
pub mod store;

// 重新导出主要类型和函数
pub use listener::{EmptyMessageListener, MessageListener};
pub use models::{Message, MessageKey, MessageStatus};
pub use store::{lock_store, IngestOutcome, MessageStore, SharedStore};
