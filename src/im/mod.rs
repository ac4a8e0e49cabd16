pub mod binder;
pub mod client;
pub mod conversation;
pub mod error;
pub mod history;
pub mod message;
pub mod serialization;
pub mod transport;
pub mod types;
pub mod upload;

// 重新导出常用入口
pub use binder::{ActionConfirmer, AutoConfirmer, CommandBinder, ConfirmAction, DenyAllConfirmer};
pub use client::{ChatClient, ClientConfig};
pub use error::{SyncError, SyncResult};
