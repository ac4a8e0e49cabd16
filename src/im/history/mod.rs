//! 历史消息模块

pub mod api;
pub mod loader;
pub mod viewport;

pub use api::{HistoryApi, HistorySource};
pub use loader::{HistoryLoader, HistoryLoaderConfig, LoadOutcome};
pub use viewport::{ScrollAnchor, Viewport};
