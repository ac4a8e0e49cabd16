//! 会话模块
//!
//! roster 拉取与会话列表投影

pub mod api;
pub mod listener;
pub mod models;
pub mod projector;

// 重新导出主要类型和函数
pub use api::{ConversationApi, RosterSource};
pub use listener::{ConversationListener, EmptyConversationListener};
pub use models::{ConversationSummary, RosterEntry, RosterItem};
pub use projector::ConversationListProjector;
