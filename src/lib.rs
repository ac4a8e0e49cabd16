pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    client::{ChatClient, ClientConfig},
    conversation::{ConversationListProjector, ConversationSummary, RosterEntry, RosterItem},
    error::{SyncError, SyncResult},
    message::{Message, MessageStatus, MessageStore},
    transport::{ConnectionState, TransportSession},
    CommandBinder,
};
