//! 长连接传输层

pub mod backoff;
pub mod codec;
pub mod session;

pub use backoff::ReconnectPolicy;
pub use session::{ConnectionState, Transport, TransportConfig, TransportSession};
