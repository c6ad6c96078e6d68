//! WebSocket signaling: wire protocol and per-connection sessions

pub mod protocol;
mod session;

pub use protocol::{ClientRequest, ProtocolError, ServerFrame};
pub use session::{SignalingContext, SignalingSession};
