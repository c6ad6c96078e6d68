//! HTTP and WebSocket surface of the livecast server

pub mod http;
pub mod signaling;

pub use http::{create_router, AppState};
pub use signaling::{SignalingContext, SignalingSession};
