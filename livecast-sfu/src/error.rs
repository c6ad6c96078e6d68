use livecast_core::models::MediaKind;
use thiserror::Error;

use crate::engine::EngineError;
use crate::types::Direction;

/// Errors a signaling request can fail with
///
/// Every variant reaches the peer as `{"error": <message>, "code": <code>}`.
#[derive(Error, Debug)]
pub enum SfuError {
    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("broadcast seat is held by another session")]
    SeatBusy,

    #[error("no {0} transport")]
    NoTransport(Direction),

    #[error("{0} transport already exists")]
    TransportAlreadyExists(Direction),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("no {0} producer")]
    NoProducer(MediaKind),

    #[error("cannot consume: incompatible rtp capabilities")]
    IncompatibleCapabilities,

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("no video consumer")]
    NoConsumer,

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl SfuError {
    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "room_not_found",
            Self::NotAuthorized(_) => "not_authorized",
            Self::SeatBusy => "seat_busy",
            Self::NoTransport(_) => "no_transport",
            Self::TransportAlreadyExists(_) => "transport_already_exists",
            Self::ConnectFailed(_) => "connect_failed",
            Self::NoProducer(_) => "no_producer",
            Self::IncompatibleCapabilities => "incompatible_capabilities",
            Self::ConsumerNotFound(_) => "consumer_not_found",
            Self::NoConsumer => "no_consumer",
            Self::Engine(_) => "engine_error",
        }
    }
}

impl From<livecast_core::Error> for SfuError {
    fn from(err: livecast_core::Error) -> Self {
        use livecast_core::Error;

        match err {
            Error::NotFound(what) => Self::RoomNotFound(what),
            Error::Authentication(msg) | Error::Authorization(msg) => Self::NotAuthorized(msg),
            other => Self::Engine(EngineError::Internal(other.to_string())),
        }
    }
}

pub type SfuResult<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_producer_message() {
        let err = SfuError::NoProducer(MediaKind::Video);
        assert_eq!(err.to_string(), "no video producer");
        assert_eq!(err.code(), "no_producer");
    }

    #[test]
    fn test_core_errors_map_to_taxonomy() {
        let err: SfuError = livecast_core::Error::Authentication("bad".to_string()).into();
        assert_eq!(err.code(), "not_authorized");
        let err: SfuError = livecast_core::Error::NotFound("live x".to_string()).into();
        assert_eq!(err.code(), "room_not_found");
    }
}
