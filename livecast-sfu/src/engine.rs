//! Media engine adapter
//!
//! The engine does the actual ICE/DTLS/SRTP work and RTP forwarding. The
//! orchestration layer only ever sees it through these traits: a router-level
//! [`MediaEngine`] that hands out transports, and the transport, producer and
//! consumer handles it creates.
//!
//! Handles report lifecycle changes through a broadcast channel instead of
//! callbacks. `close()` never blocks and never fails from the caller's point of
//! view; implementations log their own teardown problems.

use async_trait::async_trait;
use livecast_core::models::{MediaKind, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::types::{ConsumerId, Direction, ProducerId, TransportId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("transport closed")]
    TransportClosed,

    #[error("{0} closed")]
    HandleClosed(&'static str),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("engine is not running")]
    Dead,

    #[error("{0}")]
    Internal(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Lifecycle notifications published by engine handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleEvent {
    /// The handle was closed (directly or by cascade)
    Close,
    /// The transport owning this producer/consumer closed
    TransportClose,
    /// The producer feeding this consumer closed
    ProducerClose,
}

/// Engine process health
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHealth {
    Running,
    /// The worker died; router and transport state is unrecoverable
    Dead(String),
}

/// One codec entry of a capability descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RtpCodecCapability {
    /// Same codec as far as forwarding is concerned
    #[must_use]
    pub fn matches(&self, mime_type: &str, clock_rate: u32, channels: Option<u8>) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type)
            && self.clock_rate == clock_rate
            && channels_match(self.channels, channels)
    }
}

fn channels_match(a: Option<u8>, b: Option<u8>) -> bool {
    // Absent channels means mono for audio and is irrelevant for video
    a.unwrap_or(1) == b.unwrap_or(1)
}

/// Router or peer capability descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Codec negotiated on a producer or consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// RTP parameters of a producer or consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// What a peer needs to set up its side of a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: DtlsParameters,
}

/// Simulcast/SVC layer preference for a video consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<u8>,
}

/// Router-level entry point of the engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Capability descriptor peers load their device with
    fn capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        room: &RoomId,
        direction: Direction,
    ) -> EngineResult<Arc<dyn WebRtcTransport>>;

    /// Whether a peer with `capabilities` can receive `producer`
    fn can_consume(&self, producer: &ProducerId, capabilities: &RtpCapabilities) -> bool;

    fn health(&self) -> watch::Receiver<EngineHealth>;
}

#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn direction(&self) -> Direction;

    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls: DtlsParameters) -> EngineResult<()>;

    fn is_connected(&self) -> bool;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn Producer>>;

    /// Create a consumer of `producer`; consumers always start paused
    async fn consume(
        &self,
        producer: &ProducerId,
        capabilities: &RtpCapabilities,
    ) -> EngineResult<Arc<dyn Consumer>>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<HandleEvent>;
}

pub trait Producer: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<HandleEvent>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> EngineResult<()>;

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> EngineResult<()>;

    fn preferred_layers(&self) -> Option<ConsumerLayers>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<HandleEvent>;
}
