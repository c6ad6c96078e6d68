//! Signaling wire format
//!
//! Text frames carrying JSON:
//!
//! - request `{"id": 7, "event": "produce", "data": {...}}`
//! - reply `{"id": 7, "data": <payload>}`, where a failed request's payload is
//!   `{"error": "<message>", "code": "<code>"}`
//! - push `{"event": "newProducer", "data": {...}}`

use livecast_core::models::{AudioPolicy, MediaKind};
use livecast_sfu::{
    ConsumerId, ConsumerLayers, DtlsParameters, RoomEvent, RtpCapabilities, RtpParameters,
    SfuError,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

/// Id used in replies to frames whose id could not be read
pub const UNKNOWN_REQUEST_ID: u64 = 0;

#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    /// Overrides the configured audio handling for a video source switch
    #[serde(default)]
    pub audio: Option<AudioPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consume {
    pub kind: MediaKind,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resume {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomTarget {
    #[serde(alias = "liveId", alias = "slug")]
    pub room_id: String,
}

/// A parsed signaling request
#[derive(Debug, Clone)]
pub enum ClientRequest {
    GetRtpCapabilities,
    CreateSendTransport,
    ConnectSendTransport(ConnectTransport),
    Produce(Produce),
    CreateRecvTransport,
    ConnectRecvTransport(ConnectTransport),
    Consume(Consume),
    Resume(Resume),
    SetPreferredLayers(ConsumerLayers),
    Join(RoomTarget),
    Leave(RoomTarget),
    /// Keeps the broadcaster's seat alive while idle
    Heartbeat,
}

/// Why a frame could not be turned into a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Invalid(String),
    UnknownEvent(String),
}

impl ProtocolError {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Invalid(reason) => format!("invalid request: {reason}"),
            Self::UnknownEvent(event) => format!("unknown event {event}"),
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid_request",
            Self::UnknownEvent(_) => "unknown_event",
        }
    }
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

impl ClientRequest {
    pub fn parse(event: &str, data: Value) -> Result<Self, ProtocolError> {
        Ok(match event {
            "getRtpCapabilities" => Self::GetRtpCapabilities,
            "createSendTransport" => Self::CreateSendTransport,
            "connectSendTransport" => Self::ConnectSendTransport(payload(data)?),
            "produce" => Self::Produce(payload(data)?),
            "createRecvTransport" => Self::CreateRecvTransport,
            "connectRecvTransport" => Self::ConnectRecvTransport(payload(data)?),
            "consume" => Self::Consume(payload(data)?),
            "resume" => Self::Resume(payload(data)?),
            "setPreferredLayers" => Self::SetPreferredLayers(payload(data)?),
            "join" => Self::Join(payload(data)?),
            "leave" => Self::Leave(payload(data)?),
            "heartbeat" => Self::Heartbeat,
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        })
    }

    /// Wire name of the request
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::GetRtpCapabilities => "getRtpCapabilities",
            Self::CreateSendTransport => "createSendTransport",
            Self::ConnectSendTransport(_) => "connectSendTransport",
            Self::Produce(_) => "produce",
            Self::CreateRecvTransport => "createRecvTransport",
            Self::ConnectRecvTransport(_) => "connectRecvTransport",
            Self::Consume(_) => "consume",
            Self::Resume(_) => "resume",
            Self::SetPreferredLayers(_) => "setPreferredLayers",
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Decode a text frame into its id and request
pub fn decode(text: &str) -> Result<(u64, ClientRequest), (u64, ProtocolError)> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| (UNKNOWN_REQUEST_ID, ProtocolError::Invalid(e.to_string())))?;
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .unwrap_or(UNKNOWN_REQUEST_ID);
    let frame: RequestFrame =
        serde_json::from_value(value).map_err(|e| (id, ProtocolError::Invalid(e.to_string())))?;
    let request = ClientRequest::parse(&frame.event, frame.data).map_err(|e| (frame.id, e))?;
    Ok((frame.id, request))
}

/// Frame sent from server to peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Reply { id: u64, data: Value },
    Event(RoomEvent),
}

impl ServerFrame {
    #[must_use]
    pub const fn reply(id: u64, data: Value) -> Self {
        Self::Reply { id, data }
    }

    #[must_use]
    pub fn error(id: u64, err: &SfuError) -> Self {
        Self::reply(id, json!({ "error": err.to_string(), "code": err.code() }))
    }

    #[must_use]
    pub fn protocol_error(id: u64, err: &ProtocolError) -> Self {
        Self::reply(id, json!({ "error": err.message(), "code": err.code() }))
    }

    /// Encode for the wire
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode server frame");
            r#"{"id":0,"data":{"error":"internal error","code":"internal"}}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_requests() {
        let (id, request) = decode(r#"{"id": 3, "event": "getRtpCapabilities"}"#).unwrap();
        assert_eq!(id, 3);
        assert!(matches!(request, ClientRequest::GetRtpCapabilities));

        let (_, request) = decode(
            r#"{"id": 4, "event": "produce", "data": {"kind": "video", "rtpParameters": {"codecs": []}, "audio": "drop"}}"#,
        )
        .unwrap();
        match request {
            ClientRequest::Produce(produce) => {
                assert_eq!(produce.kind, MediaKind::Video);
                assert_eq!(produce.audio, Some(AudioPolicy::Drop));
            }
            other => panic!("unexpected request {other:?}"),
        }

        let (_, request) = decode(
            r#"{"id": 5, "event": "setPreferredLayers", "data": {"spatialLayer": 2}}"#,
        )
        .unwrap();
        assert!(matches!(
            request,
            ClientRequest::SetPreferredLayers(ConsumerLayers {
                spatial_layer: 2,
                temporal_layer: None
            })
        ));

        let (_, request) =
            decode(r#"{"id": 6, "event": "join", "data": {"liveId": "abc"}}"#).unwrap();
        assert!(matches!(request, ClientRequest::Join(RoomTarget { room_id }) if room_id == "abc"));
    }

    #[test]
    fn test_decode_errors_keep_the_id_when_possible() {
        let (id, err) = decode("not json").unwrap_err();
        assert_eq!(id, UNKNOWN_REQUEST_ID);
        assert_eq!(err.code(), "invalid_request");

        let (id, err) = decode(r#"{"id": 9, "event": "dance"}"#).unwrap_err();
        assert_eq!(id, 9);
        assert_eq!(err.message(), "unknown event dance");

        let (id, err) = decode(r#"{"id": 10, "event": "consume", "data": {"kind": "smell"}}"#)
            .unwrap_err();
        assert_eq!(id, 10);
        assert!(err.message().starts_with("invalid request"));

        let (id, _) = decode(r#"{"id": "x", "event": "heartbeat"}"#).unwrap_err();
        assert_eq!(id, UNKNOWN_REQUEST_ID);
    }

    #[test]
    fn test_server_frames() {
        assert_eq!(ServerFrame::reply(1, json!("ok")).encode(), r#"{"id":1,"data":"ok"}"#);

        let frame = ServerFrame::error(2, &SfuError::NoProducer(MediaKind::Video));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["data"]["error"], "no video producer");
        assert_eq!(value["data"]["code"], "no_producer");

        let frame = ServerFrame::Event(RoomEvent::ViewerCount { count: 3 });
        assert_eq!(frame.encode(), r#"{"event":"viewerCount","data":{"count":3}}"#);
    }
}
