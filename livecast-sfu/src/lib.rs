//! Livecast SFU orchestration
//!
//! Server-side state machine in front of a selective-forwarding media engine:
//!
//! - **`MediaEngine`**: adapter traits for the engine, plus the in-process `LocalEngine`
//! - **`RoomRegistry`**: per-room producers, transports, consumers and membership;
//!   at most one producer per media kind and room
//! - **`AuthorizationGate`**: who may broadcast, backed by exclusive `SeatRegistry` locks
//! - **`RoomNotifier`**: pushes room events to connected peers
//! - **`Resubscriber`**: viewer-side re-subscription on source switch
//!
//! ## Usage
//!
//! ```rust,ignore
//! let notifier = RoomNotifier::new();
//! let registry = RoomRegistry::new(store.clone(), notifier.clone());
//!
//! let room = registry.get_or_create_state(&room_id).await?;
//! let transport = engine.create_transport(&room_id, Direction::Send).await?;
//! registry.record_transport(&room_id, &peer_id, transport.clone())?;
//! let producer = transport.produce(MediaKind::Video, rtp_parameters).await?;
//! registry.replace_producer(&room_id, &peer_id, producer, AudioPolicy::KeepExisting)?;
//! ```

pub mod engine;
mod error;
mod gate;
mod local;
mod notifier;
mod registry;
mod seat;
mod subscription;
mod types;

pub use engine::{
    Consumer, ConsumerLayers, DtlsParameters, EngineError, EngineHealth, EngineResult,
    HandleEvent, MediaEngine, Producer, RtpCapabilities, RtpParameters, TransportParams,
    WebRtcTransport,
};
pub use error::{SfuError, SfuResult};
pub use gate::{Admission, AuthorizationGate, Handshake};
pub use local::LocalEngine;
pub use notifier::{EventSender, RoomEvent, RoomNotifier};
pub use registry::{PeerResources, Room, RoomRegistry};
pub use seat::{SeatLease, SeatRegistry};
pub use subscription::{Action, Resubscriber, RetryPolicy, SubscriptionState};
pub use types::{ConsumerId, Direction, ProducerId, TransportId};
