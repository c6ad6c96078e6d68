//! Per-connection signaling state
//!
//! A [`SignalingSession`] owns one peer's view of the SFU: the room it joined,
//! whether it still broadcasts there, and the request handlers. Requests are
//! handled one at a time in arrival order.

use std::sync::Arc;

use livecast_core::models::{AudioPolicy, MediaKind, PeerId, Role, RoomId, RoomRef};
use livecast_sfu::{
    Admission, AuthorizationGate, Direction, MediaEngine, RoomEvent, RoomRegistry, SfuError,
    SfuResult, WebRtcTransport,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::protocol::{
    decode, ClientRequest, Consume, ConnectTransport, Produce, Resume, RoomTarget, ServerFrame,
};

/// Shared services every session talks to
pub struct SignalingContext {
    pub engine: Arc<dyn MediaEngine>,
    pub registry: Arc<RoomRegistry>,
    pub gate: Arc<AuthorizationGate>,
    /// Audio handling on a video switch when the request does not say
    pub audio_policy: AudioPolicy,
}

pub struct SignalingSession {
    ctx: Arc<SignalingContext>,
    admission: Admission,
    room: Option<RoomId>,
}

impl SignalingSession {
    /// Register the peer for room events and join the handshake room
    ///
    /// Returns the session and the peer's event stream.
    pub async fn open(
        ctx: Arc<SignalingContext>,
        admission: Admission,
    ) -> SfuResult<(Self, mpsc::Receiver<RoomEvent>)> {
        let events = ctx.registry.notifier().register(admission.peer_id.clone());
        let mut session = Self {
            ctx,
            admission,
            room: None,
        };

        if let Some(live) = session.admission.room.clone() {
            if let Err(err) = session.enter(&live.id).await {
                session.close();
                return Err(err);
            }
        }

        Ok((session, events))
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.admission.peer_id
    }

    #[must_use]
    pub const fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    #[must_use]
    pub const fn is_host(&self) -> bool {
        self.admission.is_host
    }

    /// Handle one text frame and build its reply
    pub async fn handle(&mut self, text: &str) -> ServerFrame {
        let (id, request) = match decode(text) {
            Ok(decoded) => decoded,
            Err((id, err)) => {
                debug!(peer_id = %self.admission.peer_id, error = %err.message(), "Rejected frame");
                return ServerFrame::protocol_error(id, &err);
            }
        };

        let event = request.event();
        match self.dispatch(request).await {
            Ok(data) => ServerFrame::reply(id, data),
            Err(err) => {
                debug!(
                    peer_id = %self.admission.peer_id,
                    event,
                    code = err.code(),
                    error = %err,
                    "Request failed"
                );
                ServerFrame::error(id, &err)
            }
        }
    }

    async fn dispatch(&mut self, request: ClientRequest) -> SfuResult<Value> {
        match request {
            ClientRequest::GetRtpCapabilities => Ok(to_value(self.ctx.engine.capabilities())),
            ClientRequest::CreateSendTransport => {
                let room = self.host_room()?;
                self.create_transport(&room, Direction::Send).await
            }
            ClientRequest::ConnectSendTransport(req) => {
                let room = self.host_room()?;
                self.connect_transport(&room, Direction::Send, req).await
            }
            ClientRequest::Produce(req) => self.produce(req).await,
            ClientRequest::CreateRecvTransport => {
                let room = self.joined_room()?;
                self.create_transport(&room, Direction::Recv).await
            }
            ClientRequest::ConnectRecvTransport(req) => {
                let room = self.joined_room()?;
                self.connect_transport(&room, Direction::Recv, req).await
            }
            ClientRequest::Consume(req) => self.consume(req).await,
            ClientRequest::Resume(req) => self.resume(req).await,
            ClientRequest::SetPreferredLayers(layers) => {
                let room = self.joined_room()?;
                let consumer = self
                    .ctx
                    .registry
                    .current_consumer(&room, &self.admission.peer_id, MediaKind::Video)
                    .ok_or(SfuError::NoConsumer)?;
                consumer.set_preferred_layers(layers).await?;
                Ok(ok())
            }
            ClientRequest::Join(target) => self.join(target).await,
            ClientRequest::Leave(target) => self.leave(target).await,
            ClientRequest::Heartbeat => {
                if self.admission.is_host {
                    self.ctx.gate.authorize_action(&self.admission)?;
                }
                Ok(ok())
            }
        }
    }

    /// Room this connection broadcasts into, with the seat refreshed
    fn host_room(&self) -> SfuResult<RoomId> {
        self.ctx.gate.authorize_action(&self.admission)?;
        match (&self.admission.room, &self.room) {
            (Some(live), Some(current)) if &live.id == current => Ok(live.id.clone()),
            _ => Err(SfuError::NotAuthorized(
                "not broadcasting in the current room".to_string(),
            )),
        }
    }

    fn joined_room(&self) -> SfuResult<RoomId> {
        self.room
            .clone()
            .ok_or_else(|| SfuError::RoomNotFound("no room joined".to_string()))
    }

    async fn create_transport(&self, room: &RoomId, direction: Direction) -> SfuResult<Value> {
        let peer = &self.admission.peer_id;
        if self.ctx.registry.transport(room, peer, direction).is_some() {
            return Err(SfuError::TransportAlreadyExists(direction));
        }

        let transport = self.ctx.engine.create_transport(room, direction).await?;
        self.ctx
            .registry
            .record_transport(room, peer, Arc::clone(&transport))?;
        debug!(peer_id = %peer, room_id = %room, transport_id = %transport.id(), direction = %direction, "Transport created");
        Ok(to_value(transport.params()))
    }

    fn transport(&self, room: &RoomId, direction: Direction) -> SfuResult<Arc<dyn WebRtcTransport>> {
        self.ctx
            .registry
            .transport(room, &self.admission.peer_id, direction)
            .ok_or(SfuError::NoTransport(direction))
    }

    async fn connect_transport(
        &self,
        room: &RoomId,
        direction: Direction,
        req: ConnectTransport,
    ) -> SfuResult<Value> {
        let transport = self.transport(room, direction)?;
        transport
            .connect(req.dtls_parameters)
            .await
            .map_err(|e| SfuError::ConnectFailed(e.to_string()))?;
        Ok(ok())
    }

    async fn produce(&self, req: Produce) -> SfuResult<Value> {
        let room = self.host_room()?;
        let transport = self.transport(&room, Direction::Send)?;
        if !transport.is_connected() {
            return Err(SfuError::NoTransport(Direction::Send));
        }

        let producer = transport.produce(req.kind, req.rtp_parameters).await?;
        let producer_id = producer.id().clone();
        self.ctx.registry.replace_producer(
            &room,
            &self.admission.peer_id,
            producer,
            req.audio.unwrap_or(self.ctx.audio_policy),
        )?;
        Ok(json!({ "id": producer_id }))
    }

    async fn consume(&self, req: Consume) -> SfuResult<Value> {
        let room = self.joined_room()?;
        let transport = self.transport(&room, Direction::Recv)?;
        let producer = self
            .ctx
            .registry
            .producer(&room, req.kind)
            .ok_or(SfuError::NoProducer(req.kind))?;
        if !self
            .ctx
            .engine
            .can_consume(producer.id(), &req.rtp_capabilities)
        {
            return Err(SfuError::IncompatibleCapabilities);
        }

        let consumer = transport
            .consume(producer.id(), &req.rtp_capabilities)
            .await?;
        let reply = json!({
            "id": consumer.id(),
            "producerId": consumer.producer_id(),
            "kind": consumer.kind(),
            "rtpParameters": consumer.rtp_parameters(),
            "paused": consumer.is_paused(),
        });
        self.ctx
            .registry
            .record_consumer(&room, &self.admission.peer_id, consumer)?;
        Ok(reply)
    }

    async fn resume(&self, req: Resume) -> SfuResult<Value> {
        let room = self.joined_room()?;
        let consumer = self
            .ctx
            .registry
            .consumer(&room, &self.admission.peer_id, &req.consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(req.consumer_id.to_string()))?;
        consumer.resume().await?;
        Ok(ok())
    }

    async fn join(&mut self, target: RoomTarget) -> SfuResult<Value> {
        let live = self
            .ctx
            .gate
            .resolve(&RoomRef::Id(RoomId::from(target.room_id)))
            .await?;

        if self.room.as_ref() != Some(&live.id) {
            self.exit_current();
            if self.admission.is_host
                && self.admission.room.as_ref().map(|l| &l.id) != Some(&live.id)
            {
                self.step_down();
            }
        }

        let viewers = self.enter(&live.id).await?;
        Ok(json!({ "roomId": live.id, "viewers": viewers }))
    }

    async fn leave(&mut self, target: RoomTarget) -> SfuResult<Value> {
        let live = self
            .ctx
            .gate
            .resolve(&RoomRef::Id(RoomId::from(target.room_id)))
            .await?;
        if self.room.as_ref() == Some(&live.id) {
            self.exit_current();
            if self.admission.is_host {
                self.step_down();
            }
        }
        Ok(ok())
    }

    async fn enter(&mut self, room_id: &RoomId) -> SfuResult<usize> {
        let role = if self.admission.is_host {
            Role::Broadcaster
        } else {
            Role::Viewer
        };
        let viewers = self
            .ctx
            .registry
            .join(room_id, &self.admission.peer_id, role)
            .await?;
        self.room = Some(room_id.clone());
        info!(peer_id = %self.admission.peer_id, room_id = %room_id, role = %role, viewers, "Peer entered room");
        Ok(viewers)
    }

    fn exit_current(&mut self) {
        if let Some(room) = self.room.take() {
            self.ctx.registry.release_peer(&room, &self.admission.peer_id);
        }
    }

    /// Stop broadcasting and give the seat back
    fn step_down(&mut self) {
        self.ctx.gate.release(&self.admission);
        self.admission.is_host = false;
        self.admission.lease = None;
        info!(peer_id = %self.admission.peer_id, "Broadcaster stepped down");
    }

    /// Release everything the connection holds
    pub fn close(&mut self) {
        self.exit_current();
        self.ctx.registry.notifier().unregister(&self.admission.peer_id);
        self.ctx.gate.release(&self.admission);
        self.admission.lease = None;
        self.admission.is_host = false;
    }
}

fn ok() -> Value {
    Value::String("ok".to_string())
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
