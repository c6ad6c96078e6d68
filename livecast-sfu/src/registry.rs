//! Room registry
//!
//! Single source of truth for per-room media state. Each room's state sits
//! behind its own mutex; every mutation, and every event it causes, happens
//! while that mutex is held, so members observe room events in mutation order.
//! The mutex is never held across an engine call: handles are created before
//! they are recorded and closed after the lock is dropped.

use dashmap::DashMap;
use livecast_core::models::{AudioPolicy, MediaKind, PeerId, Role, RoomId};
use livecast_core::LiveStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::engine::{Consumer, Producer, WebRtcTransport};
use crate::error::{SfuError, SfuResult};
use crate::notifier::{RoomEvent, RoomNotifier};
use crate::types::{ConsumerId, Direction, ProducerId};

struct ProducerSlot {
    producer: Arc<dyn Producer>,
    owner: PeerId,
}

#[derive(Default)]
struct PeerMedia {
    send: Option<Arc<dyn WebRtcTransport>>,
    recv: Option<Arc<dyn WebRtcTransport>>,
    consumers: HashMap<ConsumerId, Arc<dyn Consumer>>,
    current: HashMap<MediaKind, ConsumerId>,
}

impl PeerMedia {
    fn transport_slot(&mut self, direction: Direction) -> &mut Option<Arc<dyn WebRtcTransport>> {
        match direction {
            Direction::Send => &mut self.send,
            Direction::Recv => &mut self.recv,
        }
    }
}

#[derive(Default)]
struct RoomState {
    video: Option<ProducerSlot>,
    audio: Option<ProducerSlot>,
    peers: HashMap<PeerId, PeerMedia>,
    members: HashMap<PeerId, Role>,
    closed: bool,
}

impl RoomState {
    fn slot(&mut self, kind: MediaKind) -> &mut Option<ProducerSlot> {
        match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        }
    }

    fn viewer_count(&self) -> usize {
        self.members
            .values()
            .filter(|role| **role == Role::Viewer)
            .count()
    }
}

/// Handles taken out of a room, closed once the room lock is released
#[derive(Default)]
struct Teardown {
    consumers: Vec<Arc<dyn Consumer>>,
    producers: Vec<Arc<dyn Producer>>,
    transports: Vec<Arc<dyn WebRtcTransport>>,
}

impl Teardown {
    fn take_peer(&mut self, media: PeerMedia) {
        self.consumers.extend(media.consumers.into_values());
        self.transports.extend(media.send);
        self.transports.extend(media.recv);
    }

    fn is_empty(&self) -> bool {
        self.consumers.is_empty() && self.producers.is_empty() && self.transports.is_empty()
    }

    fn run(self) {
        for consumer in self.consumers {
            consumer.close();
        }
        for producer in self.producers {
            producer.close();
        }
        for transport in self.transports {
            transport.close();
        }
    }
}

/// Live session state of one room
pub struct Room {
    id: RoomId,
    state: Mutex<RoomState>,
    notifier: RoomNotifier,
}

impl Room {
    fn new(id: RoomId, notifier: RoomNotifier) -> Self {
        Self {
            id,
            state: Mutex::new(RoomState::default()),
            notifier,
        }
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    fn broadcast(&self, state: &RoomState, event: &RoomEvent) {
        self.notifier.deliver(state.members.keys(), event);
    }

    fn broadcast_viewer_count(&self, state: &RoomState) {
        let count = state.viewer_count();
        self.broadcast(state, &RoomEvent::ViewerCount { count });
    }

    /// Drop the producer of `kind` if it is still `producer_id`
    fn clear_producer(&self, kind: MediaKind, producer_id: &ProducerId) {
        let mut state = self.state.lock();
        let current = state
            .slot(kind)
            .as_ref()
            .is_some_and(|slot| slot.producer.id() == producer_id);
        if current {
            *state.slot(kind) = None;
            info!(room_id = %self.id, producer_id = %producer_id, kind = %kind, "Producer gone");
            self.broadcast(
                &state,
                &RoomEvent::ProducerClosed {
                    room_id: self.id.clone(),
                    kind,
                },
            );
        }
    }
}

/// Snapshot of what a peer holds in a room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerResources {
    pub send_transport: bool,
    pub recv_transport: bool,
    pub consumers: usize,
    pub member: bool,
}

impl PeerResources {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.send_transport && !self.recv_transport && self.consumers == 0 && !self.member
    }
}

/// Registry of live rooms
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<Room>>,
    store: Arc<dyn LiveStore>,
    notifier: RoomNotifier,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn LiveStore>, notifier: RoomNotifier) -> Self {
        Self {
            rooms: DashMap::new(),
            store,
            notifier,
        }
    }

    #[must_use]
    pub fn notifier(&self) -> &RoomNotifier {
        &self.notifier
    }

    /// State of an active live, created on first use
    pub async fn get_or_create_state(&self, room_id: &RoomId) -> SfuResult<Arc<Room>> {
        if let Some(room) = self.rooms.get(room_id) {
            return Ok(Arc::clone(room.value()));
        }

        if !self.is_active(room_id).await? {
            return Err(SfuError::RoomNotFound(room_id.to_string()));
        }

        let room = Arc::clone(
            self.rooms
                .entry(room_id.clone())
                .or_insert_with(|| {
                    debug!(room_id = %room_id, "Room state created");
                    Arc::new(Room::new(room_id.clone(), self.notifier.clone()))
                })
                .value(),
        );

        // The live may have ended, and its room been closed, while it was looked up
        if !self.is_active(room_id).await? {
            self.close_room(room_id);
            return Err(SfuError::RoomNotFound(room_id.to_string()));
        }
        Ok(room)
    }

    async fn is_active(&self, room_id: &RoomId) -> SfuResult<bool> {
        Ok(self
            .store
            .get(room_id)
            .await?
            .is_some_and(|live| live.active))
    }

    fn room(&self, room_id: &RoomId) -> SfuResult<Arc<Room>> {
        self.rooms
            .get(room_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| SfuError::RoomNotFound(room_id.to_string()))
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Make `producer` the room's producer of its kind
    ///
    /// The swap and the `newProducer` push happen atomically; the previous
    /// producer is closed afterwards. For video, `audio_policy` decides what
    /// happens to the current audio producer when a previous video producer
    /// existed. Returns the id of the replaced producer.
    pub fn replace_producer(
        &self,
        room_id: &RoomId,
        owner: &PeerId,
        producer: Arc<dyn Producer>,
        audio_policy: AudioPolicy,
    ) -> SfuResult<Option<ProducerId>> {
        let room = match self.room(room_id) {
            Ok(room) => room,
            Err(err) => {
                producer.close();
                return Err(err);
            }
        };
        let kind = producer.kind();
        let mut teardown = Teardown::default();

        let replaced = {
            let mut state = room.state.lock();
            if state.closed {
                drop(state);
                producer.close();
                return Err(SfuError::RoomNotFound(room_id.to_string()));
            }

            let old = state.slot(kind).replace(ProducerSlot {
                producer: Arc::clone(&producer),
                owner: owner.clone(),
            });
            let replaced = old.as_ref().map(|slot| slot.producer.id().clone());

            if kind == MediaKind::Video && replaced.is_some() {
                match audio_policy {
                    AudioPolicy::KeepExisting => {}
                    AudioPolicy::Replace => {
                        if let Some(audio) = state.audio.take() {
                            teardown.producers.push(audio.producer);
                        }
                    }
                    AudioPolicy::Drop => {
                        if let Some(audio) = state.audio.take() {
                            teardown.producers.push(audio.producer);
                            room.broadcast(
                                &state,
                                &RoomEvent::ProducerClosed {
                                    room_id: room_id.clone(),
                                    kind: MediaKind::Audio,
                                },
                            );
                        }
                    }
                }
            }

            room.broadcast(
                &state,
                &RoomEvent::NewProducer {
                    room_id: room_id.clone(),
                    kind,
                },
            );
            teardown.producers.extend(old.map(|slot| slot.producer));
            replaced
        };

        info!(
            room_id = %room_id,
            peer_id = %owner,
            producer_id = %producer.id(),
            kind = %kind,
            replaced = ?replaced,
            "Producer is now current"
        );
        teardown.run();
        watch_producer(&room, producer);
        Ok(replaced)
    }

    /// Record a freshly created transport for `peer_id`
    ///
    /// A peer holds at most one open transport per direction. On rejection the
    /// transport is closed.
    pub fn record_transport(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        transport: Arc<dyn WebRtcTransport>,
    ) -> SfuResult<()> {
        let direction = transport.direction();
        let result = self.room(room_id).and_then(|room| {
            let mut state = room.state.lock();
            if state.closed {
                return Err(SfuError::RoomNotFound(room_id.to_string()));
            }
            let slot = state
                .peers
                .entry(peer_id.clone())
                .or_default()
                .transport_slot(direction);
            if slot.as_ref().is_some_and(|t| !t.is_closed()) {
                return Err(SfuError::TransportAlreadyExists(direction));
            }
            *slot = Some(Arc::clone(&transport));
            Ok(())
        });

        if result.is_err() {
            transport.close();
        } else {
            debug!(room_id = %room_id, peer_id = %peer_id, transport_id = %transport.id(), direction = %direction, "Transport recorded");
        }
        result
    }

    /// Record a consumer for `peer_id`, closing its previous consumer of the same kind
    pub fn record_consumer(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        consumer: Arc<dyn Consumer>,
    ) -> SfuResult<()> {
        let room = match self.room(room_id) {
            Ok(room) => room,
            Err(err) => {
                consumer.close();
                return Err(err);
            }
        };

        let previous = {
            let mut state = room.state.lock();
            if state.closed {
                drop(state);
                consumer.close();
                return Err(SfuError::RoomNotFound(room_id.to_string()));
            }
            let media = state.peers.entry(peer_id.clone()).or_default();
            media.consumers.retain(|_, c| !c.is_closed());
            let previous = media
                .current
                .insert(consumer.kind(), consumer.id().clone())
                .and_then(|id| media.consumers.remove(&id));
            media
                .consumers
                .insert(consumer.id().clone(), Arc::clone(&consumer));
            previous
        };

        debug!(room_id = %room_id, peer_id = %peer_id, consumer_id = %consumer.id(), kind = %consumer.kind(), "Consumer recorded");
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(())
    }

    /// Close and forget everything `peer_id` holds in the room
    ///
    /// Producers it owns are cleared (`producerClosed`) and membership is
    /// dropped (`viewerCount`). Calling it again is a no-op. Returns whether
    /// anything was released.
    pub fn release_peer(&self, room_id: &RoomId, peer_id: &PeerId) -> bool {
        let Ok(room) = self.room(room_id) else {
            return false;
        };
        let mut teardown = Teardown::default();

        {
            let mut state = room.state.lock();
            if let Some(media) = state.peers.remove(peer_id) {
                teardown.take_peer(media);
            }

            for kind in [MediaKind::Video, MediaKind::Audio] {
                let owned = state
                    .slot(kind)
                    .as_ref()
                    .is_some_and(|slot| &slot.owner == peer_id);
                if owned {
                    if let Some(slot) = state.slot(kind).take() {
                        teardown.producers.push(slot.producer);
                    }
                    room.broadcast(
                        &state,
                        &RoomEvent::ProducerClosed {
                            room_id: room_id.clone(),
                            kind,
                        },
                    );
                }
            }

            let was_member = state.members.remove(peer_id).is_some();
            if was_member {
                room.broadcast_viewer_count(&state);
            }
            if !was_member && teardown.is_empty() {
                return false;
            }
        }

        debug!(room_id = %room_id, peer_id = %peer_id, "Peer released");
        teardown.run();
        true
    }

    /// Add `peer_id` to the room's members; returns the viewer count
    pub async fn join(&self, room_id: &RoomId, peer_id: &PeerId, role: Role) -> SfuResult<usize> {
        let room = self.get_or_create_state(room_id).await?;
        let mut state = room.state.lock();
        if state.closed {
            return Err(SfuError::RoomNotFound(room_id.to_string()));
        }
        let changed = state.members.insert(peer_id.clone(), role) != Some(role);
        let count = state.viewer_count();
        if changed {
            room.broadcast_viewer_count(&state);
            debug!(room_id = %room_id, peer_id = %peer_id, role = %role, viewers = count, "Peer joined");
        }
        Ok(count)
    }

    /// Release `peer_id` from the room; returns the remaining viewer count
    pub fn leave(&self, room_id: &RoomId, peer_id: &PeerId) -> SfuResult<usize> {
        let room = self.room(room_id)?;
        self.release_peer(room_id, peer_id);
        let count = room.state.lock().viewer_count();
        Ok(count)
    }

    /// Tear down a room: every handle is closed and members get `liveEnded`
    pub fn close_room(&self, room_id: &RoomId) -> bool {
        let Some((_, room)) = self.rooms.remove(room_id) else {
            return false;
        };
        let mut teardown = Teardown::default();

        {
            let mut state = room.state.lock();
            state.closed = true;
            teardown
                .producers
                .extend(state.video.take().map(|slot| slot.producer));
            teardown
                .producers
                .extend(state.audio.take().map(|slot| slot.producer));
            for (_, media) in state.peers.drain() {
                teardown.take_peer(media);
            }
            room.broadcast(
                &state,
                &RoomEvent::LiveEnded {
                    room_id: room_id.clone(),
                },
            );
            state.members.clear();
        }

        info!(room_id = %room_id, "Room closed");
        teardown.run();
        true
    }

    /// Close every room (process shutdown)
    pub fn close_all(&self) -> usize {
        let ids: Vec<RoomId> = self.rooms.iter().map(|r| r.key().clone()).collect();
        ids.iter().filter(|id| self.close_room(id)).count()
    }

    #[must_use]
    pub fn producer(&self, room_id: &RoomId, kind: MediaKind) -> Option<Arc<dyn Producer>> {
        let room = self.room(room_id).ok()?;
        let mut state = room.state.lock();
        state
            .slot(kind)
            .as_ref()
            .map(|slot| Arc::clone(&slot.producer))
    }

    #[must_use]
    pub fn transport(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Option<Arc<dyn WebRtcTransport>> {
        let room = self.room(room_id).ok()?;
        let mut state = room.state.lock();
        state
            .peers
            .get_mut(peer_id)
            .and_then(|media| media.transport_slot(direction).clone())
            .filter(|t| !t.is_closed())
    }

    #[must_use]
    pub fn consumer(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        consumer_id: &ConsumerId,
    ) -> Option<Arc<dyn Consumer>> {
        let room = self.room(room_id).ok()?;
        let state = room.state.lock();
        state
            .peers
            .get(peer_id)
            .and_then(|media| media.consumers.get(consumer_id).cloned())
    }

    /// Current consumer of `kind` for a peer
    #[must_use]
    pub fn current_consumer(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        kind: MediaKind,
    ) -> Option<Arc<dyn Consumer>> {
        let room = self.room(room_id).ok()?;
        let state = room.state.lock();
        let media = state.peers.get(peer_id)?;
        let id = media.current.get(&kind)?;
        media.consumers.get(id).filter(|c| !c.is_closed()).cloned()
    }

    #[must_use]
    pub fn viewer_count(&self, room_id: &RoomId) -> usize {
        self.room(room_id)
            .map(|room| room.state.lock().viewer_count())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn peer_resources(&self, room_id: &RoomId, peer_id: &PeerId) -> PeerResources {
        let Ok(room) = self.room(room_id) else {
            return PeerResources::default();
        };
        let state = room.state.lock();
        let mut resources = PeerResources {
            member: state.members.contains_key(peer_id),
            ..PeerResources::default()
        };
        if let Some(media) = state.peers.get(peer_id) {
            resources.send_transport = media.send.as_ref().is_some_and(|t| !t.is_closed());
            resources.recv_transport = media.recv.as_ref().is_some_and(|t| !t.is_closed());
            resources.consumers = media.consumers.values().filter(|c| !c.is_closed()).count();
        }
        resources
    }
}

/// Clear the room's slot when `producer` goes away on its own
fn watch_producer(room: &Arc<Room>, producer: Arc<dyn Producer>) {
    let mut events = producer.subscribe();
    let room: Weak<Room> = Arc::downgrade(room);

    tokio::spawn(async move {
        if !producer.is_closed() {
            loop {
                match events.recv().await {
                    Ok(_) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => {
                        if producer.is_closed() {
                            break;
                        }
                    }
                }
            }
        }
        if let Some(room) = room.upgrade() {
            room.clear_producer(producer.kind(), producer.id());
        }
    });
}
