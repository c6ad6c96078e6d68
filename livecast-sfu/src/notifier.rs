//! Fan-out of room events to connected peers

use dashmap::DashMap;
use livecast_core::models::{MediaKind, PeerId, RoomId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Event pushed to room members
///
/// Serializes to the `{"event": ..., "data": ...}` push frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RoomEvent {
    /// A producer of `kind` became current (first publish or source switch)
    NewProducer { room_id: RoomId, kind: MediaKind },
    /// The producer of `kind` went away without a replacement
    ProducerClosed { room_id: RoomId, kind: MediaKind },
    ViewerCount { count: usize },
    LiveEnded { room_id: RoomId },
}

impl RoomEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::NewProducer { .. } => "newProducer",
            Self::ProducerClosed { .. } => "producerClosed",
            Self::ViewerCount { .. } => "viewerCount",
            Self::LiveEnded { .. } => "liveEnded",
        }
    }
}

pub type EventSender = mpsc::Sender<RoomEvent>;

/// Queue length used by [`RoomNotifier::new`]
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Per-connection event queues
///
/// The notifier only knows connections; which connections make up a room is
/// the registry's business, so ordering within a room follows the order in
/// which the registry calls [`RoomNotifier::deliver`].
///
/// Queues are bounded. A peer whose queue is full has stopped reading; its
/// queue is dropped, which ends its connection.
#[derive(Clone)]
pub struct RoomNotifier {
    senders: Arc<DashMap<PeerId, EventSender>>,
    capacity: usize,
}

impl Default for RoomNotifier {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_BUFFER)
    }
}

impl RoomNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            senders: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open the event queue of a connection
    pub fn register(&self, peer_id: PeerId) -> mpsc::Receiver<RoomEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.senders.insert(peer_id.clone(), tx).is_some() {
            warn!(peer_id = %peer_id, "Peer registered twice, previous queue dropped");
        }
        rx
    }

    pub fn unregister(&self, peer_id: &PeerId) {
        self.senders.remove(peer_id);
    }

    /// Push `event` to each of `peers`; returns how many queues accepted it
    pub fn deliver<'a>(&self, peers: impl IntoIterator<Item = &'a PeerId>, event: &RoomEvent) -> usize {
        let mut sent = 0;
        let mut gone = Vec::new();

        for peer_id in peers {
            let Some(sender) = self.senders.get(peer_id) else {
                continue;
            };
            match sender.try_send(event.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(peer_id = %peer_id, capacity = self.capacity, "Event queue full, dropping slow peer");
                    gone.push(peer_id.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(peer_id = %peer_id, "Event queue closed, dropping sender");
                    gone.push(peer_id.clone());
                }
            }
        }

        for peer_id in gone {
            self.senders.remove(&peer_id);
        }

        debug!(event_type = event.event_type(), sent, "Room event delivered");
        sent
    }

    /// Push `event` to one peer
    pub fn send_to(&self, peer_id: &PeerId, event: &RoomEvent) -> bool {
        self.deliver(std::iter::once(peer_id), event) == 1
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_frame_shape() {
        let event = RoomEvent::NewProducer {
            room_id: RoomId::from("r1"),
            kind: MediaKind::Video,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({ "event": "newProducer", "data": { "roomId": "r1", "kind": "video" } })
        );
        assert_eq!(
            serde_json::to_value(RoomEvent::ViewerCount { count: 2 }).unwrap(),
            serde_json::json!({ "event": "viewerCount", "data": { "count": 2 } })
        );
    }

    #[tokio::test]
    async fn test_deliver_only_to_listed_peers() {
        let notifier = RoomNotifier::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let mut rx_a = notifier.register(a.clone());
        let mut rx_b = notifier.register(b.clone());

        let sent = notifier.deliver([&a], &RoomEvent::ViewerCount { count: 1 });
        assert_eq!(sent, 1);
        assert_eq!(rx_a.recv().await, Some(RoomEvent::ViewerCount { count: 1 }));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_is_pruned() {
        let notifier = RoomNotifier::new();
        let a = PeerId::from("a");
        drop(notifier.register(a.clone()));

        assert_eq!(notifier.deliver([&a], &RoomEvent::ViewerCount { count: 0 }), 0);
        assert_eq!(notifier.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_peer_is_dropped_when_queue_fills() {
        let notifier = RoomNotifier::with_capacity(2);
        let slow = PeerId::from("slow");
        let fast = PeerId::from("fast");
        let mut rx_slow = notifier.register(slow.clone());
        let mut rx_fast = notifier.register(fast.clone());

        for count in 0..2 {
            assert_eq!(notifier.deliver([&slow, &fast], &RoomEvent::ViewerCount { count }), 2);
            assert_eq!(rx_fast.recv().await, Some(RoomEvent::ViewerCount { count }));
        }

        // The third event overflows the slow peer's queue
        assert_eq!(notifier.deliver([&slow, &fast], &RoomEvent::ViewerCount { count: 2 }), 1);
        assert_eq!(notifier.connection_count(), 1);
        assert!(!notifier.send_to(&slow, &RoomEvent::ViewerCount { count: 3 }));

        // Queued events are still readable, then the queue ends
        assert_eq!(rx_slow.recv().await, Some(RoomEvent::ViewerCount { count: 0 }));
        assert_eq!(rx_slow.recv().await, Some(RoomEvent::ViewerCount { count: 1 }));
        assert_eq!(rx_slow.recv().await, None);
        assert_eq!(rx_fast.recv().await, Some(RoomEvent::ViewerCount { count: 2 }));
    }
}
