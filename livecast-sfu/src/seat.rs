//! Exclusive broadcaster seats
//!
//! A seat is a per-room lock held by one broadcaster session with a sliding
//! expiry. Acquisition is a compare-and-swap on the room's entry. Each grant
//! gets a fresh generation so a connection whose grant lapsed (or was taken
//! over by a newer connection of the same session) cannot keep producing.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use livecast_core::models::RoomId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{SfuError, SfuResult};

#[derive(Debug, Clone)]
struct Seat {
    session: String,
    generation: u64,
    expires_at: Instant,
}

impl Seat {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Proof that a connection was granted a room's seat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatLease {
    pub room_id: RoomId,
    pub session: String,
    pub generation: u64,
}

pub struct SeatRegistry {
    seats: DashMap<RoomId, Seat>,
    ttl: Duration,
    generation: AtomicU64,
}

impl SeatRegistry {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            seats: DashMap::new(),
            ttl,
            generation: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    fn grant(&self, room_id: &RoomId, session: &str, now: Instant) -> (Seat, SeatLease) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let seat = Seat {
            session: session.to_string(),
            generation,
            expires_at: now + self.ttl,
        };
        let lease = SeatLease {
            room_id: room_id.clone(),
            session: session.to_string(),
            generation,
        };
        (seat, lease)
    }

    /// Take the seat for `session`
    ///
    /// Fails with `SeatBusy` while another session holds an unexpired seat. The
    /// same session acquiring again gets a new generation, which invalidates
    /// the lease of its older connection.
    pub fn acquire(&self, room_id: &RoomId, session: &str) -> SfuResult<SeatLease> {
        let now = Instant::now();
        match self.seats.entry(room_id.clone()) {
            Entry::Occupied(mut entry) => {
                let seat = entry.get();
                if !seat.is_expired(now) && seat.session != session {
                    debug!(room_id = %room_id, "Seat busy");
                    return Err(SfuError::SeatBusy);
                }
                let (seat, lease) = self.grant(room_id, session, now);
                entry.insert(seat);
                info!(room_id = %room_id, generation = lease.generation, "Seat taken over");
                Ok(lease)
            }
            Entry::Vacant(entry) => {
                let (seat, lease) = self.grant(room_id, session, now);
                entry.insert(seat);
                info!(room_id = %room_id, generation = lease.generation, "Seat acquired");
                Ok(lease)
            }
        }
    }

    /// Extend the lease by the TTL if it is still the current grant
    pub fn refresh(&self, lease: &SeatLease) -> SfuResult<()> {
        let now = Instant::now();
        let Some(mut seat) = self.seats.get_mut(&lease.room_id) else {
            return Err(expired());
        };

        if seat.is_expired(now) {
            return Err(expired());
        }
        if seat.session != lease.session {
            return Err(SfuError::SeatBusy);
        }
        if seat.generation != lease.generation {
            return Err(expired());
        }
        seat.expires_at = now + self.ttl;
        Ok(())
    }

    /// Give the seat back; only the current grant can release it
    pub fn release(&self, lease: &SeatLease) -> bool {
        let released = self
            .seats
            .remove_if(&lease.room_id, |_, seat| {
                seat.session == lease.session && seat.generation == lease.generation
            })
            .is_some();
        if released {
            info!(room_id = %lease.room_id, generation = lease.generation, "Seat released");
        }
        released
    }

    /// Session holding an unexpired seat in the room
    #[must_use]
    pub fn holder(&self, room_id: &RoomId) -> Option<String> {
        let now = Instant::now();
        self.seats
            .get(room_id)
            .filter(|seat| !seat.is_expired(now))
            .map(|seat| seat.session.clone())
    }

    pub fn clear_room(&self, room_id: &RoomId) {
        self.seats.remove(room_id);
    }
}

fn expired() -> SfuError {
    SfuError::NotAuthorized("broadcast session expired".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::from("room-1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_swap() {
        let seats = SeatRegistry::new(Duration::from_secs(30));
        let a = seats.acquire(&room(), "session-a").unwrap();
        assert!(matches!(
            seats.acquire(&room(), "session-b"),
            Err(SfuError::SeatBusy)
        ));
        assert!(seats.refresh(&a).is_ok());
        assert_eq!(seats.holder(&room()).as_deref(), Some("session-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary() {
        let seats = SeatRegistry::new(Duration::from_secs(30));
        let a = seats.acquire(&room(), "session-a").unwrap();

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert!(matches!(
            seats.acquire(&room(), "session-b"),
            Err(SfuError::SeatBusy)
        ));

        tokio::time::advance(Duration::from_millis(1)).await;
        let b = seats.acquire(&room(), "session-b").unwrap();
        assert_eq!(seats.holder(&room()).as_deref(), Some("session-b"));

        // A's stale lease now loses to B
        assert!(matches!(seats.refresh(&a), Err(SfuError::SeatBusy)));
        assert!(!seats.release(&a));
        assert!(seats.refresh(&b).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_slides_expiry() {
        let seats = SeatRegistry::new(Duration::from_secs(30));
        let a = seats.acquire(&room(), "session-a").unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(20)).await;
            seats.refresh(&a).unwrap();
        }
        assert!(seats.acquire(&room(), "session-b").is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(seats.refresh(&a), Err(SfuError::NotAuthorized(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_stays_rejected_after_same_session_reacquires() {
        let seats = SeatRegistry::new(Duration::from_secs(10));
        let old = seats.acquire(&room(), "session-a").unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let new = seats.acquire(&room(), "session-a").unwrap();
        assert_ne!(old.generation, new.generation);
        assert!(matches!(seats.refresh(&old), Err(SfuError::NotAuthorized(_))));
        assert!(seats.refresh(&new).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_immediate() {
        let seats = SeatRegistry::new(Duration::from_secs(30));
        let a = seats.acquire(&room(), "session-a").unwrap();
        assert!(seats.release(&a));
        assert!(!seats.release(&a));
        assert!(seats.holder(&room()).is_none());
        assert!(seats.acquire(&room(), "session-b").is_ok());
    }
}
