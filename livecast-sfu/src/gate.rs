//! Session/authorization gate
//!
//! Decides at connect time who a peer is and whether it may broadcast, and
//! re-checks the broadcaster's seat on every produce-capable action.

use livecast_core::models::{slugify, CreateLive, Live, PeerId, Role, RoomRef};
use livecast_core::{CredentialVerifier, Identity, LiveStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{SfuError, SfuResult};
use crate::seat::{SeatLease, SeatRegistry};

/// What a connecting peer presents
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub role: Role,
    pub token: Option<String>,
    pub room: Option<RoomRef>,
}

/// Outcome of a successful handshake
#[derive(Debug, Clone)]
pub struct Admission {
    pub peer_id: PeerId,
    pub role: Role,
    /// Room named in the handshake
    pub room: Option<Live>,
    pub identity: Option<Identity>,
    /// Whether this connection may produce into `room`
    pub is_host: bool,
    /// Seat grant for exclusive lives
    pub lease: Option<SeatLease>,
}

pub struct AuthorizationGate {
    verifier: Arc<dyn CredentialVerifier>,
    store: Arc<dyn LiveStore>,
    seats: SeatRegistry,
    auto_create: bool,
}

impl AuthorizationGate {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        store: Arc<dyn LiveStore>,
        seats: SeatRegistry,
        auto_create: bool,
    ) -> Self {
        Self {
            verifier,
            store,
            seats,
            auto_create,
        }
    }

    #[must_use]
    pub const fn seats(&self) -> &SeatRegistry {
        &self.seats
    }

    pub fn verify(&self, token: &str) -> SfuResult<Identity> {
        self.verifier
            .verify(token)
            .map_err(|e| SfuError::NotAuthorized(e.to_string()))
    }

    /// Resolve a room reference to an active live
    ///
    /// Ids fall back to slug lookup. An unknown slug is created on the fly when
    /// auto-creation is enabled.
    pub async fn resolve(&self, room: &RoomRef) -> SfuResult<Live> {
        let live = match room {
            RoomRef::Id(id) => match self.store.get(id).await? {
                Some(live) => Some(live),
                None => self.store.find_by_slug(&slugify(id.as_str())).await?,
            },
            RoomRef::Slug(raw) => {
                let slug = slugify(raw);
                if slug.is_empty() {
                    None
                } else {
                    match self.store.find_by_slug(&slug).await? {
                        Some(live) => Some(live),
                        None if self.auto_create => Some(self.create_for_slug(&slug).await?),
                        None => None,
                    }
                }
            }
        };

        match live {
            Some(live) if live.active => Ok(live),
            _ => Err(SfuError::RoomNotFound(room.to_string())),
        }
    }

    async fn create_for_slug(&self, slug: &str) -> SfuResult<Live> {
        let request = CreateLive {
            title: Some(slug.to_string()),
            slug: Some(slug.to_string()),
            exclusive_seat: None,
        };
        match self.store.create(None, request).await {
            Ok(live) => {
                info!(live_id = %live.id, slug = %slug, "Live auto-created");
                Ok(live)
            }
            // Lost a race with another connection creating the same slug
            Err(livecast_core::Error::AlreadyExists(_)) => self
                .store
                .find_by_slug(slug)
                .await?
                .ok_or_else(|| SfuError::RoomNotFound(slug.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Validate a connecting peer
    pub async fn admit(&self, handshake: Handshake) -> SfuResult<Admission> {
        let peer_id = PeerId::new();
        let room = match &handshake.room {
            Some(room) => Some(self.resolve(room).await?),
            None => None,
        };
        let token = handshake.token.as_deref().filter(|t| !t.trim().is_empty());

        if handshake.role == Role::Viewer {
            // Viewers need no credential; a bad one is ignored
            let identity = token.and_then(|t| self.verifier.verify(t).ok());
            return Ok(Admission {
                peer_id,
                role: Role::Viewer,
                room,
                identity,
                is_host: false,
                lease: None,
            });
        }

        let token = token.ok_or_else(|| SfuError::NotAuthorized("missing token".to_string()))?;
        let identity = self.verify(token)?;
        let live = room
            .as_ref()
            .ok_or_else(|| SfuError::RoomNotFound("broadcaster must name a room".to_string()))?;

        if !live.is_owned_by(&identity.subject) {
            warn!(live_id = %live.id, subject = %identity.subject, "Broadcaster is not the live owner");
            return Err(SfuError::NotAuthorized(
                "not the owner of this live".to_string(),
            ));
        }

        let lease = if live.exclusive_seat {
            Some(self.seats.acquire(&live.id, &identity.session)?)
        } else {
            None
        };

        debug!(peer_id = %peer_id, live_id = %live.id, subject = %identity.subject, "Broadcaster admitted");
        Ok(Admission {
            peer_id,
            role: Role::Broadcaster,
            room,
            identity: Some(identity),
            is_host: true,
            lease,
        })
    }

    /// Check that the connection may still act as broadcaster, sliding its seat
    pub fn authorize_action(&self, admission: &Admission) -> SfuResult<()> {
        if !admission.is_host {
            return Err(SfuError::NotAuthorized(
                "only the room's broadcaster may produce".to_string(),
            ));
        }
        match &admission.lease {
            Some(lease) => self.seats.refresh(lease),
            None => Ok(()),
        }
    }

    /// Give back whatever the connection holds
    pub fn release(&self, admission: &Admission) {
        if let Some(lease) = &admission.lease {
            self.seats.release(lease);
        }
    }
}
