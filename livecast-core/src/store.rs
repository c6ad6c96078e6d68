//! Live metadata store
//!
//! Lives are the rooms a broadcaster can go live in. The signaling layer only
//! ever asks whether a live exists and is active; creating and ending lives is
//! driven over REST.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use nanoid::nanoid;
use parking_lot::Mutex;

use crate::{
    models::{slugify, CreateLive, Live, RoomId},
    Error, Result,
};

/// Characters of the random slug suffix; slugs are lowercase so lookups can
/// normalize what a user typed
const SLUG_SUFFIX_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
    'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Source of truth for live descriptors
#[async_trait]
pub trait LiveStore: Send + Sync {
    /// Create a live owned by `owner` (`None` lets any valid credential broadcast)
    async fn create(&self, owner: Option<&str>, request: CreateLive) -> Result<Live>;

    async fn get(&self, id: &RoomId) -> Result<Option<Live>>;

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Live>>;

    async fn list_active(&self) -> Result<Vec<Live>>;

    /// Mark a live ended; it stays readable but can no longer be joined
    async fn end(&self, id: &RoomId) -> Result<Live>;
}

/// In-memory store
pub struct MemoryLiveStore {
    lives: DashMap<RoomId, Live>,
    slugs: DashMap<String, RoomId>,
    // Serializes slug reservation against concurrent creates
    create_lock: Mutex<()>,
    default_exclusive: bool,
}

impl MemoryLiveStore {
    #[must_use]
    pub fn new(default_exclusive: bool) -> Self {
        Self {
            lives: DashMap::new(),
            slugs: DashMap::new(),
            create_lock: Mutex::new(()),
            default_exclusive,
        }
    }

    fn reserve_slug(&self, requested: Option<&str>, title: &str, id: &RoomId) -> Result<String> {
        if let Some(slug) = requested {
            let slug = slugify(slug);
            if slug.is_empty() {
                return Err(Error::InvalidInput("slug must contain letters or digits".to_string()));
            }
            if self.slugs.contains_key(&slug) {
                return Err(Error::AlreadyExists(format!("slug {slug}")));
            }
            self.slugs.insert(slug.clone(), id.clone());
            return Ok(slug);
        }

        let base = match slugify(title) {
            s if s.is_empty() => "live".to_string(),
            s => s,
        };
        loop {
            let candidate = format!("{base}-{}", nanoid!(6, &SLUG_SUFFIX_ALPHABET));
            if !self.slugs.contains_key(&candidate) {
                self.slugs.insert(candidate.clone(), id.clone());
                return Ok(candidate);
            }
        }
    }
}

impl Default for MemoryLiveStore {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl LiveStore for MemoryLiveStore {
    async fn create(&self, owner: Option<&str>, request: CreateLive) -> Result<Live> {
        let title = request
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled live".to_string());

        let id = RoomId::new();
        let slug = {
            let _guard = self.create_lock.lock();
            self.reserve_slug(request.slug.as_deref(), &title, &id)?
        };

        let live = Live {
            id: id.clone(),
            title,
            slug,
            owner: owner.map(str::to_string),
            active: true,
            exclusive_seat: request.exclusive_seat.unwrap_or(self.default_exclusive),
            created_at: Utc::now(),
            ended_at: None,
        };
        self.lives.insert(id, live.clone());
        tracing::info!(live_id = %live.id, slug = %live.slug, "Live created");
        Ok(live)
    }

    async fn get(&self, id: &RoomId) -> Result<Option<Live>> {
        Ok(self.lives.get(id).map(|l| l.clone()))
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Live>> {
        let Some(id) = self.slugs.get(slug).map(|id| id.clone()) else {
            return Ok(None);
        };
        self.get(&id).await
    }

    async fn list_active(&self) -> Result<Vec<Live>> {
        let mut lives: Vec<Live> = self
            .lives
            .iter()
            .filter(|l| l.active)
            .map(|l| l.clone())
            .collect();
        lives.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(lives)
    }

    async fn end(&self, id: &RoomId) -> Result<Live> {
        let mut live = self
            .lives
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("live {id}")))?;
        if !live.active {
            return Err(Error::InvalidInput(format!("live {id} already ended")));
        }
        live.active = false;
        live.ended_at = Some(Utc::now());
        tracing::info!(live_id = %id, "Live ended");
        Ok(live.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_generates_unique_slugs() {
        let store = MemoryLiveStore::default();
        let request = CreateLive {
            title: Some("Friday Night".to_string()),
            ..CreateLive::default()
        };
        let a = store.create(Some("alice"), request.clone()).await.unwrap();
        let b = store.create(Some("alice"), request).await.unwrap();

        assert!(a.slug.starts_with("friday-night-"));
        assert_ne!(a.slug, b.slug);
        assert!(a.exclusive_seat);
        assert_eq!(
            store.find_by_slug(&a.slug).await.unwrap().unwrap().id,
            a.id
        );
    }

    #[tokio::test]
    async fn test_explicit_slug_must_be_unique() {
        let store = MemoryLiveStore::new(false);
        let request = CreateLive {
            slug: Some("Main Stage".to_string()),
            ..CreateLive::default()
        };
        let live = store.create(None, request.clone()).await.unwrap();
        assert_eq!(live.slug, "main-stage");
        assert!(!live.exclusive_seat);
        assert_eq!(live.title, "Untitled live");
        assert!(matches!(
            store.create(None, request).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_untitled_slug_falls_back() {
        let store = MemoryLiveStore::default();
        let live = store
            .create(
                None,
                CreateLive {
                    title: Some("!!!".to_string()),
                    ..CreateLive::default()
                },
            )
            .await
            .unwrap();
        assert!(live.slug.starts_with("live-"));
    }

    #[tokio::test]
    async fn test_generated_slugs_are_normalized() {
        let store = MemoryLiveStore::default();
        for _ in 0..50 {
            let live = store
                .create(
                    None,
                    CreateLive {
                        title: Some("Show".to_string()),
                        ..CreateLive::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(slugify(&live.slug), live.slug);
            assert_eq!(
                store.find_by_slug(&live.slug).await.unwrap().unwrap().id,
                live.id
            );
        }
    }

    #[tokio::test]
    async fn test_end_hides_from_active_list() {
        let store = MemoryLiveStore::default();
        let live = store.create(None, CreateLive::default()).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);

        let ended = store.end(&live.id).await.unwrap();
        assert!(!ended.active);
        assert!(ended.ended_at.is_some());
        assert!(store.list_active().await.unwrap().is_empty());
        assert!(store.get(&live.id).await.unwrap().is_some());

        assert!(matches!(
            store.end(&live.id).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.end(&RoomId::from("missing")).await,
            Err(Error::NotFound(_))
        ));
    }
}
