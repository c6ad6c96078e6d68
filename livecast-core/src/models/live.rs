use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::RoomId;

/// Maximum number of title characters kept in a generated slug
const SLUG_TITLE_MAX: usize = 40;

/// Live (room) descriptor as kept by the live metadata store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Live {
    pub id: RoomId,
    pub title: String,
    pub slug: String,
    /// Subject allowed to broadcast; `None` lets any valid credential broadcast
    pub owner: Option<String>,
    pub active: bool,
    /// Whether only one broadcaster session may hold the seat at a time
    pub exclusive_seat: bool,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Live {
    /// Whether `subject` may act as broadcaster for this live
    #[must_use]
    pub fn is_owned_by(&self, subject: &str) -> bool {
        self.owner.as_deref().map_or(true, |owner| owner == subject)
    }
}

/// Request to create a live
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLive {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub exclusive_seat: Option<bool>,
}

/// How a connection refers to its room
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRef {
    Id(RoomId),
    Slug(String),
}

impl std::fmt::Display for RoomRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::Slug(slug) => write!(f, "slug:{slug}"),
        }
    }
}

/// Turn a title into the human-readable part of a slug
///
/// Keeps lowercase ASCII alphanumerics, collapses everything else into single
/// dashes and trims them from both ends.
#[must_use]
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= SLUG_TITLE_MAX {
            break;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
