pub mod id;
pub mod live;
pub mod media;

pub use id::{generate_id, PeerId, RoomId};
pub use live::{slugify, CreateLive, Live, RoomRef};
pub use media::{AudioPolicy, MediaKind, Role};
