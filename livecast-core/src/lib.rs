pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod models;
pub mod store;

pub use config::Config;
pub use credentials::{CredentialVerifier, Identity, JwtVerifier};
pub use error::{Error, Result};
pub use store::{LiveStore, MemoryLiveStore};
