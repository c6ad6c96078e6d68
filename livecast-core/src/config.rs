use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::models::{AudioPolicy, MediaKind};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    pub seat: SeatConfig,
    pub lives: LivesConfig,
    pub engine: EngineConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Largest accepted signaling frame
    pub max_message_bytes: usize,
    /// Per-connection outbound queue (replies and pushed events)
    pub outbound_buffer: usize,
    /// Allow any origin on the REST and signaling endpoints
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3000,
            max_message_bytes: 64 * 1024,
            outbound_buffer: 256,
            cors_permissive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 shared secret used to verify (and mint) identity tokens
    pub jwt_secret: String,
    pub token_ttl_seconds: u64,
    /// Expected `iss` claim; not checked when unset
    pub issuer: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_seconds: 3600,
            issuer: None,
        }
    }
}

/// Broadcaster seat (session lock) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeatConfig {
    /// Exclusivity for lives that do not say otherwise
    pub exclusive_by_default: bool,
    /// Sliding expiry of an idle seat
    pub ttl_seconds: u64,
}

impl Default for SeatConfig {
    fn default() -> Self {
        Self {
            exclusive_by_default: true,
            ttl_seconds: 30,
        }
    }
}

impl SeatConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LivesConfig {
    /// Create a live on first connection to an unknown slug
    pub auto_create: bool,
}

/// Codec the media engine router accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Public address advertised in ICE candidates
    pub announced_ip: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub codecs: Vec<CodecConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            announced_ip: "127.0.0.1".to_string(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            codecs: vec![
                CodecConfig {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                },
                CodecConfig {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Audio handling when the broadcaster switches video source
    pub audio_on_video_switch: AudioPolicy,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            } else {
                return Err(ConfigError::NotFound(path.to_string()));
            }
        }

        // LIVECAST_SERVER__HTTP_PORT=9000 etc.
        builder = builder.add_source(
            Environment::with_prefix("LIVECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.auth.jwt_secret.trim().is_empty() {
            errors.push("auth.jwt_secret must be set".to_string());
        }
        if self.engine.rtc_min_port > self.engine.rtc_max_port {
            errors.push(format!(
                "engine.rtc_min_port ({}) is greater than engine.rtc_max_port ({})",
                self.engine.rtc_min_port, self.engine.rtc_max_port
            ));
        }
        if self.engine.codecs.is_empty() {
            errors.push("engine.codecs must list at least one codec".to_string());
        }
        if self.seat.ttl_seconds == 0 {
            errors.push("seat.ttl_seconds must be greater than zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if self.server.outbound_buffer == 0 {
            errors.push("server.outbound_buffer must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.auth.jwt_secret = "secret".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.http_address(), "0.0.0.0:3000");
        assert_eq!(config.engine.codecs.len(), 2);
        assert_eq!(config.seat.ttl(), Duration::from_secs(30));
        assert_eq!(
            config.signaling.audio_on_video_switch,
            AudioPolicy::KeepExisting
        );
    }

    #[test]
    fn test_validate_accepts_sane_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = Config::default();
        config.engine.rtc_min_port = 50000;
        config.engine.rtc_max_port = 40000;
        config.seat.ttl_seconds = 0;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("jwt_secret")));
        assert!(errors.iter().any(|e| e.contains("rtc_min_port")));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load(Some("/nonexistent/livecast.yaml")).is_err());
    }

    #[test]
    fn test_deserialize_partial_yaml_like_value() {
        let value = serde_json::json!({
            "server": { "http_port": 9000 },
            "signaling": { "audio_on_video_switch": "drop" }
        });
        let config: Config = serde_json::from_value(value).unwrap();
        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.signaling.audio_on_video_switch, AudioPolicy::Drop);
    }
}
