//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and TOML/JSON/env
//! - **derive macros**: Automatically generate Debug, Clone, Serialize, Deserialize
//! - **Option<T>**: Settings that may be intentionally absent (e.g. the reclaim grace period)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_CONVERSION__TIMEOUT_SECS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Longest reclaim grace period accepted: one week.
pub const MAX_RECLAIM_GRACE_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest retry backoff base accepted: one day.
pub const MAX_BACKOFF_BASE_SECS: u64 = 24 * 60 * 60;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each component (auth, session coordinator, listener fan-out, conversion
/// pipeline, blob storage) only receives the section it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub broadcast: BroadcastConfig,
    pub listeners: ListenerConfig,
    pub presenter: PresenterConfig,
    pub conversion: ConversionConfig,
    pub storage: StorageConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Token verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 shared secret
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    /// Clock skew tolerated when checking `exp`
    pub leeway_secs: u64,
}

/// On-air slot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Public URL listeners play while the station is live
    pub stream_url: String,
    /// Where the durable session record lives
    pub session_store_path: PathBuf,
    /// How long a session paused by a dropped connection stays reserved for
    /// its owner. `None` keeps it reserved until an explicit stop or an
    /// emergency override.
    pub reclaim_grace_secs: Option<u64>,
}

/// Listener event-stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub heartbeat_interval_secs: u64,
    /// Events buffered per listener before it is considered too slow and dropped
    pub channel_buffer: usize,
}

/// Presenter WebSocket liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenterConfig {
    pub ping_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Background transcoding settings.
///
/// ## Output profile:
/// Mono, 22.05kHz, 64kbit/s MP3 by default. That is plenty for spoken word
/// and keeps files small for listeners on mobile data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Hard limit for one transcoder invocation; a hung process is killed
    pub timeout_secs: u64,
    pub sample_rate: u32,
    pub channels: u8,
    pub bitrate: String,
    /// Retry n waits `backoff_base_secs * 2^n` (2, 4, 8 minutes by default)
    pub backoff_base_secs: u64,
    pub scratch_dir: PathBuf,
    pub job_store_path: PathBuf,
}

/// Filesystem blob store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
    pub public_base_url: String,
    pub signing_secret: String,
    pub signed_url_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            auth: AuthConfig {
                jwt_secret: "change-me".to_string(),
                issuer: "onair-auth".to_string(),
                audience: "onair".to_string(),
                leeway_secs: 30,
            },
            broadcast: BroadcastConfig {
                stream_url: "http://127.0.0.1:8000/live".to_string(),
                session_store_path: PathBuf::from("data/session.json"),
                reclaim_grace_secs: None,
            },
            listeners: ListenerConfig {
                heartbeat_interval_secs: 15,
                channel_buffer: 32,
            },
            presenter: PresenterConfig {
                ping_interval_secs: 10,
                client_timeout_secs: 30,
            },
            conversion: ConversionConfig {
                ffmpeg_path: "ffmpeg".to_string(),
                ffprobe_path: "ffprobe".to_string(),
                timeout_secs: 600,
                sample_rate: 22_050,
                channels: 1,
                bitrate: "64k".to_string(),
                backoff_base_secs: 60,
                scratch_dir: env::temp_dir().join("onair-conversions"),
                job_store_path: PathBuf::from("data/conversion_jobs.json"),
            },
            storage: StorageConfig {
                root_dir: PathBuf::from("data/blobs"),
                public_base_url: "http://127.0.0.1:8080/blobs".to_string(),
                signing_secret: "change-me-too".to_string(),
                signed_url_ttl_secs: 3600,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_AUTH__JWT_SECRET=...`: Set the token secret
    /// - `APP_BROADCAST__RECLAIM_GRACE_SECS=900`: Allow reclaiming after 15 minutes
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    ///
    /// Nested keys use a double underscore because most field names contain
    /// single underscores themselves.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## Why validate:
    /// A zero heartbeat interval would spin, a zero timeout would fail every
    /// conversion, and an empty secret would accept forged tokens. Catch all of
    /// that at startup rather than in production traffic.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.auth.jwt_secret.trim().is_empty() {
            return Err(anyhow::anyhow!("JWT secret must not be empty"));
        }

        if self.listeners.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Listener heartbeat interval must be greater than 0"));
        }

        if self.listeners.channel_buffer == 0 {
            return Err(anyhow::anyhow!("Listener channel buffer must be greater than 0"));
        }

        if self.presenter.ping_interval_secs == 0
            || self.presenter.client_timeout_secs <= self.presenter.ping_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Presenter client timeout must exceed a non-zero ping interval"
            ));
        }

        if let Some(grace) = self.broadcast.reclaim_grace_secs {
            if grace > MAX_RECLAIM_GRACE_SECS {
                return Err(anyhow::anyhow!(
                    "Reclaim grace period cannot exceed {} seconds",
                    MAX_RECLAIM_GRACE_SECS
                ));
            }
        }

        if self.conversion.backoff_base_secs > MAX_BACKOFF_BASE_SECS {
            return Err(anyhow::anyhow!(
                "Conversion backoff base cannot exceed {} seconds",
                MAX_BACKOFF_BASE_SECS
            ));
        }

        if self.conversion.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Transcoder timeout must be greater than 0"));
        }

        if self.conversion.channels == 0 || self.conversion.sample_rate == 0 {
            return Err(anyhow::anyhow!("Conversion output channels and sample rate must be non-zero"));
        }

        if self.storage.signing_secret.trim().is_empty() {
            return Err(anyhow::anyhow!("Blob signing secret must not be empty"));
        }

        Ok(())
    }

    /// Copy suitable for showing over HTTP: secrets replaced.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        copy.auth.jwt_secret = "***".to_string();
        copy.storage.signing_secret = "***".to_string();
        copy
    }
}

impl BroadcastConfig {
    /// The grace period as a signed duration. Values that do not fit are an
    /// error rather than wrapping to a negative period.
    pub fn reclaim_grace(&self) -> Result<Option<chrono::Duration>> {
        self.reclaim_grace_secs
            .map(|secs| {
                i64::try_from(secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .with_context(|| format!("Reclaim grace of {} seconds is out of range", secs))
            })
            .transpose()
    }
}

impl ListenerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl PresenterConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl ConversionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.conversion.channels, 1);
        assert!(config.broadcast.reclaim_grace_secs.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.auth.jwt_secret = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.presenter.client_timeout_secs = config.presenter.ping_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.conversion.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_are_rejected() {
        let mut config = AppConfig::default();
        config.broadcast.reclaim_grace_secs = Some(u64::MAX);
        assert!(config.validate().is_err());
        assert!(config.broadcast.reclaim_grace().is_err());

        config.broadcast.reclaim_grace_secs = Some(MAX_RECLAIM_GRACE_SECS);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.broadcast.reclaim_grace().unwrap(),
            Some(chrono::Duration::days(7))
        );

        let mut config = AppConfig::default();
        config.conversion.backoff_base_secs = MAX_BACKOFF_BASE_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let config = AppConfig::default();
        let shown = config.redacted();
        assert_eq!(shown.auth.jwt_secret, "***");
        assert_eq!(shown.storage.signing_secret, "***");
        assert_eq!(shown.server.port, config.server.port);
    }

    #[test]
    fn test_backoff_base_duration() {
        let config = AppConfig::default();
        assert_eq!(config.conversion.backoff_base(), Duration::from_secs(60));
        assert_eq!(config.conversion.timeout(), Duration::from_secs(600));
    }
}
