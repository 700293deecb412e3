//! Configuration types for the consultation session core

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the consult service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsultConfig {
    /// Signaling server settings
    pub server: ServerConfig,

    /// Session lifecycle timers and buffers
    pub session: SessionConfig,

    /// Connection quality sampling
    pub quality: QualityConfig,

    /// Recording storage
    pub recording: RecordingConfig,

    /// Persistence backend
    pub store: StoreConfig,

    /// ICE servers handed to native peer transports
    pub ice: IceConfig,
}

/// WebSocket signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0:8080)
    pub bind_address: String,

    /// Outbound frame queue per connection (default: 128)
    pub channel_capacity: usize,
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reconnection grace after a participant leaves, in milliseconds (default: 20000)
    pub grace_period_ms: u64,

    /// Auto-end after this long without signaling traffic, in milliseconds (default: 300000)
    pub idle_timeout_ms: u64,

    /// Chat messages retained per session for replay (default: 256)
    pub chat_history_limit: usize,

    /// Command inbox depth of each session actor (default: 64)
    pub inbox_capacity: usize,
}

/// Connection quality monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Sampling interval in milliseconds (default: 2000)
    pub sample_interval_ms: u64,

    /// Loss rate at which quality drops to `fair` (default: 0.02)
    pub fair_loss_threshold: f64,

    /// Loss rate at which quality drops to `poor` (default: 0.08)
    pub poor_loss_threshold: f64,
}

/// Recording pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory receiving finalized recordings (default: ./recordings)
    pub directory: PathBuf,
}

/// Persistence backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process maps, lost on restart
    Memory,
    /// SQLite database file
    Sqlite,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend (default: memory)
    pub backend: StoreBackend,

    /// Database path for the sqlite backend
    pub path: Option<PathBuf>,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            channel_capacity: 128,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 20_000,
            idle_timeout_ms: 300_000,
            chat_history_limit: 256,
            inbox_capacity: 64,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
            fair_loss_threshold: 0.02,
            poor_loss_threshold: 0.08,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./recordings"),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl QualityConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl ConsultConfig {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        toml::from_str(text)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - any timer or buffer size is zero
    /// - loss thresholds are not ordered `0 <= fair < poor <= 1`
    /// - the sqlite backend is selected without a path
    /// - `bind_address` is not a socket address
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.session.grace_period_ms == 0 {
            return Err(Error::InvalidConfig(
                "session.grace_period_ms must be greater than 0".to_string(),
            ));
        }

        if self.session.idle_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "session.idle_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.session.chat_history_limit == 0 {
            return Err(Error::InvalidConfig(
                "session.chat_history_limit must be greater than 0".to_string(),
            ));
        }

        if self.session.inbox_capacity == 0 || self.server.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue capacities must be greater than 0".to_string(),
            ));
        }

        if self.quality.sample_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "quality.sample_interval_ms must be greater than 0".to_string(),
            ));
        }

        let fair = self.quality.fair_loss_threshold;
        let poor = self.quality.poor_loss_threshold;
        if !(0.0..=1.0).contains(&fair) || !(0.0..=1.0).contains(&poor) || fair >= poor {
            return Err(Error::InvalidConfig(format!(
                "loss thresholds must satisfy 0 <= fair < poor <= 1, got fair={} poor={}",
                fair, poor
            )));
        }

        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_none() {
            return Err(Error::InvalidConfig(
                "store.path is required for the sqlite backend".to_string(),
            ));
        }

        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "server.bind_address must be a socket address, got {}",
                self.server.bind_address
            )));
        }

        Ok(())
    }

    /// Configuration preset with short timers, for demos and local testing
    ///
    /// # Example
    ///
    /// ```
    /// use telehealth_consult::config::ConsultConfig;
    ///
    /// let config = ConsultConfig::short_timers_preset();
    /// assert_eq!(config.session.grace_period_ms, 2000);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn short_timers_preset() -> Self {
        Self {
            session: SessionConfig {
                grace_period_ms: 2000,
                idle_timeout_ms: 30_000,
                ..Default::default()
            },
            quality: QualityConfig {
                sample_interval_ms: 500,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn with_bind_address(mut self, addr: &str) -> Self {
        self.server.bind_address = addr.to_string();
        self
    }

    /// Set the recordings directory
    pub fn with_recording_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recording.directory = dir.into();
        self
    }
}
