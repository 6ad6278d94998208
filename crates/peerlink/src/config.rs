//! Peer configuration.
//!
//! `PeerConfig` can be built in code (struct literal over
//! `PeerConfig::default()`) or loaded from a TOML file.  Fields annotated
//! with `#[serde(default = "...")]` fall back to their documented defaults
//! when absent, so a minimal (or missing) file still yields a working peer.
//!
//! ```toml
//! address = "192.168.1.20:41000"
//! timeout_secs = 2.5
//! invisible = false
//!
//! max_connections = 8
//! buffer_size = 8192
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value is out of range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Construction options for a [`crate::Peer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    /// Bind address, either `"host"` or `"host:port"` (a port given here
    /// overrides [`PeerConfig::port`]).  When absent the peer binds the
    /// local outbound-routable IP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// TCP listening port; `0` lets the OS assign one.
    #[serde(default)]
    pub port: u16,

    /// Timeout applied to every blocking socket operation, in seconds.
    /// Also bounds the shutdown latency of each loop thread.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    /// When `true`, the peer does not answer discovery pings.
    #[serde(default)]
    pub invisible: bool,

    /// Maximum number of simultaneous connections; `0` means unbounded.
    #[serde(default)]
    pub max_connections: usize,

    /// Receive chunk size in bytes for payload reads.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// UDP port shared by all peers for PING/PONG discovery.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Destination address for discovery pings.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_timeout_secs() -> f64 {
    5.0
}
fn default_buffer_size() -> usize {
    8192
}
fn default_discovery_port() -> u16 {
    peerlink_core::protocol::DISCOVERY_PORT
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: 0,
            timeout_secs: default_timeout_secs(),
            invisible: false,
            max_connections: 0,
            buffer_size: default_buffer_size(),
            discovery_port: default_discovery_port(),
            broadcast_address: default_broadcast_address(),
        }
    }
}

impl PeerConfig {
    /// Parses a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PeerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config from a TOML file, returning defaults if the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system errors other than
    /// "not found" and [`ConfigError::Parse`] if the TOML is malformed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io { path, source: e }),
        }
    }

    /// Returns the configured timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "timeout_secs must be a positive number, got {}",
                self.timeout_secs
            )));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
