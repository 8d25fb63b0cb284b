//! Configuration management for the relay
//!
//! Values are layered: built-in defaults, then an optional config file
//! (YAML, TOML or JSON by extension), then `CALC_RELAY_*` environment
//! variables such as `CALC_RELAY_PROXY__BACKEND_ADDRESS`. Command-line flags
//! are applied on top by the binary.

use crate::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
}

/// Backend server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address
    pub listen_address: String,
    /// Maximum number of cached results
    pub cache_capacity: usize,
    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,
}

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// TCP listen address for clients
    pub listen_address: String,
    /// Address of the backend server
    pub backend_address: String,
    /// Maximum number of cached responses
    pub cache_capacity: usize,
    /// Deadline for each forward (and each reconnect probe)
    pub forward_timeout_ms: u64,
    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,
    /// Answer from the proxy cache before forwarding, even while the backend is up
    pub cache_first: bool,
    /// Connection attempts made at startup before starting in degraded mode
    pub connect_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:5555".to_string(),
            cache_capacity: 128,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:5554".to_string(),
            backend_address: "127.0.0.1:5555".to_string(),
            cache_capacity: 128,
            forward_timeout_ms: 5000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            cache_first: false,
            connect_retries: 3,
        }
    }
}

impl ServerConfig {
    pub fn capacity(&self) -> Result<NonZeroUsize, ConfigError> {
        nonzero_capacity("server", self.cache_capacity)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capacity()?;
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_frame_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl ProxyConfig {
    pub fn capacity(&self) -> Result<NonZeroUsize, ConfigError> {
        nonzero_capacity("proxy", self.cache_capacity)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capacity()?;
        if self.forward_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "proxy.forward_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "proxy.max_frame_bytes must be greater than zero".to_string(),
            ));
        }
        if self.backend_address.is_empty() {
            return Err(ConfigError::Invalid(
                "proxy.backend_address must be set".to_string(),
            ));
        }
        Ok(())
    }
}

impl RelayConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&RelayConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("CALC_RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: RelayConfig = builder.build()?.try_deserialize()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.proxy.validate()
    }
}

fn nonzero_capacity(section: &str, capacity: usize) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(capacity).ok_or_else(|| {
        ConfigError::Invalid(format!("{}.cache_capacity must be greater than zero", section))
    })
}
