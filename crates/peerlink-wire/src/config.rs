//! Network configuration loaded from TOML, with defaults.

use crate::message::MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Settings for a [`Network`](crate::Network).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address, `<scheme>://<host>:<port>`.
    pub listen_addr: String,
    /// Ceiling on a serialized envelope, enforced on send and receive.
    pub max_message_size: usize,
    /// Deadline for opening a stream and writing one message.
    pub write_timeout_secs: u64,
    /// Optional hex Ed25519 seed for a stable node identity.
    pub identity_seed: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "tcp://127.0.0.1:0".to_string(),
            max_message_size: MAX_MESSAGE_SIZE,
            write_timeout_secs: 10,
            identity_seed: None,
        }
    }
}

impl NetworkConfig {
    /// Defaults with the given listen address.
    pub fn with_listen_addr(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Load network configuration from a TOML file.
///
/// A missing, unreadable, or malformed file falls back to defaults.
pub fn load_config(path: &Path) -> NetworkConfig {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return NetworkConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<NetworkConfig>(&contents) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "Failed to parse config, using defaults"
                );
                NetworkConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "Failed to read config file, using defaults"
            );
            NetworkConfig::default()
        }
    }
}
