//! Netron configuration, loadable from a TOML file with defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default response timeout: three minutes.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 3 * 60_000;

/// Configuration of a netron instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetronConfig {
    /// This netron's unique peer id.
    pub peer_id: String,
    /// How long a request waits for its response, in milliseconds.
    pub response_timeout_ms: u64,
    /// Whether remote peers may proxify their contexts into this netron.
    pub proxify_contexts: bool,
}

impl Default for NetronConfig {
    fn default() -> Self {
        Self {
            peer_id: uuid::Uuid::new_v4().to_string(),
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            proxify_contexts: false,
        }
    }
}

impl NetronConfig {
    /// Create a default config with an explicit peer id.
    pub fn with_peer_id(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            ..Default::default()
        }
    }

    /// Response timeout as a `Duration`.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Load configuration from a TOML file.
    ///
    /// Missing, unreadable or malformed files fall back to defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "netron: config file not found, using defaults");
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<NetronConfig>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "netron: loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %path.display(),
                        "netron: failed to parse config, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "netron: failed to read config file, using defaults"
                );
                Self::default()
            }
        }
    }
}
