//! Server configuration.
//!
//! Every field has a default, so an empty TOML document or `{}` JSON object
//! is a valid configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind. Loopback unless the host opts out.
    pub host: IpAddr,
    /// How long a deferred request may wait for completion before a 504.
    pub pending_timeout_ms: u64,
    /// Period of the sweep that expires overdue deferred requests.
    pub sweep_interval_ms: u64,
    /// Idle time after which a keep-alive connection is closed.
    pub idle_timeout_ms: u64,
    /// How long `stop` waits for connection tasks before aborting them.
    pub shutdown_grace_ms: u64,
    /// Upper bound for a request head and for a decoded body.
    pub max_request_bytes: usize,
    pub keep_alive: bool,
    /// Answer 405 with `Allow` instead of 404 when only the method differs.
    pub method_not_allowed: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            pending_timeout_ms: 30_000,
            sweep_interval_ms: 250,
            idle_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
            max_request_bytes: 1024 * 1024,
            keep_alive: true,
            method_not_allowed: false,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(content: &str) -> ServerResult<Self> {
        let config: ServerConfig =
            toml::from_str(content).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject values that would stall the sweep or refuse every request.
    pub fn validate(&self) -> ServerResult<()> {
        if self.pending_timeout_ms == 0 {
            return Err(ServerError::Config("pending_timeout_ms must be > 0".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ServerError::Config("sweep_interval_ms must be > 0".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ServerError::Config("idle_timeout_ms must be > 0".into()));
        }
        if self.max_request_bytes == 0 {
            return Err(ServerError::Config("max_request_bytes must be > 0".into()));
        }
        Ok(())
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
