//! Configuration management for Tollgate.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::error::Result;
use crate::ratelimit::{RouteSettings, Settings};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiter options
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Interval between sweeps of expired counters, 0 disables sweeping
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8080))
}

fn default_purge_interval() -> u64 {
    30
}

/// Rate limiter options: global defaults plus per-route overrides keyed by
/// route template (for example `/users/{id}`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub defaults: Settings,

    #[serde(default)]
    pub routes: HashMap<String, RouteSettings>,
}

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}
