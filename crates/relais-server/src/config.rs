//! Server configuration.

use std::net::SocketAddr;
use std::path::Path;

use relais_core::EngineConfig;
use serde::{Deserialize, Serialize};

/// Server configuration, loadable from TOML with environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Shared secret for `X-API-Key` authentication.
    #[serde(default)]
    pub api_key: Option<String>,

    /// PostgreSQL connection URL. Absent: the in-memory backend is used
    /// (events do not survive a restart).
    #[serde(default)]
    pub database_url: Option<String>,

    /// Engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8069".parse().expect("static bind address")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr:    default_bind_addr(),
            api_key:      None,
            database_url: None,
            engine:       EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply `RELAIS_BIND`, `RELAIS_API_KEY`, and `RELAIS_DATABASE_URL`
    /// environment overrides.
    pub fn apply_env(mut self) -> anyhow::Result<Self> {
        if let Ok(bind) = std::env::var("RELAIS_BIND") {
            self.bind_addr = bind.parse()?;
        }
        if let Ok(key) = std::env::var("RELAIS_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("RELAIS_DATABASE_URL") {
            self.database_url = Some(url);
        }
        Ok(self)
    }
}
