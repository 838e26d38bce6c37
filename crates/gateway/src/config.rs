//! Server configuration.
//!
//! Loaded from a TOML file; every field has a default so a missing file
//! still yields a runnable (if upstream-less) server. The legacy positional
//! invocation builds the same config with a degenerate pool of one.

use crate::error::Result;
use ctp::{ConnectionConfig, LoadBalanceStrategy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    #[serde(default = "default_cache_host")]
    pub cache_host: String,

    #[serde(default = "default_cache_port")]
    pub cache_port: u16,

    #[serde(default)]
    pub load_balance_strategy: LoadBalanceStrategy,

    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Upper bound on how long startup waits for the first upstream login.
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,

    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

fn default_websocket_port() -> u16 {
    8765
}

fn default_cache_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cache_port() -> u16 {
    6379
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("/dev/shm/mdcatalog")
}

fn default_login_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            websocket_port: default_websocket_port(),
            cache_host: default_cache_host(),
            cache_port: default_cache_port(),
            load_balance_strategy: LoadBalanceStrategy::default(),
            catalog_path: default_catalog_path(),
            login_timeout_secs: default_login_timeout_secs(),
            connections: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: ServerConfig = toml::from_str(&contents)?;
                info!(
                    "Loaded config from {:?} ({} connections)",
                    path,
                    config.connections.len()
                );
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {:?} not found, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Legacy single-connection invocation: same shape, a pool of one.
    pub fn single(front_addr: &str, broker_id: &str, websocket_port: u16) -> Self {
        Self {
            websocket_port,
            connections: vec![ConnectionConfig {
                connection_id: "single_ctp".to_string(),
                front_addr: front_addr.to_string(),
                broker_id: broker_id.to_string(),
                user_id: String::new(),
                password: String::new(),
                enabled: true,
                flow_dir: PathBuf::from("ctpflow/single"),
            }],
            ..Self::default()
        }
    }
}
