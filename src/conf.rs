//! Process configuration.
//!
//! Loadable from a TOML file; every field has a working default so an
//! empty file (or none at all) yields a runnable configuration.
//!
//! ```toml
//! stack_buf_len = 4096
//!
//! [cluster]
//! listen_addr = "0.0.0.0:3563"
//! connect_addrs = ["10.0.0.2:3563"]
//! pending_write_num = 200
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::chanrpc::DEFAULT_STACK_BUF_LEN;
use crate::error::{Error, Result};

/// Cluster-side server/client defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address to listen on for cluster peers; `None` disables the server.
    pub listen_addr: Option<String>,
    /// Peer addresses to keep connected to.
    pub connect_addrs: Vec<String>,
    /// Outbound queue length per cluster connection (0 = default 100).
    pub pending_write_num: usize,
}

impl ClusterConfig {
    /// True when neither a listener nor peers are configured.
    pub fn is_empty(&self) -> bool {
        self.listen_addr.is_none() && self.connect_addrs.is_empty()
    }
}

/// Top-level process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bound for panic stack snapshots (0 disables).
    pub stack_buf_len: usize,
    /// Cluster wiring.
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_buf_len: DEFAULT_STACK_BUF_LEN,
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}
