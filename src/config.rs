// Node configuration

use crate::core::Address;
use crate::network::ForkChoice;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings of one node, loaded from a JSON file. Missing fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Holds the chain database and the keystore
    pub data_dir: PathBuf,
    pub listen: SocketAddr,
    /// Nodes dialed at startup
    pub peers: Vec<SocketAddr>,
    pub request_timeout_ms: u64,
    pub sync_interval_secs: u64,
    pub fork_choice: ForkChoice,
    /// Coinbase recipient; mining is off without one
    pub miner_address: Option<Address>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            listen: SocketAddr::from(([127, 0, 0, 1], 8333)),
            peers: Vec::new(),
            request_timeout_ms: 5_000,
            sync_interval_secs: 60,
            fork_choice: ForkChoice::Length,
            miner_address: None,
        }
    }
}

impl NodeConfig {
    /// Read `path`, falling back to the defaults if it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn chain_path(&self) -> PathBuf {
        self.data_dir.join("chain")
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.data_dir.join("keystore.json")
    }
}
