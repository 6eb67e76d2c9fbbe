//! Node configuration

use kadmesh_core::{Key, NodeInfo};
use kadmesh_dht::KadConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Identity of this node
    pub node: NodeConfig,

    /// DHT configuration
    pub dht: DhtConfig,

    /// Peers to contact when joining
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bootstrap: Vec<BootstrapPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id announced to peers
    pub node_id: String,
    /// Host where this node's API is reachable
    pub api_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// K parameter (nodes per bucket)
    pub k: usize,
    /// Alpha parameter (lookup parallelism)
    pub alpha: usize,
    /// Seed peers per lookup
    pub disjoint_paths: usize,
    /// Lookup timeout in seconds
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub node_id: String,
    pub api_host: String,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = KadConfig::default();
        Self {
            data_dir: "~/.kadmesh".to_string(),
            node: NodeConfig {
                node_id: random_node_id(),
                api_host: "127.0.0.1:1818".to_string(),
            },
            dht: DhtConfig {
                k: defaults.k,
                alpha: defaults.alpha,
                disjoint_paths: defaults.disjoint_paths,
                query_timeout_secs: defaults.query_timeout.as_secs(),
            },
            bootstrap: vec![],
        }
    }
}

/// Random node id, falling back to a fixed one if the OS has no entropy
fn random_node_id() -> String {
    match Key::random() {
        Ok(key) => key.to_hex(),
        Err(e) => {
            tracing::warn!("Could not generate a random node id: {}", e);
            "kadmesh-node".to_string()
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to a file, creating parent directories
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.node.node_id.trim().is_empty() {
            anyhow::bail!("node.node_id must not be empty");
        }
        if self.dht.k == 0 || self.dht.alpha == 0 || self.dht.disjoint_paths == 0 {
            anyhow::bail!("dht.k, dht.alpha and dht.disjoint_paths must be positive");
        }
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> std::path::PathBuf {
        expand_path(&self.data_dir)
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo::new(self.node.node_id.as_str(), self.node.api_host.as_str())
    }

    pub fn bootstrap_nodes(&self) -> Vec<NodeInfo> {
        self.bootstrap
            .iter()
            .map(|p| NodeInfo::new(p.node_id.as_str(), p.api_host.as_str()))
            .collect()
    }
}

impl DhtConfig {
    pub fn to_kad_config(&self) -> KadConfig {
        KadConfig {
            k: self.k,
            alpha: self.alpha,
            disjoint_paths: self.disjoint_paths,
            query_timeout: Duration::from_secs(self.query_timeout_secs),
        }
    }
}

/// Expand a leading ~/ to the home directory
pub fn expand_path(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}
