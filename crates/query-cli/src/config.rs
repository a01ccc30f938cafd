use anyhow::Result;
use query_distributed::NetworkConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node configuration, loaded from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listener address of the node's worker
    pub address: String,
    pub network: NetworkConfig,
    /// Log level used when RUST_LOG is unset and --verbose is off
    pub log_level: String,
    /// Rows printed per result set
    pub max_rows: usize,
    pub show_profiles: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7400".to_string(),
            network: NetworkConfig::default(),
            log_level: "info".to_string(),
            max_rows: 1000,
            show_profiles: true,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
