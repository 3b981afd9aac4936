//! Slate Configuration
//!
//! This module provides configuration structures for a Slate node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::id::NodeId;
use crate::membership::Neighbor;
use crate::replication::ReplicationConfig;

/// Main Slate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlateConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for the peer protocol
    pub bind_address: String,

    /// Data directory for the record database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Statically configured neighbor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborConfig {
    pub id: String,
    pub address: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Fixed neighbors
    #[serde(default)]
    pub neighbors: Vec<NeighborConfig>,

    /// JSON neighbor list maintained by the control plane; takes
    /// precedence over `neighbors` when set
    #[serde(default)]
    pub neighbors_file: Option<PathBuf>,

    /// Interval between anti-entropy rounds in milliseconds
    #[serde(default = "default_anti_entropy_interval_ms")]
    pub anti_entropy_interval_ms: u64,

    /// Maximum random delay added to each round in milliseconds
    #[serde(default = "default_anti_entropy_jitter_ms")]
    pub anti_entropy_jitter_ms: u64,

    /// Peer connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Peer request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Outbound pushes buffered before new ones are dropped
    #[serde(default = "default_push_queue_size")]
    pub push_queue_size: usize,

    /// Ask neighbors for our last counter on startup
    #[serde(default = "default_true")]
    pub recover_counter_on_start: bool,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// SQLite database in the data directory
    Sqlite,
    /// Volatile, for tests and throwaway nodes
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageKind,

    /// LZ4-compress large values
    #[serde(default = "default_true")]
    pub compression: bool,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions

fn default_anti_entropy_interval_ms() -> u64 {
    60_000
}

fn default_anti_entropy_jitter_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_push_queue_size() -> usize {
    1024
}

fn default_storage_backend() -> StorageKind {
    StorageKind::Sqlite
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/slate")
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            neighbors: Vec::new(),
            neighbors_file: None,
            anti_entropy_interval_ms: default_anti_entropy_interval_ms(),
            anti_entropy_jitter_ms: default_anti_entropy_jitter_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            push_queue_size: default_push_queue_size(),
            recover_counter_on_start: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            compression: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SlateConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: SlateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.anti_entropy_interval_ms == 0 {
            return Err(crate::Error::Config(
                "cluster.anti_entropy_interval_ms must be positive".into(),
            ));
        }

        if self.cluster.request_timeout_ms == 0 || self.cluster.connect_timeout_ms == 0 {
            return Err(crate::Error::Config("cluster timeouts must be positive".into()));
        }

        if self.cluster.push_queue_size == 0 {
            return Err(crate::Error::Config("cluster.push_queue_size must be positive".into()));
        }

        for neighbor in &self.cluster.neighbors {
            if neighbor.id.is_empty() || neighbor.address.is_empty() {
                return Err(crate::Error::Config(
                    "cluster.neighbors entries need both id and address".into(),
                ));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or json, got {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node.id.clone())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Statically configured neighbors
    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.cluster
            .neighbors
            .iter()
            .map(|n| Neighbor::new(n.id.as_str(), n.address.as_str()))
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }

    /// Replication settings derived from the cluster section
    pub fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            anti_entropy_interval: Duration::from_millis(self.cluster.anti_entropy_interval_ms),
            anti_entropy_jitter: Duration::from_millis(self.cluster.anti_entropy_jitter_ms),
            push_queue_size: self.cluster.push_queue_size,
            recover_counter_on_start: self.cluster.recover_counter_on_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:7654"
data_dir = "/var/lib/slate"

[cluster]
anti_entropy_interval_ms = 30000

[[cluster.neighbors]]
id = "node-2"
address = "node-2:7654"

[[cluster.neighbors]]
id = "node-3"
address = "node-3:7654"

[storage]
backend = "memory"
"#;

        let config = SlateConfig::from_str(toml).unwrap();
        assert_eq!(config.node_id(), NodeId::from("node-1"));
        assert_eq!(config.neighbors().len(), 2);
        assert_eq!(config.storage.backend, StorageKind::Memory);
        assert!(config.storage.compression);
        assert!(config.api.enabled);

        let replication = config.replication();
        assert_eq!(replication.anti_entropy_interval, Duration::from_secs(30));
        assert_eq!(replication.push_queue_size, 1024);
        assert!(replication.recover_counter_on_start);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = SlateConfig::from_str(
            r#"
[node]
id = "solo"
bind_address = "127.0.0.1:7654"
"#,
        )
        .unwrap();

        assert!(config.neighbors().is_empty());
        assert_eq!(config.cluster.anti_entropy_interval_ms, 60_000);
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let empty_id = r#"
[node]
id = ""
bind_address = "127.0.0.1:7654"
"#;
        assert!(SlateConfig::from_str(empty_id).is_err());

        let bad_format = r#"
[node]
id = "a"
bind_address = "127.0.0.1:7654"

[logging]
format = "xml"
"#;
        assert!(SlateConfig::from_str(bad_format).is_err());
    }
}
