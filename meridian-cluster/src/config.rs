//! Node/cluster configuration and on-disk node identity.

use crate::allocation::deciders::AllocationSettings;
use crate::allocation::balancer::BalancerSettings;
use crate::discovery::fault::FaultDetectionConfig;
use crate::discovery::DiscoveryConfig;
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const NODE_UUID_FILE: &str = "node.uuid";

fn default_cluster_name() -> String {
    "meridian".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:9300".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_minimum_master_nodes() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_ping_timeout_ms() -> u64 {
    1000
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_election_interval_ms() -> u64 {
    500
}

fn default_publish_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    60_000
}

fn default_compress_threshold() -> usize {
    8 * 1024
}

/// Which operations the local no-master block forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoMasterBlockSetting {
    Write,
    All,
}

impl Default for NoMasterBlockSetting {
    fn default() -> Self {
        NoMasterBlockSetting::Write
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Human-readable; the node id is a persisted UUID.
    #[serde(default)]
    pub node_name: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub seed_addresses: Vec<String>,
    /// Quorum for elections and publication. Must be at least
    /// floor(expected_master_nodes/2)+1.
    #[serde(default = "default_minimum_master_nodes")]
    pub minimum_master_nodes: usize,
    /// Expected number of master-eligible nodes; used to validate the
    /// quorum setting when provided.
    #[serde(default)]
    pub expected_master_nodes: Option<usize>,
    #[serde(default = "default_true")]
    pub master_eligible: bool,
    #[serde(default = "default_true")]
    pub data: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub no_master_block: NoMasterBlockSetting,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_election_interval_ms")]
    pub election_interval_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_compress_threshold")]
    pub transport_compress_threshold: usize,
    #[serde(default)]
    pub fault: FaultDetectionConfig,
    #[serde(default)]
    pub allocation: AllocationSettings,
    #[serde(default)]
    pub balancer: BalancerSettings,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config uses defaults")
    }
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<ClusterConfig> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClusterError::Validation(format!("cannot read {:?}: {}", path, e)))?;
        let config: ClusterConfig = toml::from_str(&text)
            .map_err(|e| ClusterError::Validation(format!("invalid config {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.minimum_master_nodes == 0 {
            return Err(ClusterError::Validation(
                "minimum_master_nodes must be at least 1".to_string(),
            ));
        }
        if let Some(expected) = self.expected_master_nodes {
            let floor = expected / 2 + 1;
            if self.minimum_master_nodes < floor {
                return Err(ClusterError::Validation(format!(
                    "minimum_master_nodes [{}] is below the quorum floor [{}] for [{}] master-eligible nodes",
                    self.minimum_master_nodes, floor, expected
                )));
            }
        }
        Ok(())
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            cluster_name: self.cluster_name.clone(),
            seed_addresses: self.seed_addresses.clone(),
            minimum_master_nodes: self.minimum_master_nodes,
            ping_timeout_ms: self.ping_timeout_ms,
            join_timeout_ms: self.join_timeout_ms,
            election_interval_ms: self.election_interval_ms,
            no_master_block_all: self.no_master_block == NoMasterBlockSetting::All,
            publish_timeout_ms: self.publish_timeout_ms,
            fault: self.fault.clone(),
        }
    }
}

/// The node's identity: a UUID minted on first start and persisted in the
/// data directory.
pub fn load_or_create_node_id(data_dir: &Path) -> Result<String> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(NODE_UUID_FILE);
    if path.exists() {
        let id = std::fs::read_to_string(&path)?;
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(ClusterError::Validation(format!(
                "empty node uuid file {:?}",
                path
            )));
        }
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.cluster_name, "meridian");
        assert_eq!(config.minimum_master_nodes, 1);
        assert!(config.master_eligible);
        assert!(config.data);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let text = r#"
            cluster_name = "prod"
            bind_addr = "0.0.0.0:9300"
            seed_addresses = ["10.0.0.1:9300", "10.0.0.2:9300"]
            minimum_master_nodes = 2
            expected_master_nodes = 3
            no_master_block = "all"

            [attributes]
            rack = "r1"
        "#;
        let config: ClusterConfig = toml::from_str(text).unwrap();
        assert_eq!(config.cluster_name, "prod");
        assert_eq!(config.seed_addresses.len(), 2);
        assert_eq!(config.no_master_block, NoMasterBlockSetting::All);
        assert_eq!(config.attributes["rack"], "r1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_quorum_floor_validation() {
        let mut config = ClusterConfig::default();
        config.expected_master_nodes = Some(5);
        config.minimum_master_nodes = 2;
        assert!(config.validate().is_err());
        config.minimum_master_nodes = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_id_persists() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_node_id(dir.path()).unwrap();
        let second = load_or_create_node_id(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(dir.path().join(NODE_UUID_FILE).exists());
    }
}
