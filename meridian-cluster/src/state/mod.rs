//! The cluster state: a versioned, immutable snapshot of everything a node
//! needs to route requests — nodes, index metadata, the routing table, and
//! the blocks currently in force.
//!
//! Every change produces a new value with a strictly higher version. Readers
//! hold an `Arc` snapshot; only the master's single-threaded update executor
//! produces new versions, and followers apply them in order.

pub mod metadata;
pub mod routing;
pub mod service;

use crate::error::{ClusterError, Result};
use metadata::Metadata;
use routing::RoutingTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeRoles {
    pub master_eligible: bool,
    pub data: bool,
}

impl NodeRoles {
    pub fn master_data() -> NodeRoles {
        NodeRoles {
            master_eligible: true,
            data: true,
        }
    }

    pub fn data_only() -> NodeRoles {
        NodeRoles {
            master_eligible: false,
            data: true,
        }
    }

    pub fn coordinating_only() -> NodeRoles {
        NodeRoles {
            master_eligible: false,
            data: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// UUID minted on first startup and persisted in the data directory.
    pub id: String,
    pub name: String,
    pub address: String,
    pub roles: NodeRoles,
    /// Operator-assigned attributes (rack, zone, tier) used by awareness and
    /// filter deciders.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    pub nodes: BTreeMap<String, DiscoveryNode>,
    pub master_node_id: Option<String>,
}

impl DiscoveryNodes {
    pub fn get(&self, id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(id)
    }

    pub fn master_node(&self) -> Option<&DiscoveryNode> {
        self.master_node_id.as_ref().and_then(|id| self.nodes.get(id))
    }

    pub fn master_eligible(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.roles.master_eligible)
    }

    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.roles.data)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBlockLevel {
    Write,
    Read,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlock {
    pub id: u32,
    pub description: String,
    /// Retryable blocks clear on their own (e.g. once a master is elected).
    pub retryable: bool,
    pub levels: Vec<ClusterBlockLevel>,
}

pub const NO_MASTER_BLOCK_ID: u32 = 2;
pub const INDEX_CLOSED_BLOCK_ID: u32 = 4;

impl ClusterBlock {
    /// "No master" flavor that blocks writes but serves reads.
    pub fn no_master_writes() -> ClusterBlock {
        ClusterBlock {
            id: NO_MASTER_BLOCK_ID,
            description: "no master".to_string(),
            retryable: true,
            levels: vec![ClusterBlockLevel::Write, ClusterBlockLevel::Metadata],
        }
    }

    /// "No master" flavor that blocks everything.
    pub fn no_master_all() -> ClusterBlock {
        ClusterBlock {
            id: NO_MASTER_BLOCK_ID,
            description: "no master".to_string(),
            retryable: true,
            levels: vec![
                ClusterBlockLevel::Write,
                ClusterBlockLevel::Read,
                ClusterBlockLevel::Metadata,
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterBlocks {
    pub global: Vec<ClusterBlock>,
}

impl ClusterBlocks {
    pub fn check(&self, level: ClusterBlockLevel) -> Result<()> {
        for block in &self.global {
            if block.levels.contains(&level) {
                return Err(ClusterError::ClusterBlock(format!(
                    "blocked by [{}/{}]",
                    block.id, block.description
                )));
            }
        }
        Ok(())
    }

    pub fn has_block(&self, id: u32) -> bool {
        self.global.iter().any(|b| b.id == id)
    }

    pub fn with_block(&self, block: ClusterBlock) -> ClusterBlocks {
        let mut blocks = self.clone();
        if !blocks.has_block(block.id) {
            blocks.global.push(block);
        }
        blocks
    }

    pub fn without_block(&self, id: u32) -> ClusterBlocks {
        ClusterBlocks {
            global: self.global.iter().filter(|b| b.id != id).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_name: String,
    pub version: u64,
    pub nodes: DiscoveryNodes,
    pub metadata: Metadata,
    pub routing_table: RoutingTable,
    pub blocks: ClusterBlocks,
}

impl ClusterState {
    /// The state a node starts from before joining anything: version 0, no
    /// master, writes blocked.
    pub fn initial(cluster_name: impl Into<String>) -> ClusterState {
        ClusterState {
            cluster_name: cluster_name.into(),
            version: 0,
            nodes: DiscoveryNodes::default(),
            metadata: Metadata::default(),
            routing_table: RoutingTable::default(),
            blocks: ClusterBlocks::default().with_block(ClusterBlock::no_master_writes()),
        }
    }

    pub fn builder(&self) -> ClusterStateBuilder {
        ClusterStateBuilder {
            state: ClusterState {
                version: self.version + 1,
                ..self.clone()
            },
        }
    }

    pub fn master_node_id(&self) -> Option<&str> {
        self.nodes.master_node_id.as_deref()
    }
}

/// Builder producing the next state version from a base state.
pub struct ClusterStateBuilder {
    state: ClusterState,
}

impl ClusterStateBuilder {
    pub fn nodes(mut self, nodes: DiscoveryNodes) -> Self {
        self.state.nodes = nodes;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.state.metadata = metadata;
        self
    }

    pub fn routing_table(mut self, routing_table: RoutingTable) -> Self {
        self.state.routing_table = routing_table;
        self
    }

    pub fn blocks(mut self, blocks: ClusterBlocks) -> Self {
        self.state.blocks = blocks;
        self
    }

    pub fn build(self) -> ClusterState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, master: bool) -> DiscoveryNode {
        DiscoveryNode {
            id: id.to_string(),
            name: format!("name-{}", id),
            address: format!("local://{}", id),
            roles: if master {
                NodeRoles::master_data()
            } else {
                NodeRoles::data_only()
            },
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_initial_state_blocks_writes() {
        let state = ClusterState::initial("test");
        assert_eq!(state.version, 0);
        assert!(state.blocks.check(ClusterBlockLevel::Write).is_err());
        assert!(state.blocks.check(ClusterBlockLevel::Read).is_ok());
    }

    #[test]
    fn test_builder_bumps_version() {
        let state = ClusterState::initial("test");
        let next = state.builder().build();
        assert_eq!(next.version, 1);
        let after = next.builder().build();
        assert_eq!(after.version, 2);
    }

    #[test]
    fn test_no_master_all_blocks_reads() {
        let blocks = ClusterBlocks::default().with_block(ClusterBlock::no_master_all());
        assert!(blocks.check(ClusterBlockLevel::Read).is_err());
        assert!(blocks.check(ClusterBlockLevel::Write).is_err());

        let cleared = blocks.without_block(NO_MASTER_BLOCK_ID);
        assert!(cleared.check(ClusterBlockLevel::Write).is_ok());
    }

    #[test]
    fn test_with_block_is_idempotent() {
        let blocks = ClusterBlocks::default()
            .with_block(ClusterBlock::no_master_writes())
            .with_block(ClusterBlock::no_master_writes());
        assert_eq!(blocks.global.len(), 1);
    }

    #[test]
    fn test_discovery_nodes_queries() {
        let mut nodes = DiscoveryNodes::default();
        for (id, master) in [("a", true), ("b", true), ("c", false)] {
            nodes.nodes.insert(id.to_string(), node(id, master));
        }
        nodes.master_node_id = Some("a".to_string());

        assert_eq!(nodes.master_eligible().count(), 2);
        assert_eq!(nodes.data_nodes().count(), 3);
        assert_eq!(nodes.master_node().unwrap().id, "a");
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let state = ClusterState::initial("cluster-x");
        let bytes = bincode::serialize(&state).unwrap();
        let back: ClusterState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, state);
    }
}
