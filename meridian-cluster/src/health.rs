//! Cluster health: the operator's green/yellow/red rollup.
//!
//! Green: every primary and every replica is started. Yellow: all primaries
//! started, some replicas not. Red: at least one primary is not started.

use crate::state::routing::ShardRoutingState;
use crate::state::ClusterState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Green,
    Yellow,
    Red,
}

impl HealthStatus {
    fn worst(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Red, _) | (_, Red) => Red,
            (Yellow, _) | (_, Yellow) => Yellow,
            _ => Green,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Green => "green",
            HealthStatus::Yellow => "yellow",
            HealthStatus::Red => "red",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHealth {
    pub status: HealthStatus,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    pub active_primary_shards: u32,
    pub active_shards: u32,
    pub initializing_shards: u32,
    pub relocating_shards: u32,
    pub unassigned_shards: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub cluster_name: String,
    pub status: HealthStatus,
    pub cluster_state_version: u64,
    pub number_of_nodes: usize,
    pub number_of_data_nodes: usize,
    pub active_primary_shards: u32,
    pub active_shards: u32,
    pub initializing_shards: u32,
    pub relocating_shards: u32,
    pub unassigned_shards: u32,
    pub indices: BTreeMap<String, IndexHealth>,
}

/// Compute health from a cluster-state snapshot.
pub fn cluster_health(state: &ClusterState) -> ClusterHealth {
    let mut indices = BTreeMap::new();
    let mut status = HealthStatus::Green;

    for (name, metadata) in &state.metadata.indices {
        let mut health = IndexHealth {
            status: HealthStatus::Green,
            number_of_shards: metadata.number_of_shards(),
            number_of_replicas: metadata.number_of_replicas(),
            active_primary_shards: 0,
            active_shards: 0,
            initializing_shards: 0,
            relocating_shards: 0,
            unassigned_shards: 0,
        };

        if let Some(table) = state.routing_table.index(name) {
            for copies in table.shards.values() {
                for copy in copies {
                    match copy.state {
                        ShardRoutingState::Started | ShardRoutingState::Relocating => {
                            health.active_shards += 1;
                            if copy.primary {
                                health.active_primary_shards += 1;
                            }
                            if copy.state == ShardRoutingState::Relocating {
                                health.relocating_shards += 1;
                            }
                        }
                        ShardRoutingState::Initializing => health.initializing_shards += 1,
                        ShardRoutingState::Unassigned => health.unassigned_shards += 1,
                    }
                }
            }
        }

        health.status = if health.active_primary_shards < health.number_of_shards {
            HealthStatus::Red
        } else if health.active_shards
            < health.number_of_shards * (1 + health.number_of_replicas)
        {
            HealthStatus::Yellow
        } else {
            HealthStatus::Green
        };
        status = status.worst(health.status);
        indices.insert(name.clone(), health);
    }

    ClusterHealth {
        cluster_name: state.cluster_name.clone(),
        status,
        cluster_state_version: state.version,
        number_of_nodes: state.nodes.len(),
        number_of_data_nodes: state.nodes.data_nodes().count(),
        active_primary_shards: indices.values().map(|i| i.active_primary_shards).sum(),
        active_shards: indices.values().map(|i| i.active_shards).sum(),
        initializing_shards: indices.values().map(|i| i.initializing_shards).sum(),
        relocating_shards: indices.values().map(|i| i.relocating_shards).sum(),
        unassigned_shards: indices.values().map(|i| i.unassigned_shards).sum(),
        indices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::metadata::{IndexMetadata, Metadata};
    use crate::state::routing::{IndexRoutingTable, RoutingTable};
    use meridian::{IndexMapping, IndexSettings};

    fn state_with(primary_started: bool, replica_started: bool) -> ClusterState {
        let metadata_index = IndexMetadata::new(
            "logs",
            IndexSettings::with_shards(1, 1),
            IndexMapping::default(),
        );
        let mut table = IndexRoutingTable::new_index(&metadata_index.uuid, "logs", 1, 1);
        {
            let copies = table.shards.get_mut(&0).unwrap();
            if primary_started {
                copies[0] = copies[0].initialize("n1").start();
            }
            if replica_started {
                copies[1] = copies[1].initialize("n2").start();
            }
        }
        let mut metadata = Metadata::default();
        metadata.indices.insert("logs".to_string(), metadata_index);
        let mut routing = RoutingTable::default();
        routing.indices.insert("logs".to_string(), table);
        ClusterState::initial("health-test")
            .builder()
            .metadata(metadata)
            .routing_table(routing)
            .build()
    }

    #[test]
    fn test_green_when_everything_started() {
        let health = cluster_health(&state_with(true, true));
        assert_eq!(health.status, HealthStatus::Green);
        assert_eq!(health.active_shards, 2);
        assert_eq!(health.unassigned_shards, 0);
    }

    #[test]
    fn test_yellow_when_replica_missing() {
        let health = cluster_health(&state_with(true, false));
        assert_eq!(health.status, HealthStatus::Yellow);
        assert_eq!(health.active_primary_shards, 1);
        assert_eq!(health.unassigned_shards, 1);
    }

    #[test]
    fn test_red_when_primary_missing() {
        let health = cluster_health(&state_with(false, false));
        assert_eq!(health.status, HealthStatus::Red);
        assert_eq!(health.active_primary_shards, 0);
    }

    #[test]
    fn test_empty_cluster_is_green() {
        let health = cluster_health(&ClusterState::initial("empty"));
        assert_eq!(health.status, HealthStatus::Green);
        assert!(health.indices.is_empty());
    }
}
