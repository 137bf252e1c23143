//! The routing table: which copy of which shard lives on which node.
//!
//! Copy lifecycle:
//!
//! ```text
//! UNASSIGNED → INITIALIZING → STARTED → RELOCATING → STARTED (new node)
//!      ↑ (failure, from any assigned state)
//! ```
//!
//! The table is part of the immutable cluster state; the allocation engine
//! produces new tables rather than mutating in place.

use meridian::ShardId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRoutingState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

/// Where a copy gets its data when it initializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySource {
    /// Fresh primary with no data.
    EmptyStore,
    /// Copy files + translog from the active primary.
    Peer,
    /// Restore segment files from a snapshot repository.
    Snapshot { repository: String, snapshot: String },
    /// Reuse whatever is already on disk (primary restart).
    ExistingStore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub index_name: String,
    pub primary: bool,
    pub state: ShardRoutingState,
    /// Node hosting this copy; `None` while unassigned.
    pub current_node: Option<String>,
    /// Target node while relocating.
    pub relocating_node: Option<String>,
    /// Unique per assignment; a copy that fails and comes back gets a new one.
    pub allocation_id: Option<String>,
    pub recovery_source: RecoverySource,
}

impl ShardRouting {
    pub fn unassigned(
        shard_id: ShardId,
        index_name: impl Into<String>,
        primary: bool,
        recovery_source: RecoverySource,
    ) -> ShardRouting {
        ShardRouting {
            shard_id,
            index_name: index_name.into(),
            primary,
            state: ShardRoutingState::Unassigned,
            current_node: None,
            relocating_node: None,
            allocation_id: None,
            recovery_source,
        }
    }

    /// Assign to a node and begin recovery.
    pub fn initialize(&self, node_id: &str) -> ShardRouting {
        ShardRouting {
            state: ShardRoutingState::Initializing,
            current_node: Some(node_id.to_string()),
            relocating_node: None,
            allocation_id: Some(Uuid::new_v4().to_string()),
            ..self.clone()
        }
    }

    /// Recovery finished.
    pub fn start(&self) -> ShardRouting {
        ShardRouting {
            state: ShardRoutingState::Started,
            ..self.clone()
        }
    }

    pub fn relocate(&self, target_node: &str) -> ShardRouting {
        ShardRouting {
            state: ShardRoutingState::Relocating,
            relocating_node: Some(target_node.to_string()),
            ..self.clone()
        }
    }

    /// The copy failed: back to unassigned with a recovery source that fits
    /// what is left (replicas re-sync from the primary).
    pub fn fail(&self) -> ShardRouting {
        ShardRouting {
            state: ShardRoutingState::Unassigned,
            current_node: None,
            relocating_node: None,
            allocation_id: None,
            recovery_source: if self.primary {
                self.recovery_source.clone()
            } else {
                RecoverySource::Peer
            },
            ..self.clone()
        }
    }

    /// Promote a started replica to primary.
    pub fn promote(&self) -> ShardRouting {
        ShardRouting {
            primary: true,
            ..self.clone()
        }
    }

    pub fn assigned(&self) -> bool {
        self.current_node.is_some()
    }

    pub fn active(&self) -> bool {
        matches!(
            self.state,
            ShardRoutingState::Started | ShardRoutingState::Relocating
        )
    }

    pub fn on_node(&self, node_id: &str) -> bool {
        self.current_node.as_deref() == Some(node_id)
    }
}

/// All copies of all shards of one index, keyed by shard number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub index_uuid: String,
    pub shards: BTreeMap<u32, Vec<ShardRouting>>,
}

impl IndexRoutingTable {
    /// Fresh table for a new index: unassigned primaries (empty store) and
    /// replicas (peer recovery).
    pub fn new_index(
        index_uuid: &str,
        index_name: &str,
        primaries: u32,
        replicas: u32,
    ) -> IndexRoutingTable {
        let mut shards = BTreeMap::new();
        for shard in 0..primaries {
            let shard_id = ShardId::new(index_uuid, shard);
            let mut copies = vec![ShardRouting::unassigned(
                shard_id.clone(),
                index_name,
                true,
                RecoverySource::EmptyStore,
            )];
            for _ in 0..replicas {
                copies.push(ShardRouting::unassigned(
                    shard_id.clone(),
                    index_name,
                    false,
                    RecoverySource::Peer,
                ));
            }
            shards.insert(shard, copies);
        }
        IndexRoutingTable {
            index_uuid: index_uuid.to_string(),
            shards,
        }
    }

    pub fn primary(&self, shard: u32) -> Option<&ShardRouting> {
        self.shards.get(&shard)?.iter().find(|r| r.primary)
    }

    pub fn active_primary(&self, shard: u32) -> Option<&ShardRouting> {
        self.shards
            .get(&shard)?
            .iter()
            .find(|r| r.primary && r.active())
    }

    pub fn started_replicas(&self, shard: u32) -> Vec<&ShardRouting> {
        self.shards
            .get(&shard)
            .map(|copies| {
                copies
                    .iter()
                    .filter(|r| !r.primary && r.state == ShardRoutingState::Started)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_copies(&self, shard: u32) -> Vec<&ShardRouting> {
        self.shards
            .get(&shard)
            .map(|copies| copies.iter().filter(|r| r.active()).collect())
            .unwrap_or_default()
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Keyed by index name.
    pub indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    pub fn index(&self, name: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(name)
    }

    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices
            .values()
            .flat_map(|t| t.shards.values())
            .flatten()
    }

    pub fn shards_on_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ShardRouting> {
        self.all_shards().filter(move |r| r.on_node(node_id))
    }

    pub fn unassigned_shards(&self) -> Vec<&ShardRouting> {
        self.all_shards()
            .filter(|r| r.state == ShardRoutingState::Unassigned)
            .collect()
    }

    /// Invariant check: at most one started primary per shard number.
    pub fn validate(&self) -> bool {
        self.indices.values().all(|index| {
            index.shards.values().all(|copies| {
                copies
                    .iter()
                    .filter(|r| r.primary && r.state == ShardRoutingState::Started)
                    .count()
                    <= 1
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_index_layout() {
        let table = IndexRoutingTable::new_index("uuid-1", "logs", 3, 2);
        assert_eq!(table.shard_count(), 3);
        for shard in 0..3 {
            let copies = &table.shards[&shard];
            assert_eq!(copies.len(), 3);
            assert_eq!(copies.iter().filter(|c| c.primary).count(), 1);
            assert!(copies.iter().all(|c| c.state == ShardRoutingState::Unassigned));
        }
        let primary = table.primary(0).unwrap();
        assert_eq!(primary.recovery_source, RecoverySource::EmptyStore);
    }

    #[test]
    fn test_copy_lifecycle() {
        let shard_id = ShardId::new("u", 0);
        let unassigned =
            ShardRouting::unassigned(shard_id, "i", true, RecoverySource::EmptyStore);
        assert!(!unassigned.assigned());

        let initializing = unassigned.initialize("node-1");
        assert_eq!(initializing.state, ShardRoutingState::Initializing);
        assert!(initializing.on_node("node-1"));
        assert!(initializing.allocation_id.is_some());
        assert!(!initializing.active());

        let started = initializing.start();
        assert!(started.active());

        let relocating = started.relocate("node-2");
        assert_eq!(relocating.state, ShardRoutingState::Relocating);
        assert!(relocating.active(), "relocating copies still serve");

        let failed = started.fail();
        assert_eq!(failed.state, ShardRoutingState::Unassigned);
        assert!(failed.allocation_id.is_none());
    }

    #[test]
    fn test_failed_replica_recovers_from_peer() {
        let shard_id = ShardId::new("u", 0);
        let replica = ShardRouting::unassigned(shard_id, "i", false, RecoverySource::Peer)
            .initialize("n1")
            .start();
        assert_eq!(replica.fail().recovery_source, RecoverySource::Peer);
    }

    #[test]
    fn test_allocation_id_changes_per_assignment() {
        let shard_id = ShardId::new("u", 0);
        let base = ShardRouting::unassigned(shard_id, "i", true, RecoverySource::EmptyStore);
        let first = base.initialize("n1");
        let second = base.initialize("n1");
        assert_ne!(first.allocation_id, second.allocation_id);
    }

    #[test]
    fn test_validate_rejects_double_started_primary() {
        let mut table = IndexRoutingTable::new_index("u", "i", 1, 1);
        let copies = table.shards.get_mut(&0).unwrap();
        copies[0] = copies[0].initialize("n1").start();
        copies[1] = copies[1].initialize("n2").start();
        copies[1].primary = true;
        copies[1].state = ShardRoutingState::Started;

        let routing = RoutingTable {
            indices: [("i".to_string(), table)].into_iter().collect(),
        };
        assert!(!routing.validate());
    }

    #[test]
    fn test_shards_on_node() {
        let mut table = IndexRoutingTable::new_index("u", "i", 2, 0);
        for copies in table.shards.values_mut() {
            copies[0] = copies[0].initialize("n1").start();
        }
        let routing = RoutingTable {
            indices: [("i".to_string(), table)].into_iter().collect(),
        };
        assert_eq!(routing.shards_on_node("n1").count(), 2);
        assert_eq!(routing.shards_on_node("n2").count(), 0);
        assert!(routing.unassigned_shards().is_empty());
    }
}
