//! Operation routing: mapping documents to shards and picking which copy of
//! each shard serves a read.
//!
//! The routing hash must be identical on every node and across releases, so
//! it is a fixed murmur3 (x86, 32-bit) rather than anything from the
//! standard library.

use crate::error::{ClusterError, Result};
use crate::state::routing::{IndexRoutingTable, ShardRouting};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// murmur3 x86 32-bit.
pub fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes(chunk.try_into().unwrap());
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    let mut k1: u32 = 0;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

/// `shard = hash(routing) mod primaries`.
pub fn shard_for(routing_key: &str, primary_count: u32) -> u32 {
    murmur3_x86_32(routing_key.as_bytes(), 0) % primary_count.max(1)
}

/// How reads choose among a shard's active copies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    /// Rotate across active copies.
    #[default]
    RoundRobin,
    /// Only the primary.
    Primary,
    /// Prefer a copy on the coordinating node, falling back to rotation.
    Local,
    /// Stable copy choice seeded by an arbitrary string (session affinity).
    Custom(String),
}

/// Copy selection for gets and searches.
pub struct OperationRouting {
    counter: AtomicU64,
}

impl Default for OperationRouting {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl OperationRouting {
    /// Pick the copy of one shard a read goes to.
    pub fn select_copy<'a>(
        &self,
        table: &'a IndexRoutingTable,
        shard: u32,
        preference: &Preference,
        local_node: &str,
    ) -> Result<&'a ShardRouting> {
        let copies = table.active_copies(shard);
        if copies.is_empty() {
            return Err(ClusterError::UnavailableShards(format!(
                "no active copy for shard [{}]",
                shard
            )));
        }
        let chosen = match preference {
            Preference::Primary => copies.iter().find(|c| c.primary).copied(),
            Preference::Local => copies
                .iter()
                .find(|c| c.on_node(local_node))
                .copied()
                .or_else(|| self.rotate(&copies)),
            Preference::Custom(seed) => {
                let idx = murmur3_x86_32(seed.as_bytes(), 0) as usize % copies.len();
                Some(copies[idx])
            }
            Preference::RoundRobin => self.rotate(&copies),
        };
        chosen.ok_or_else(|| {
            ClusterError::UnavailableShards(format!(
                "no copy for shard [{}] satisfies preference {:?}",
                shard, preference
            ))
        })
    }

    /// One active copy per shard number, for the search scatter.
    pub fn search_shards<'a>(
        &self,
        table: &'a IndexRoutingTable,
        preference: &Preference,
        local_node: &str,
    ) -> Result<Vec<&'a ShardRouting>> {
        let mut selected = Vec::new();
        for shard in table.shards.keys() {
            selected.push(self.select_copy(table, *shard, preference, local_node)?);
        }
        Ok(selected)
    }

    fn rotate<'a>(&self, copies: &[&'a ShardRouting]) -> Option<&'a ShardRouting> {
        if copies.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed) as usize;
        Some(copies[n % copies.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::routing::ShardRoutingState;

    /// Reference vectors for the standard murmur3 x86/32.
    #[test]
    fn test_murmur3_known_vectors() {
        assert_eq!(murmur3_x86_32(b"", 0), 0);
        assert_eq!(murmur3_x86_32(b"", 1), 0x514e28b7);
        assert_eq!(murmur3_x86_32(b"hello", 0), 0x248bfa47);
        assert_eq!(murmur3_x86_32(b"hello, world", 0), 0x149bbb7f);
        assert_eq!(murmur3_x86_32(b"The quick brown fox jumps over the lazy dog", 0), 0x2e4ff723);
    }

    #[test]
    fn test_shard_for_is_stable_and_bounded() {
        let a = shard_for("user-123", 5);
        assert_eq!(a, shard_for("user-123", 5));
        assert!(a < 5);
        // Different keys spread.
        let spread: std::collections::HashSet<u32> =
            (0..100).map(|i| shard_for(&format!("k{}", i), 5)).collect();
        assert!(spread.len() > 1);
    }

    fn table_with_copies() -> IndexRoutingTable {
        let mut table = IndexRoutingTable::new_index("u", "i", 1, 2);
        let copies = table.shards.get_mut(&0).unwrap();
        copies[0] = copies[0].initialize("n1").start();
        copies[1] = copies[1].initialize("n2").start();
        copies[2] = copies[2].initialize("n3").start();
        table
    }

    #[test]
    fn test_primary_preference() {
        let table = table_with_copies();
        let routing = OperationRouting::default();
        for _ in 0..5 {
            let copy = routing
                .select_copy(&table, 0, &Preference::Primary, "n9")
                .unwrap();
            assert!(copy.primary);
            assert!(copy.on_node("n1"));
        }
    }

    #[test]
    fn test_local_preference_falls_back() {
        let table = table_with_copies();
        let routing = OperationRouting::default();
        let copy = routing
            .select_copy(&table, 0, &Preference::Local, "n2")
            .unwrap();
        assert!(copy.on_node("n2"));
        // No local copy: still answers from somewhere.
        assert!(routing
            .select_copy(&table, 0, &Preference::Local, "elsewhere")
            .is_ok());
    }

    #[test]
    fn test_round_robin_rotates() {
        let table = table_with_copies();
        let routing = OperationRouting::default();
        let nodes: std::collections::HashSet<String> = (0..6)
            .map(|_| {
                routing
                    .select_copy(&table, 0, &Preference::RoundRobin, "n9")
                    .unwrap()
                    .current_node
                    .clone()
                    .unwrap()
            })
            .collect();
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn test_custom_preference_is_sticky() {
        let table = table_with_copies();
        let routing = OperationRouting::default();
        let pref = Preference::Custom("session-abc".to_string());
        let first = routing.select_copy(&table, 0, &pref, "n9").unwrap();
        for _ in 0..5 {
            let again = routing.select_copy(&table, 0, &pref, "n9").unwrap();
            assert_eq!(again.current_node, first.current_node);
        }
    }

    #[test]
    fn test_no_active_copy_is_unavailable() {
        let table = IndexRoutingTable::new_index("u", "i", 1, 0);
        let routing = OperationRouting::default();
        let err = routing
            .select_copy(&table, 0, &Preference::RoundRobin, "n1")
            .unwrap_err();
        assert_eq!(err.error_type(), "unavailable_shards");
    }

    #[test]
    fn test_search_shards_covers_every_shard() {
        let mut table = IndexRoutingTable::new_index("u", "i", 3, 0);
        for copies in table.shards.values_mut() {
            copies[0] = copies[0].initialize("n1").start();
        }
        let routing = OperationRouting::default();
        let selected = routing
            .search_shards(&table, &Preference::RoundRobin, "n1")
            .unwrap();
        assert_eq!(selected.len(), 3);
        let shards: std::collections::HashSet<u32> =
            selected.iter().map(|c| c.shard_id.shard).collect();
        assert_eq!(shards.len(), 3);
    }

    #[test]
    fn test_initializing_copy_not_selected() {
        let mut table = IndexRoutingTable::new_index("u", "i", 1, 1);
        {
            let copies = table.shards.get_mut(&0).unwrap();
            copies[0] = copies[0].initialize("n1").start();
            copies[1] = copies[1].initialize("n2"); // still initializing
        }
        let routing = OperationRouting::default();
        for _ in 0..6 {
            let copy = routing
                .select_copy(&table, 0, &Preference::RoundRobin, "nx")
                .unwrap();
            assert_eq!(copy.state, ShardRoutingState::Started);
        }
    }
}
