//! Weight-based shard balancing.
//!
//! A node's weight for an index combines how many shards it holds overall
//! and how many of that index; allocation picks the lightest permitted node,
//! and the rebalance pass moves shards from the heaviest to the lightest
//! node while the spread exceeds the threshold.

use crate::state::routing::{RoutingTable, ShardRouting};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerSettings {
    pub shard_balance_factor: f64,
    pub index_balance_factor: f64,
    /// Minimum weight delta that justifies a move.
    pub threshold: f64,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            shard_balance_factor: 0.45,
            index_balance_factor: 0.55,
            threshold: 1.0,
        }
    }
}

pub struct Balancer<'a> {
    routing: &'a RoutingTable,
    node_ids: Vec<String>,
    settings: &'a BalancerSettings,
}

impl<'a> Balancer<'a> {
    pub fn new(
        routing: &'a RoutingTable,
        node_ids: Vec<String>,
        settings: &'a BalancerSettings,
    ) -> Balancer<'a> {
        Balancer {
            routing,
            node_ids,
            settings,
        }
    }

    fn shards_on(&self, node_id: &str) -> usize {
        self.routing.shards_on_node(node_id).count()
    }

    fn index_shards_on(&self, node_id: &str, index: &str) -> usize {
        self.routing
            .shards_on_node(node_id)
            .filter(|r| r.index_name == index)
            .count()
    }

    /// Weight of a node with respect to one index; lower is lighter.
    pub fn weight(&self, node_id: &str, index: &str) -> f64 {
        let node_count = self.node_ids.len().max(1) as f64;
        let total_shards: usize = self
            .node_ids
            .iter()
            .map(|id| self.shards_on(id))
            .sum();
        let total_index_shards: usize = self
            .node_ids
            .iter()
            .map(|id| self.index_shards_on(id, index))
            .sum();
        let avg_shards = total_shards as f64 / node_count;
        let avg_index_shards = total_index_shards as f64 / node_count;

        self.settings.shard_balance_factor * (self.shards_on(node_id) as f64 - avg_shards)
            + self.settings.index_balance_factor
                * (self.index_shards_on(node_id, index) as f64 - avg_index_shards)
    }

    /// Lightest node among `candidates` for this shard's index.
    pub fn pick_lightest(&self, shard: &ShardRouting, candidates: &[String]) -> Option<String> {
        candidates
            .iter()
            .map(|id| (id, self.weight(id, &shard.index_name)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id.clone())
    }

    /// One candidate move that would reduce the imbalance beyond the
    /// threshold: the started shard on the heaviest node whose transfer to
    /// the lightest node helps.
    pub fn propose_move(&self) -> Option<(ShardRouting, String)> {
        let mut best: Option<(ShardRouting, String, f64)> = None;
        for shard in self.routing.all_shards() {
            if !shard.active() || shard.relocating_node.is_some() {
                continue;
            }
            let Some(from) = shard.current_node.as_deref() else {
                continue;
            };
            for to in &self.node_ids {
                if to == from {
                    continue;
                }
                let delta = self.weight(from, &shard.index_name) - self.weight(to, &shard.index_name);
                // Moving helps when the spread exceeds the threshold; the
                // move itself shifts one shard, so require strictly more.
                if delta > self.settings.threshold {
                    let gain = delta;
                    if best.as_ref().is_none_or(|(_, _, g)| gain > *g) {
                        best = Some((shard.clone(), to.clone(), gain));
                    }
                }
            }
        }
        best.map(|(shard, to, _)| (shard, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::routing::IndexRoutingTable;

    fn routing_with(assignments: &[(&str, u32, &str)]) -> RoutingTable {
        // (index, shard, node)
        let mut indices: std::collections::BTreeMap<String, IndexRoutingTable> =
            std::collections::BTreeMap::new();
        for (index, shard, node) in assignments {
            let table = indices.entry(index.to_string()).or_insert_with(|| {
                IndexRoutingTable {
                    index_uuid: format!("uuid-{}", index),
                    shards: Default::default(),
                }
            });
            let shard_id = meridian::ShardId::new(format!("uuid-{}", index), *shard);
            let copy = ShardRouting::unassigned(
                shard_id,
                *index,
                true,
                crate::state::routing::RecoverySource::EmptyStore,
            )
            .initialize(node)
            .start();
            table.shards.entry(*shard).or_default().push(copy);
        }
        RoutingTable { indices }
    }

    #[test]
    fn test_weight_prefers_empty_node() {
        let routing = routing_with(&[("i", 0, "n1"), ("i", 1, "n1")]);
        let settings = BalancerSettings::default();
        let balancer = Balancer::new(
            &routing,
            vec!["n1".to_string(), "n2".to_string()],
            &settings,
        );
        assert!(balancer.weight("n1", "i") > balancer.weight("n2", "i"));

        let shard = ShardRouting::unassigned(
            meridian::ShardId::new("uuid-i", 2),
            "i",
            true,
            crate::state::routing::RecoverySource::EmptyStore,
        );
        assert_eq!(
            balancer.pick_lightest(&shard, &["n1".to_string(), "n2".to_string()]),
            Some("n2".to_string())
        );
    }

    #[test]
    fn test_propose_move_on_imbalance() {
        // Four shards on n1, none on n2: clearly past the threshold.
        let routing = routing_with(&[
            ("i", 0, "n1"),
            ("i", 1, "n1"),
            ("i", 2, "n1"),
            ("i", 3, "n1"),
        ]);
        let settings = BalancerSettings::default();
        let balancer = Balancer::new(
            &routing,
            vec!["n1".to_string(), "n2".to_string()],
            &settings,
        );
        let (shard, to) = balancer.propose_move().expect("imbalance warrants a move");
        assert_eq!(to, "n2");
        assert!(shard.on_node("n1"));
    }

    #[test]
    fn test_no_move_when_balanced() {
        let routing = routing_with(&[("i", 0, "n1"), ("i", 1, "n2")]);
        let settings = BalancerSettings::default();
        let balancer = Balancer::new(
            &routing,
            vec!["n1".to_string(), "n2".to_string()],
            &settings,
        );
        assert!(balancer.propose_move().is_none());
    }

    #[test]
    fn test_index_balance_spreads_indices() {
        // n1 and n2 each hold two shards, but both of index "a" sit on n1.
        let routing = routing_with(&[
            ("a", 0, "n1"),
            ("a", 1, "n1"),
            ("b", 0, "n2"),
            ("b", 1, "n2"),
        ]);
        let settings = BalancerSettings::default();
        let balancer = Balancer::new(
            &routing,
            vec!["n1".to_string(), "n2".to_string()],
            &settings,
        );
        // Per-index weights still see the skew.
        assert!(balancer.weight("n1", "a") > balancer.weight("n2", "a"));
    }
}
