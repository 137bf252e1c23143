//! Allocation deciders: independent predicates over (shard, node) pairs.
//!
//! Deciders run in order; the first NO wins, THROTTLE is remembered, and a
//! clean pass is YES. A throttled shard stays unassigned and is retried on
//! the next reroute.

use crate::state::routing::{RoutingTable, ShardRouting, ShardRoutingState};
use crate::state::DiscoveryNode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Yes,
    No(String),
    Throttle(String),
}

impl Decision {
    pub fn is_yes(&self) -> bool {
        matches!(self, Decision::Yes)
    }
}

/// Per-node disk usage as reported by node stats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub used_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationEnable {
    All,
    Primaries,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationSettings {
    pub enable: AllocationEnable,
    /// Nodes above this used-disk fraction accept no new shards and are
    /// drained.
    pub high_disk_watermark: f64,
    /// Spread copies of a shard across distinct values of this node
    /// attribute (e.g. "rack").
    pub awareness_attribute: Option<String>,
    /// Node-attribute filters.
    pub require: BTreeMap<String, String>,
    pub include: BTreeMap<String, String>,
    pub exclude: BTreeMap<String, String>,
    pub max_incoming_recoveries_per_node: usize,
    pub max_outgoing_recoveries_per_node: usize,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            enable: AllocationEnable::All,
            high_disk_watermark: 0.90,
            awareness_attribute: None,
            require: BTreeMap::new(),
            include: BTreeMap::new(),
            exclude: BTreeMap::new(),
            max_incoming_recoveries_per_node: 2,
            max_outgoing_recoveries_per_node: 2,
        }
    }
}

/// Everything a decider may look at.
pub struct AllocationContext<'a> {
    /// The routing table being built (assignments so far included).
    pub routing: &'a RoutingTable,
    pub nodes: &'a BTreeMap<String, DiscoveryNode>,
    pub disk_usage: &'a HashMap<String, DiskUsage>,
    pub settings: &'a AllocationSettings,
}

pub trait AllocationDecider: Send + Sync {
    fn name(&self) -> &'static str;

    /// May this copy be placed on this node?
    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision;

    /// May a copy already on this node stay there? Used by the move pass.
    fn can_remain(
        &self,
        _shard: &ShardRouting,
        _node: &DiscoveryNode,
        _ctx: &AllocationContext,
    ) -> Decision {
        Decision::Yes
    }
}

/// Two copies of one shard never share a node.
pub struct SameShardDecider;

impl AllocationDecider for SameShardDecider {
    fn name(&self) -> &'static str {
        "same_shard"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        let occupied = ctx.routing.all_shards().any(|r| {
            r.shard_id == shard.shard_id
                && (r.on_node(&node.id) || r.relocating_node.as_deref() == Some(node.id.as_str()))
        });
        if occupied {
            Decision::No(format!(
                "a copy of {} is already on node [{}]",
                shard.shard_id, node.id
            ))
        } else {
            Decision::Yes
        }
    }
}

/// Skip nodes above the disk watermark, and drain shards off them.
pub struct DiskThresholdDecider;

impl AllocationDecider for DiskThresholdDecider {
    fn name(&self) -> &'static str {
        "disk_threshold"
    }

    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        match ctx.disk_usage.get(&node.id) {
            Some(usage) if usage.used_fraction >= ctx.settings.high_disk_watermark => {
                Decision::No(format!(
                    "node [{}] is above the high disk watermark ({:.0}%)",
                    node.id,
                    usage.used_fraction * 100.0
                ))
            }
            _ => Decision::Yes,
        }
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        self.can_allocate(shard, node, ctx)
    }
}

/// Spread copies across values of the awareness attribute.
pub struct AwarenessDecider;

impl AllocationDecider for AwarenessDecider {
    fn name(&self) -> &'static str {
        "awareness"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        let Some(attribute) = ctx.settings.awareness_attribute.as_deref() else {
            return Decision::Yes;
        };
        let Some(node_value) = node.attributes.get(attribute) else {
            return Decision::No(format!(
                "node [{}] has no [{}] awareness attribute",
                node.id, attribute
            ));
        };

        let values: HashSet<&String> = ctx
            .nodes
            .values()
            .filter_map(|n| n.attributes.get(attribute))
            .collect();
        if values.is_empty() {
            return Decision::Yes;
        }

        let assigned: Vec<&ShardRouting> = ctx
            .routing
            .all_shards()
            .filter(|r| r.shard_id == shard.shard_id && r.assigned())
            .collect();
        let on_same_value = assigned
            .iter()
            .filter(|r| {
                r.current_node
                    .as_ref()
                    .and_then(|id| ctx.nodes.get(id))
                    .and_then(|n| n.attributes.get(attribute))
                    == Some(node_value)
            })
            .count();

        let total_copies = assigned.len() + 1;
        let allowed = total_copies.div_ceil(values.len());
        if on_same_value + 1 > allowed {
            Decision::No(format!(
                "too many copies of {} in [{}={}] ({} of {} allowed)",
                shard.shard_id,
                attribute,
                node_value,
                on_same_value + 1,
                allowed
            ))
        } else {
            Decision::Yes
        }
    }
}

/// Cluster-wide allocation toggle.
pub struct EnableAllocationDecider;

impl AllocationDecider for EnableAllocationDecider {
    fn name(&self) -> &'static str {
        "enable_allocation"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        match ctx.settings.enable {
            AllocationEnable::All => Decision::Yes,
            AllocationEnable::Primaries if shard.primary => Decision::Yes,
            AllocationEnable::Primaries => {
                Decision::No("replica allocation is disabled".to_string())
            }
            AllocationEnable::None => Decision::No("allocation is disabled".to_string()),
        }
    }
}

/// Include/exclude/require node-attribute filters.
pub struct FilterDecider;

impl AllocationDecider for FilterDecider {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        for (key, value) in &ctx.settings.require {
            if node.attributes.get(key) != Some(value) {
                return Decision::No(format!(
                    "node [{}] does not satisfy require [{}={}]",
                    node.id, key, value
                ));
            }
        }
        if !ctx.settings.include.is_empty() {
            let included = ctx
                .settings
                .include
                .iter()
                .any(|(key, value)| node.attributes.get(key) == Some(value));
            if !included {
                return Decision::No(format!(
                    "node [{}] matches no include filter",
                    node.id
                ));
            }
        }
        for (key, value) in &ctx.settings.exclude {
            if node.attributes.get(key) == Some(value) {
                return Decision::No(format!(
                    "node [{}] matches exclude [{}={}]",
                    node.id, key, value
                ));
            }
        }
        Decision::Yes
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        self.can_allocate(shard, node, ctx)
    }
}

/// Bound concurrent recoveries per node so recovery traffic cannot saturate
/// the network.
pub struct ThrottlingDecider;

impl AllocationDecider for ThrottlingDecider {
    fn name(&self) -> &'static str {
        "throttling"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        let incoming = ctx
            .routing
            .shards_on_node(&node.id)
            .filter(|r| r.state == ShardRoutingState::Initializing)
            .count();
        if incoming >= ctx.settings.max_incoming_recoveries_per_node {
            return Decision::Throttle(format!(
                "node [{}] already has {} incoming recoveries",
                node.id, incoming
            ));
        }

        // Peer recoveries also load the primary's node.
        if !shard.primary {
            if let Some(primary) = ctx
                .routing
                .all_shards()
                .find(|r| r.shard_id == shard.shard_id && r.primary && r.assigned())
            {
                let source_node = primary.current_node.as_deref().unwrap_or_default();
                let outgoing = ctx
                    .routing
                    .all_shards()
                    .filter(|r| {
                        !r.primary && r.state == ShardRoutingState::Initializing && {
                            // Replica recoveries pull from their primary.
                            ctx.routing
                                .all_shards()
                                .find(|p| p.shard_id == r.shard_id && p.primary && p.assigned())
                                .is_some_and(|p| p.on_node(source_node))
                        }
                    })
                    .count();
                if outgoing >= ctx.settings.max_outgoing_recoveries_per_node {
                    return Decision::Throttle(format!(
                        "primary node [{}] already has {} outgoing recoveries",
                        source_node, outgoing
                    ));
                }
            }
        }
        Decision::Yes
    }
}

/// The standard decider chain, evaluated in order.
pub struct Deciders {
    deciders: Vec<Box<dyn AllocationDecider>>,
}

impl Default for Deciders {
    fn default() -> Self {
        Self {
            deciders: vec![
                Box::new(SameShardDecider),
                Box::new(EnableAllocationDecider),
                Box::new(FilterDecider),
                Box::new(DiskThresholdDecider),
                Box::new(AwarenessDecider),
                Box::new(ThrottlingDecider),
            ],
        }
    }
}

impl Deciders {
    pub fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        let mut throttled = None;
        for decider in &self.deciders {
            match decider.can_allocate(shard, node, ctx) {
                Decision::Yes => {}
                no @ Decision::No(_) => return no,
                Decision::Throttle(reason) => throttled = Some(reason),
            }
        }
        match throttled {
            Some(reason) => Decision::Throttle(reason),
            None => Decision::Yes,
        }
    }

    pub fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &DiscoveryNode,
        ctx: &AllocationContext,
    ) -> Decision {
        for decider in &self.deciders {
            if let no @ Decision::No(_) = decider.can_remain(shard, node, ctx) {
                return no;
            }
        }
        Decision::Yes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::routing::{IndexRoutingTable, RecoverySource};
    use crate::state::NodeRoles;
    use meridian::ShardId;

    fn node(id: &str, attrs: &[(&str, &str)]) -> DiscoveryNode {
        DiscoveryNode {
            id: id.to_string(),
            name: id.to_string(),
            address: format!("local://{}", id),
            roles: NodeRoles::master_data(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    struct Fixture {
        routing: RoutingTable,
        nodes: BTreeMap<String, DiscoveryNode>,
        disk: HashMap<String, DiskUsage>,
        settings: AllocationSettings,
    }

    impl Fixture {
        fn new() -> Fixture {
            let mut table = IndexRoutingTable::new_index("u", "i", 1, 1);
            let copies = table.shards.get_mut(&0).unwrap();
            copies[0] = copies[0].initialize("n1").start();
            Fixture {
                routing: RoutingTable {
                    indices: [("i".to_string(), table)].into_iter().collect(),
                },
                nodes: ["n1", "n2", "n3"]
                    .iter()
                    .map(|id| (id.to_string(), node(id, &[])))
                    .collect(),
                disk: HashMap::new(),
                settings: AllocationSettings::default(),
            }
        }

        fn ctx(&self) -> AllocationContext<'_> {
            AllocationContext {
                routing: &self.routing,
                nodes: &self.nodes,
                disk_usage: &self.disk,
                settings: &self.settings,
            }
        }

        fn replica(&self) -> ShardRouting {
            ShardRouting::unassigned(ShardId::new("u", 0), "i", false, RecoverySource::Peer)
        }
    }

    #[test]
    fn test_same_shard_decider() {
        let fixture = Fixture::new();
        let replica = fixture.replica();
        let deciders = Deciders::default();
        assert!(matches!(
            deciders.can_allocate(&replica, &fixture.nodes["n1"], &fixture.ctx()),
            Decision::No(_)
        ));
        assert!(deciders
            .can_allocate(&replica, &fixture.nodes["n2"], &fixture.ctx())
            .is_yes());
    }

    #[test]
    fn test_disk_threshold_decider() {
        let mut fixture = Fixture::new();
        fixture
            .disk
            .insert("n2".to_string(), DiskUsage { used_fraction: 0.95 });
        let replica = fixture.replica();
        let deciders = Deciders::default();
        assert!(matches!(
            deciders.can_allocate(&replica, &fixture.nodes["n2"], &fixture.ctx()),
            Decision::No(_)
        ));
        assert!(deciders
            .can_allocate(&replica, &fixture.nodes["n3"], &fixture.ctx())
            .is_yes());

        // And the copy already there must be moved off.
        let primary = fixture.routing.index("i").unwrap().primary(0).unwrap().clone();
        fixture
            .disk
            .insert("n1".to_string(), DiskUsage { used_fraction: 0.99 });
        assert!(matches!(
            deciders.can_remain(&primary, &fixture.nodes["n1"], &fixture.ctx()),
            Decision::No(_)
        ));
    }

    #[test]
    fn test_enable_allocation_decider() {
        let mut fixture = Fixture::new();
        fixture.settings.enable = AllocationEnable::Primaries;
        let deciders = Deciders::default();
        let replica = fixture.replica();
        assert!(matches!(
            deciders.can_allocate(&replica, &fixture.nodes["n2"], &fixture.ctx()),
            Decision::No(_)
        ));

        let primary = ShardRouting::unassigned(
            ShardId::new("u2", 0),
            "i2",
            true,
            RecoverySource::EmptyStore,
        );
        assert!(deciders
            .can_allocate(&primary, &fixture.nodes["n2"], &fixture.ctx())
            .is_yes());
    }

    #[test]
    fn test_filter_decider() {
        let mut fixture = Fixture::new();
        fixture.nodes.insert("hot".to_string(), node("hot", &[("tier", "hot")]));
        fixture.nodes.insert("cold".to_string(), node("cold", &[("tier", "cold")]));
        fixture
            .settings
            .require
            .insert("tier".to_string(), "hot".to_string());
        let deciders = Deciders::default();
        let replica = fixture.replica();
        assert!(deciders
            .can_allocate(&replica, &fixture.nodes["hot"], &fixture.ctx())
            .is_yes());
        assert!(matches!(
            deciders.can_allocate(&replica, &fixture.nodes["cold"], &fixture.ctx()),
            Decision::No(_)
        ));
    }

    #[test]
    fn test_exclude_filter() {
        let mut fixture = Fixture::new();
        fixture
            .nodes
            .insert("bad".to_string(), node("bad", &[("zone", "z9")]));
        fixture
            .settings
            .exclude
            .insert("zone".to_string(), "z9".to_string());
        let deciders = Deciders::default();
        let replica = fixture.replica();
        assert!(matches!(
            deciders.can_allocate(&replica, &fixture.nodes["bad"], &fixture.ctx()),
            Decision::No(_)
        ));
    }

    #[test]
    fn test_awareness_decider_spreads_copies() {
        let mut fixture = Fixture::new();
        fixture.nodes.clear();
        fixture
            .nodes
            .insert("n1".to_string(), node("n1", &[("rack", "r1")]));
        fixture
            .nodes
            .insert("n2".to_string(), node("n2", &[("rack", "r1")]));
        fixture
            .nodes
            .insert("n3".to_string(), node("n3", &[("rack", "r2")]));
        fixture.settings.awareness_attribute = Some("rack".to_string());

        // Primary is on n1 (rack r1); the replica must go to rack r2.
        let deciders = Deciders::default();
        let replica = fixture.replica();
        assert!(matches!(
            deciders.can_allocate(&replica, &fixture.nodes["n2"], &fixture.ctx()),
            Decision::No(_)
        ));
        assert!(deciders
            .can_allocate(&replica, &fixture.nodes["n3"], &fixture.ctx())
            .is_yes());
    }

    #[test]
    fn test_throttling_decider() {
        let mut fixture = Fixture::new();
        fixture.settings.max_incoming_recoveries_per_node = 1;
        // n2 already has one incoming recovery.
        let mut other = IndexRoutingTable::new_index("u2", "i2", 1, 0);
        let copies = other.shards.get_mut(&0).unwrap();
        copies[0] = copies[0].initialize("n2");
        fixture.routing.indices.insert("i2".to_string(), other);

        let deciders = Deciders::default();
        let replica = fixture.replica();
        assert!(matches!(
            deciders.can_allocate(&replica, &fixture.nodes["n2"], &fixture.ctx()),
            Decision::Throttle(_)
        ));
        assert!(deciders
            .can_allocate(&replica, &fixture.nodes["n3"], &fixture.ctx())
            .is_yes());
    }
}
