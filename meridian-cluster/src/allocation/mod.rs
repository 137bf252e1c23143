//! The allocation engine: decides which shard copy lives on which node.
//!
//! Runs only on the master, inside cluster-state update tasks. Every entry
//! point takes the current state and returns a new routing table (or `None`
//! when nothing changes); the caller wraps it in the next state version.
//!
//! Ordering invariant: unassigned primaries are placed before replicas, and
//! a replica is never placed while its primary is not STARTED.

pub mod balancer;
pub mod deciders;

use crate::state::routing::{
    RecoverySource, RoutingTable, ShardRouting, ShardRoutingState,
};
use crate::state::ClusterState;
use balancer::{Balancer, BalancerSettings};
use deciders::{AllocationContext, AllocationSettings, Deciders, Decision, DiskUsage};
use meridian::ShardId;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub struct AllocationService {
    deciders: Deciders,
    pub settings: AllocationSettings,
    pub balancer_settings: BalancerSettings,
}

impl Default for AllocationService {
    fn default() -> Self {
        Self {
            deciders: Deciders::default(),
            settings: AllocationSettings::default(),
            balancer_settings: BalancerSettings::default(),
        }
    }
}

impl AllocationService {
    pub fn with_settings(
        settings: AllocationSettings,
        balancer_settings: BalancerSettings,
    ) -> AllocationService {
        AllocationService {
            deciders: Deciders::default(),
            settings,
            balancer_settings,
        }
    }

    /// Assign unassigned copies and propose rebalancing moves. Returns the
    /// new routing table, or `None` if nothing changed.
    pub fn reroute(
        &self,
        state: &ClusterState,
        disk_usage: &HashMap<String, DiskUsage>,
    ) -> Option<RoutingTable> {
        let mut routing = state.routing_table.clone();
        let mut changed = false;

        changed |= self.allocate_unassigned(state, &mut routing, disk_usage, true);
        changed |= self.allocate_unassigned(state, &mut routing, disk_usage, false);
        changed |= self.drain_and_rebalance(state, &mut routing, disk_usage);

        changed.then_some(routing)
    }

    /// A node reported a copy as started.
    pub fn shard_started(
        &self,
        state: &ClusterState,
        shard_id: &ShardId,
        node_id: &str,
    ) -> Option<RoutingTable> {
        let mut routing = state.routing_table.clone();
        let mut changed = false;
        for table in routing.indices.values_mut() {
            if table.index_uuid != shard_id.index_uuid {
                continue;
            }
            if let Some(copies) = table.shards.get_mut(&shard_id.shard) {
                for copy in copies.iter_mut() {
                    if copy.state == ShardRoutingState::Initializing && copy.on_node(node_id) {
                        *copy = copy.start();
                        changed = true;
                    } else if copy.state == ShardRoutingState::Relocating
                        && copy.relocating_node.as_deref() == Some(node_id)
                    {
                        // Relocation complete: the copy now lives on the
                        // target with a fresh allocation id.
                        *copy = copy.initialize(node_id).start();
                        changed = true;
                    }
                }
            }
        }
        if changed {
            info!(shard = %shard_id, node = node_id, "shard started");
        }
        changed.then_some(routing)
    }

    /// A copy failed (engine fault or replication failure): unassign it and
    /// promote a started replica if the primary is gone.
    pub fn shard_failed(
        &self,
        state: &ClusterState,
        shard_id: &ShardId,
        node_id: &str,
    ) -> Option<RoutingTable> {
        let mut routing = state.routing_table.clone();
        let changed = fail_copy(&mut routing, shard_id, node_id);
        if changed {
            warn!(shard = %shard_id, node = node_id, "shard failed");
        }
        changed.then_some(routing)
    }

    /// A node left the cluster: every copy it held fails.
    pub fn node_left(&self, state: &ClusterState, node_id: &str) -> Option<RoutingTable> {
        let mut routing = state.routing_table.clone();
        let affected: Vec<ShardId> = routing
            .all_shards()
            .filter(|r| r.on_node(node_id) || r.relocating_node.as_deref() == Some(node_id))
            .map(|r| r.shard_id.clone())
            .collect();
        let mut changed = false;
        for shard_id in affected {
            changed |= fail_copy(&mut routing, &shard_id, node_id);
        }
        changed.then_some(routing)
    }

    fn allocate_unassigned(
        &self,
        state: &ClusterState,
        routing: &mut RoutingTable,
        disk_usage: &HashMap<String, DiskUsage>,
        primaries: bool,
    ) -> bool {
        let mut changed = false;
        loop {
            // Re-snapshot each round so deciders see assignments made in
            // previous rounds.
            let candidate = routing
                .all_shards()
                .find(|r| {
                    r.state == ShardRoutingState::Unassigned
                        && r.primary == primaries
                        && (primaries || self.primary_started(routing, &r.shard_id))
                })
                .cloned();
            let Some(shard) = candidate else { break };

            let data_nodes: Vec<String> = state
                .nodes
                .data_nodes()
                .map(|n| n.id.clone())
                .collect();
            let mut allowed = Vec::new();
            {
                let ctx = AllocationContext {
                    routing,
                    nodes: &state.nodes.nodes,
                    disk_usage,
                    settings: &self.settings,
                };
                for node_id in &data_nodes {
                    let node = &state.nodes.nodes[node_id];
                    match self.deciders.can_allocate(&shard, node, &ctx) {
                        Decision::Yes => allowed.push(node_id.clone()),
                        Decision::Throttle(reason) => {
                            debug!(shard = %shard.shard_id, node = %node_id, %reason, "allocation throttled");
                        }
                        Decision::No(reason) => {
                            debug!(shard = %shard.shard_id, node = %node_id, %reason, "allocation denied");
                        }
                    }
                }
            }
            if allowed.is_empty() {
                // Stays unassigned; the next reroute retries.
                break;
            }
            let balancer = Balancer::new(routing, data_nodes, &self.balancer_settings);
            let Some(target) = balancer.pick_lightest(&shard, &allowed) else {
                break;
            };
            replace_copy(routing, &shard, shard.initialize(&target));
            debug!(shard = %shard.shard_id, node = %target, "allocated");
            changed = true;
        }
        changed
    }

    /// Move shards off nodes they may no longer remain on, then apply one
    /// balancing move per pass (further passes keep converging).
    fn drain_and_rebalance(
        &self,
        state: &ClusterState,
        routing: &mut RoutingTable,
        disk_usage: &HashMap<String, DiskUsage>,
    ) -> bool {
        let mut changed = false;

        let to_drain: Vec<ShardRouting> = {
            let ctx = AllocationContext {
                routing,
                nodes: &state.nodes.nodes,
                disk_usage,
                settings: &self.settings,
            };
            routing
                .all_shards()
                .filter(|r| r.state == ShardRoutingState::Started)
                .filter(|r| {
                    r.current_node
                        .as_ref()
                        .and_then(|id| state.nodes.nodes.get(id))
                        .map(|node| !self.deciders.can_remain(r, node, &ctx).is_yes())
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        for shard in to_drain {
            if let Some(target) = self.relocation_target(state, routing, disk_usage, &shard) {
                replace_copy(routing, &shard, shard.relocate(&target));
                info!(shard = %shard.shard_id, to = %target, "draining shard off node");
                changed = true;
            }
        }

        let data_nodes: Vec<String> = state.nodes.data_nodes().map(|n| n.id.clone()).collect();
        let proposal = {
            let balancer = Balancer::new(routing, data_nodes, &self.balancer_settings);
            balancer.propose_move()
        };
        if let Some((shard, target)) = proposal {
            let permitted = {
                let ctx = AllocationContext {
                    routing,
                    nodes: &state.nodes.nodes,
                    disk_usage,
                    settings: &self.settings,
                };
                state
                    .nodes
                    .nodes
                    .get(&target)
                    .map(|node| self.deciders.can_allocate(&shard, node, &ctx).is_yes())
                    .unwrap_or(false)
            };
            if permitted {
                replace_copy(routing, &shard, shard.relocate(&target));
                info!(shard = %shard.shard_id, to = %target, "rebalancing shard");
                changed = true;
            }
        }
        changed
    }

    fn relocation_target(
        &self,
        state: &ClusterState,
        routing: &RoutingTable,
        disk_usage: &HashMap<String, DiskUsage>,
        shard: &ShardRouting,
    ) -> Option<String> {
        let ctx = AllocationContext {
            routing,
            nodes: &state.nodes.nodes,
            disk_usage,
            settings: &self.settings,
        };
        let allowed: Vec<String> = state
            .nodes
            .data_nodes()
            .filter(|node| self.deciders.can_allocate(shard, node, &ctx).is_yes())
            .map(|n| n.id.clone())
            .collect();
        let data_nodes: Vec<String> = state.nodes.data_nodes().map(|n| n.id.clone()).collect();
        Balancer::new(routing, data_nodes, &self.balancer_settings).pick_lightest(shard, &allowed)
    }

    fn primary_started(&self, routing: &RoutingTable, shard_id: &ShardId) -> bool {
        routing
            .all_shards()
            .any(|r| r.shard_id == *shard_id && r.primary && r.state == ShardRoutingState::Started)
    }
}

/// Swap one copy for its updated version, matching by shard id, primary flag
/// and prior assignment.
fn replace_copy(routing: &mut RoutingTable, old: &ShardRouting, new: ShardRouting) {
    for table in routing.indices.values_mut() {
        if table.index_uuid != old.shard_id.index_uuid {
            continue;
        }
        if let Some(copies) = table.shards.get_mut(&old.shard_id.shard) {
            for copy in copies.iter_mut() {
                if copy == old {
                    *copy = new;
                    return;
                }
            }
        }
    }
}

fn fail_copy(routing: &mut RoutingTable, shard_id: &ShardId, node_id: &str) -> bool {
    let mut changed = false;
    for table in routing.indices.values_mut() {
        if table.index_uuid != shard_id.index_uuid {
            continue;
        }
        let Some(copies) = table.shards.get_mut(&shard_id.shard) else {
            continue;
        };
        let mut failed_primary = false;
        for copy in copies.iter_mut() {
            if copy.relocating_node.as_deref() == Some(node_id) {
                // Relocation target died: keep serving from the source.
                *copy = ShardRouting {
                    state: ShardRoutingState::Started,
                    relocating_node: None,
                    ..copy.clone()
                };
                changed = true;
            } else if copy.on_node(node_id) && copy.assigned() {
                if copy.primary {
                    failed_primary = true;
                }
                *copy = copy.fail();
                changed = true;
            }
        }
        if failed_primary {
            // Promote the first started replica; the failed primary slot
            // becomes an unassigned replica so the copy count is preserved.
            if let Some(replica) = copies
                .iter_mut()
                .find(|c| !c.primary && c.state == ShardRoutingState::Started)
            {
                *replica = replica.promote();
                if let Some(former) = copies
                    .iter_mut()
                    .find(|c| c.primary && c.state == ShardRoutingState::Unassigned)
                {
                    former.primary = false;
                    former.recovery_source = RecoverySource::Peer;
                }
                info!(shard = %shard_id, "promoted replica to primary");
            }
        }
    }
    changed
}
