//! Master election.
//!
//! A candidate becomes master iff it holds the highest (cluster-state
//! version, node id) among a quorum of master-eligible nodes. An already
//! active master reported by any peer wins outright — elections never
//! depose a live master. Below quorum, the node enters the no-master state
//! and blocks per its `no_master_block` setting.

use crate::state::DiscoveryNode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What one node answers to a discovery ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub node: DiscoveryNode,
    pub cluster_name: String,
    /// The master this node currently follows, if any.
    pub master_node_id: Option<String>,
    pub cluster_state_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// The node id that should be master.
    Elected(String),
    /// Fewer than `required` master-eligible nodes answered.
    NoQuorum { found: usize, required: usize },
}

/// Decide the master from ping responses (the local node's own response
/// included by the caller).
pub fn elect(responses: &[PingResponse], minimum_master_nodes: usize) -> ElectionOutcome {
    // Dedupe by node id; keep the freshest state version per node.
    let mut candidates: BTreeMap<String, &PingResponse> = BTreeMap::new();
    for response in responses {
        if !response.node.roles.master_eligible {
            continue;
        }
        let entry = candidates.entry(response.node.id.clone()).or_insert(response);
        if response.cluster_state_version > entry.cluster_state_version {
            *entry = response;
        }
    }

    if candidates.len() < minimum_master_nodes {
        return ElectionOutcome::NoQuorum {
            found: candidates.len(),
            required: minimum_master_nodes,
        };
    }

    // An active master someone already follows wins, provided it is still
    // in the candidate pool.
    let mut active_masters: Vec<&str> = responses
        .iter()
        .filter_map(|r| r.master_node_id.as_deref())
        .filter(|id| candidates.contains_key(*id))
        .collect();
    if !active_masters.is_empty() {
        active_masters.sort_unstable();
        active_masters.dedup();
        let best = active_masters
            .iter()
            .max_by_key(|id| {
                let candidate = candidates[*id];
                (candidate.cluster_state_version, candidate.node.id.clone())
            })
            .unwrap();
        return ElectionOutcome::Elected(best.to_string());
    }

    let winner = candidates
        .values()
        .max_by_key(|c| (c.cluster_state_version, c.node.id.clone()))
        .unwrap();
    ElectionOutcome::Elected(winner.node.id.clone())
}

/// The quorum floor: a legal `minimum_master_nodes` for a cluster of
/// `master_eligible_count` nodes.
pub fn quorum_floor(master_eligible_count: usize) -> usize {
    master_eligible_count / 2 + 1
}
