//! Two-phase cluster-state publication.
//!
//! Phase 1 sends the new state (full, or a diff against the previous
//! version) to every node and collects acknowledgments. Once a quorum of
//! master-eligible nodes acked, phase 2 sends the commit and followers
//! apply. If the quorum is not reached within the publish timeout the
//! version is abandoned — no node ever applies it — and the caller decides
//! whether the master steps down.

use crate::error::{ClusterError, Result};
use crate::state::metadata::Metadata;
use crate::state::routing::RoutingTable;
use crate::state::service::ClusterService;
use crate::state::{ClusterBlocks, ClusterState, DiscoveryNodes};
use crate::transport::{send_typed, Transport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const PUBLISH_ACTION: &str = "internal:cluster/publish";
pub const COMMIT_ACTION: &str = "internal:cluster/commit";

/// Changed sections between two consecutive state versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStateDiff {
    pub cluster_name: String,
    pub from_version: u64,
    pub to_version: u64,
    pub nodes: Option<DiscoveryNodes>,
    pub metadata: Option<Metadata>,
    pub routing_table: Option<RoutingTable>,
    pub blocks: Option<ClusterBlocks>,
}

impl ClusterStateDiff {
    pub fn between(previous: &ClusterState, new: &ClusterState) -> ClusterStateDiff {
        ClusterStateDiff {
            cluster_name: new.cluster_name.clone(),
            from_version: previous.version,
            to_version: new.version,
            nodes: (previous.nodes != new.nodes).then(|| new.nodes.clone()),
            metadata: (previous.metadata != new.metadata).then(|| new.metadata.clone()),
            routing_table: (previous.routing_table != new.routing_table)
                .then(|| new.routing_table.clone()),
            blocks: (previous.blocks != new.blocks).then(|| new.blocks.clone()),
        }
    }

    /// Apply onto the receiver's current state; `None` when the receiver
    /// does not hold the version this diff builds on.
    pub fn apply(&self, base: &ClusterState) -> Option<ClusterState> {
        if base.version != self.from_version || base.cluster_name != self.cluster_name {
            return None;
        }
        Some(ClusterState {
            cluster_name: base.cluster_name.clone(),
            version: self.to_version,
            nodes: self.nodes.clone().unwrap_or_else(|| base.nodes.clone()),
            metadata: self
                .metadata
                .clone()
                .unwrap_or_else(|| base.metadata.clone()),
            routing_table: self
                .routing_table
                .clone()
                .unwrap_or_else(|| base.routing_table.clone()),
            blocks: self.blocks.clone().unwrap_or_else(|| base.blocks.clone()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub to_version: u64,
    /// Full state (bincode), when the receiver cannot take a diff.
    pub full: Option<Vec<u8>>,
    pub diff: Option<ClusterStateDiff>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub acknowledged: bool,
    /// The receiver could not apply the diff and wants a full state.
    pub needs_full: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {}

#[derive(Debug, Clone)]
pub struct PublicationConfig {
    pub publish_timeout_ms: u64,
    pub minimum_master_nodes: usize,
}

/// Master side of publication.
pub struct PublicationService {
    transport: Arc<dyn Transport>,
    local_node_id: String,
    config: PublicationConfig,
    /// Last version each node acknowledged, to decide diff vs full.
    last_acked: Mutex<HashMap<String, u64>>,
}

impl PublicationService {
    pub fn new(
        transport: Arc<dyn Transport>,
        local_node_id: String,
        config: PublicationConfig,
    ) -> Arc<PublicationService> {
        Arc::new(PublicationService {
            transport,
            local_node_id,
            config,
            last_acked: Mutex::new(HashMap::new()),
        })
    }

    /// Install the receive-side handlers on a node: stage on publish, apply
    /// on commit.
    pub fn register_receiver(cluster: Arc<ClusterService>, transport: &dyn Transport) {
        let pending: Arc<Mutex<Option<Arc<ClusterState>>>> = Arc::new(Mutex::new(None));

        let publish_cluster = Arc::clone(&cluster);
        let publish_pending = Arc::clone(&pending);
        transport.register_handler(
            PUBLISH_ACTION,
            crate::transport::typed_handler(move |request: PublishRequest| {
                let cluster = Arc::clone(&publish_cluster);
                let pending = Arc::clone(&publish_pending);
                async move {
                    let current = cluster.state();
                    if request.to_version <= current.version {
                        // Already there (or ahead): nothing to stage.
                        return Ok(PublishResponse {
                            acknowledged: true,
                            needs_full: false,
                        });
                    }
                    let state = if let Some(full) = request.full {
                        let state: ClusterState = bincode::deserialize(&full)?;
                        Some(state)
                    } else if let Some(diff) = request.diff {
                        diff.apply(&current)
                    } else {
                        None
                    };
                    match state {
                        Some(state) => {
                            *pending.lock() = Some(Arc::new(state));
                            Ok(PublishResponse {
                                acknowledged: true,
                                needs_full: false,
                            })
                        }
                        None => Ok(PublishResponse {
                            acknowledged: false,
                            needs_full: true,
                        }),
                    }
                }
            }),
        );

        let commit_cluster = cluster;
        let commit_pending = pending;
        transport.register_handler(
            COMMIT_ACTION,
            crate::transport::typed_handler(move |request: CommitRequest| {
                let cluster = Arc::clone(&commit_cluster);
                let pending = Arc::clone(&commit_pending);
                async move {
                    let staged = {
                        let mut pending = pending.lock();
                        match pending.as_ref() {
                            Some(state) if state.version == request.version => pending.take(),
                            _ => None,
                        }
                    };
                    if let Some(state) = staged {
                        cluster.apply_committed(state)?;
                    }
                    Ok(CommitResponse {})
                }
            }),
        );
    }

    /// Publish a new state; resolves once committed by a quorum of
    /// master-eligible nodes.
    pub async fn publish(
        &self,
        new_state: Arc<ClusterState>,
        previous: Arc<ClusterState>,
    ) -> Result<()> {
        let timeout = Duration::from_millis(self.config.publish_timeout_ms);
        let diff = ClusterStateDiff::between(&previous, &new_state);
        let full_bytes = bincode::serialize(&*new_state)?;

        let targets: Vec<(String, String, bool)> = new_state
            .nodes
            .nodes
            .values()
            .filter(|n| n.id != self.local_node_id)
            .map(|n| (n.id.clone(), n.address.clone(), n.roles.master_eligible))
            .collect();

        let sends = targets.iter().map(|(node_id, address, eligible)| {
            let use_diff =
                self.last_acked.lock().get(node_id).copied() == Some(previous.version);
            let request = PublishRequest {
                to_version: new_state.version,
                full: (!use_diff).then(|| full_bytes.clone()),
                diff: use_diff.then(|| diff.clone()),
            };
            let full_fallback = PublishRequest {
                to_version: new_state.version,
                full: Some(full_bytes.clone()),
                diff: None,
            };
            async move {
                let mut response: Result<PublishResponse> = send_typed(
                    self.transport.as_ref(),
                    address,
                    PUBLISH_ACTION,
                    &request,
                    timeout,
                )
                .await;
                if matches!(&response, Ok(r) if r.needs_full) {
                    debug!(node = %node_id, "diff rejected, resending full state");
                    response = send_typed(
                        self.transport.as_ref(),
                        address,
                        PUBLISH_ACTION,
                        &full_fallback,
                        timeout,
                    )
                    .await;
                }
                let acked = matches!(&response, Ok(r) if r.acknowledged);
                if let Err(err) = &response {
                    debug!(node = %node_id, error = %err, "publish send failed");
                }
                (node_id.clone(), address.clone(), *eligible, acked)
            }
        });
        let results = futures::future::join_all(sends).await;

        // The master implicitly acks its own publication.
        let local_eligible = new_state
            .nodes
            .get(&self.local_node_id)
            .map(|n| n.roles.master_eligible)
            .unwrap_or(true);
        let mut eligible_acks = usize::from(local_eligible);
        for (_, _, eligible, acked) in &results {
            if *acked && *eligible {
                eligible_acks += 1;
            }
        }
        if eligible_acks < self.config.minimum_master_nodes {
            warn!(
                version = new_state.version,
                eligible_acks,
                required = self.config.minimum_master_nodes,
                "publication failed to reach quorum"
            );
            return Err(ClusterError::Timeout(format!(
                "publication of version [{}] acked by [{}] master-eligible nodes, need [{}]",
                new_state.version, eligible_acks, self.config.minimum_master_nodes
            )));
        }

        // Phase 2: commit on everyone that staged the state.
        let commit = CommitRequest {
            version: new_state.version,
        };
        let commits = results
            .iter()
            .filter(|(_, _, _, acked)| *acked)
            .map(|(node_id, address, _, _)| {
                let commit = commit.clone();
                async move {
                    let result: Result<CommitResponse> = send_typed(
                        self.transport.as_ref(),
                        address,
                        COMMIT_ACTION,
                        &commit,
                        timeout,
                    )
                    .await;
                    if let Err(err) = result {
                        // The node will catch up from a later publication.
                        debug!(node = %node_id, error = %err, "commit send failed");
                        false
                    } else {
                        true
                    }
                }
            });
        let committed = futures::future::join_all(commits).await;

        let mut last_acked = self.last_acked.lock();
        for ((node_id, _, _, acked), committed) in results.iter().zip(committed) {
            if *acked && committed {
                last_acked.insert(node_id.clone(), new_state.version);
            } else {
                last_acked.remove(node_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ClusterBlock, DiscoveryNode, NodeRoles};
    use crate::transport::local::{LocalNetwork, LocalTransport};

    fn node(id: &str) -> DiscoveryNode {
        DiscoveryNode {
            id: id.to_string(),
            name: id.to_string(),
            address: id.to_string(),
            roles: NodeRoles::master_data(),
            attributes: Default::default(),
        }
    }

    fn state_with_nodes(ids: &[&str], master: &str, version_bumps: u64) -> Arc<ClusterState> {
        let mut nodes = DiscoveryNodes::default();
        for id in ids {
            nodes.nodes.insert(id.to_string(), node(id));
        }
        nodes.master_node_id = Some(master.to_string());
        let mut state = ClusterState::initial("pub-test")
            .builder()
            .nodes(nodes)
            .blocks(ClusterBlocks::default())
            .build();
        for _ in 1..version_bumps {
            state = state.builder().build();
        }
        Arc::new(state)
    }

    #[test]
    fn test_diff_captures_changed_sections_only() {
        let previous = ClusterState::initial("t");
        let new = previous
            .builder()
            .blocks(ClusterBlocks::default())
            .build();
        let diff = ClusterStateDiff::between(&previous, &new);
        assert!(diff.blocks.is_some());
        assert!(diff.nodes.is_none());
        assert!(diff.metadata.is_none());
        assert!(diff.routing_table.is_none());
    }

    #[test]
    fn test_diff_applies_only_on_matching_base() {
        let previous = ClusterState::initial("t");
        let new = previous
            .builder()
            .blocks(ClusterBlocks::default().with_block(ClusterBlock::no_master_all()))
            .build();
        let diff = ClusterStateDiff::between(&previous, &new);

        let applied = diff.apply(&previous).unwrap();
        assert_eq!(applied.version, new.version);
        assert_eq!(applied.blocks, new.blocks);

        // Wrong base version: refuse.
        let wrong_base = new.builder().build();
        assert!(diff.apply(&wrong_base).is_none());
    }

    #[tokio::test]
    async fn test_publish_commits_on_followers() {
        let network = LocalNetwork::new();
        let master_transport = LocalTransport::new(&network, "m");
        let follower_transport = LocalTransport::new(&network, "f");

        let follower_cluster = ClusterService::new("pub-test", "f");
        follower_cluster.start();
        PublicationService::register_receiver(
            Arc::clone(&follower_cluster),
            follower_transport.as_ref(),
        );

        let publication = PublicationService::new(
            master_transport.clone() as Arc<dyn Transport>,
            "m".to_string(),
            PublicationConfig {
                publish_timeout_ms: 1000,
                minimum_master_nodes: 1,
            },
        );

        let previous = Arc::new(ClusterState::initial("pub-test"));
        let new_state = state_with_nodes(&["m", "f"], "m", 1);
        publication
            .publish(Arc::clone(&new_state), previous)
            .await
            .unwrap();

        assert_eq!(follower_cluster.state().version, new_state.version);
        assert_eq!(follower_cluster.state().master_node_id(), Some("m"));
    }

    #[tokio::test]
    async fn test_publish_fails_without_quorum() {
        let network = LocalNetwork::new();
        let master_transport = LocalTransport::new(&network, "m");
        // Two master-eligible peers exist in the state but are unreachable.
        let publication = PublicationService::new(
            master_transport as Arc<dyn Transport>,
            "m".to_string(),
            PublicationConfig {
                publish_timeout_ms: 200,
                minimum_master_nodes: 2,
            },
        );
        let previous = Arc::new(ClusterState::initial("pub-test"));
        let new_state = state_with_nodes(&["m", "x", "y"], "m", 1);
        let err = publication.publish(new_state, previous).await.unwrap_err();
        assert_eq!(err.error_type(), "timeout");
    }

    #[tokio::test]
    async fn test_second_publish_uses_diff_and_stale_node_gets_full() {
        let network = LocalNetwork::new();
        let master_transport = LocalTransport::new(&network, "m");
        let follower_transport = LocalTransport::new(&network, "f");
        let follower_cluster = ClusterService::new("pub-test", "f");
        follower_cluster.start();
        PublicationService::register_receiver(
            Arc::clone(&follower_cluster),
            follower_transport.as_ref(),
        );

        let publication = PublicationService::new(
            master_transport as Arc<dyn Transport>,
            "m".to_string(),
            PublicationConfig {
                publish_timeout_ms: 1000,
                minimum_master_nodes: 1,
            },
        );

        let v0 = Arc::new(ClusterState::initial("pub-test"));
        let v1 = state_with_nodes(&["m", "f"], "m", 1);
        publication.publish(Arc::clone(&v1), v0).await.unwrap();
        assert_eq!(follower_cluster.state().version, 1);

        // Next version goes out as a diff (the service acked v1 for "f").
        let v2 = Arc::new(v1.builder().build());
        publication
            .publish(Arc::clone(&v2), Arc::clone(&v1))
            .await
            .unwrap();
        assert_eq!(follower_cluster.state().version, 2);

        // Force staleness: pretend the follower acked v3, so the next
        // publish sends a diff built on a version it never saw. The
        // needs-full answer must trigger the full-state fallback.
        let v3 = Arc::new(v2.builder().build());
        publication.last_acked.lock().insert("f".to_string(), 3);
        let v4 = Arc::new(v3.builder().build());
        publication.publish(Arc::clone(&v4), v3).await.unwrap();
        assert_eq!(
            follower_cluster.state().version,
            4,
            "follower recovered via full-state fallback"
        );
    }
}
