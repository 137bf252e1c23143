//! Master-side cluster management: reacting to shard lifecycle reports and
//! membership changes by producing new cluster states through the
//! allocation engine.
//!
//! Every entry point runs as an update task on the single-threaded state
//! executor; each applies its own change and then a follow-up reroute in the
//! same task, so e.g. a replica can be assigned in the very version that
//! starts its primary.

use crate::allocation::deciders::DiskUsage;
use crate::allocation::AllocationService;
use crate::error::{ClusterError, Result};
use crate::state::routing::{
    IndexRoutingTable, RecoverySource, RoutingTable, ShardRouting, ShardRoutingState,
};
use crate::state::service::ClusterService;
use crate::state::{ClusterState, DiscoveryNode};
use crate::transport::Transport;
use crate::discovery::MembershipChange;
use meridian::threadpool::{PoolKind, ThreadPools};
use meridian::ShardId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SHARD_STARTED_ACTION: &str = "internal:cluster/shard_started";
pub const SHARD_FAILED_ACTION: &str = "internal:cluster/shard_failed";
pub const CREATE_INDEX_ACTION: &str = "indices:admin/create";
pub const DELETE_INDEX_ACTION: &str = "indices:admin/delete";
pub const UPDATE_REPLICAS_ACTION: &str = "indices:admin/update_replicas";
pub const UPDATE_ALIASES_ACTION: &str = "indices:admin/aliases";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStartedRequest {
    pub shard_id: ShardId,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardFailedRequest {
    pub shard_id: ShardId,
    pub node_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterAck {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndexRequest {
    pub name: String,
    pub settings: meridian::IndexSettings,
    pub mapping: meridian::IndexMapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteIndexRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateReplicasRequest {
    pub name: String,
    pub replicas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAliasesRequest {
    pub name: String,
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

pub struct MasterService {
    cluster: Arc<ClusterService>,
    allocation: Arc<AllocationService>,
    pools: Arc<ThreadPools>,
    /// Disk usage per node id, fed by node stats; empty means unconstrained.
    disk_usage: RwLock<HashMap<String, DiskUsage>>,
    running: AtomicBool,
}

impl MasterService {
    pub fn new(
        cluster: Arc<ClusterService>,
        allocation: Arc<AllocationService>,
        pools: Arc<ThreadPools>,
    ) -> Arc<MasterService> {
        Arc::new(MasterService {
            cluster,
            allocation,
            pools,
            disk_usage: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn set_disk_usage(&self, node_id: &str, usage: DiskUsage) {
        self.disk_usage.write().insert(node_id.to_string(), usage);
    }

    pub fn start(self: &Arc<Self>, transport: &dyn Transport) {
        self.running.store(true, Ordering::SeqCst);
        self.register_handlers(transport);
        self.register_admin_handlers(transport);

        // Periodic reroute picks up throttled and retryable allocations;
        // it runs on the management pool like other housekeeping.
        let master = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            while master.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !master.cluster.is_master() {
                    continue;
                }
                let worker = Arc::clone(&master);
                let outcome = match master
                    .pools
                    .execute(PoolKind::Management, async move {
                        worker.reroute("periodic").await
                    }) {
                    Ok(handle) => handle.await.unwrap_or_else(|e| {
                        Err(ClusterError::Internal(format!(
                            "reroute task aborted: {}",
                            e
                        )))
                    }),
                    Err(err) => Err(ClusterError::from(err)),
                };
                if let Err(err) = outcome {
                    debug!(error = %err, "periodic reroute failed");
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// The membership handler plugged into discovery: node joins and
    /// departures, each followed by a reroute.
    pub fn membership_handler(self: &Arc<Self>) -> crate::discovery::MembershipHandler {
        let allocation = Arc::clone(&self.allocation);
        let disk = Arc::clone(self);
        Arc::new(move |current: &ClusterState, change: MembershipChange| {
            let disk_usage = disk.disk_usage.read().clone();
            match change {
                MembershipChange::Joined(node) => {
                    if current.nodes.contains(&node.id)
                        && current.nodes.get(&node.id) == Some(&node)
                    {
                        // Re-join of a known node: no state change needed.
                        return Ok(None);
                    }
                    info!(node = %node.id, "node joined");
                    let mut nodes = current.nodes.clone();
                    nodes.nodes.insert(node.id.clone(), node);
                    let mut builder = current.builder().nodes(nodes.clone());
                    let interim = ClusterState {
                        nodes,
                        ..current.clone()
                    };
                    if let Some(routing) = allocation.reroute(&interim, &disk_usage) {
                        builder = builder.routing_table(routing);
                    }
                    Ok(Some(builder.build()))
                }
                MembershipChange::Left(node_id) => {
                    if !current.nodes.contains(&node_id) {
                        return Ok(None);
                    }
                    warn!(node = %node_id, "node left");
                    let mut nodes = current.nodes.clone();
                    nodes.nodes.remove(&node_id);
                    if nodes.master_node_id.as_deref() == Some(node_id.as_str()) {
                        nodes.master_node_id = None;
                    }
                    let mut routing = allocation
                        .node_left(current, &node_id)
                        .unwrap_or_else(|| current.routing_table.clone());
                    // Reassign what just went unassigned where possible.
                    let interim = ClusterState {
                        nodes: nodes.clone(),
                        routing_table: routing.clone(),
                        ..current.clone()
                    };
                    if let Some(rerouted) = allocation.reroute(&interim, &disk_usage) {
                        routing = rerouted;
                    }
                    Ok(Some(
                        current
                            .builder()
                            .nodes(nodes)
                            .routing_table(routing)
                            .build(),
                    ))
                }
            }
        })
    }

    /// Submit a reroute update task.
    pub async fn reroute(&self, source: &str) -> Result<()> {
        let allocation = Arc::clone(&self.allocation);
        let disk_usage = self.disk_usage.read().clone();
        self.cluster
            .update(
                format!("reroute[{}]", source),
                Box::new(move |current| {
                    Ok(allocation
                        .reroute(current, &disk_usage)
                        .map(|routing| current.builder().routing_table(routing).build()))
                }),
            )
            .await?;
        Ok(())
    }

    fn register_handlers(self: &Arc<Self>, transport: &dyn Transport) {
        let master = Arc::clone(self);
        transport.register_handler(
            SHARD_STARTED_ACTION,
            crate::transport::typed_handler(move |request: ShardStartedRequest| {
                let master = Arc::clone(&master);
                async move {
                    master.ensure_master()?;
                    let allocation = Arc::clone(&master.allocation);
                    let disk_usage = master.disk_usage.read().clone();
                    master
                        .cluster
                        .update(
                            format!("shard-started{}", request.shard_id),
                            Box::new(move |current| {
                                let Some(routing) = allocation.shard_started(
                                    current,
                                    &request.shard_id,
                                    &request.node_id,
                                ) else {
                                    return Ok(None);
                                };
                                Ok(Some(apply_with_reroute(
                                    current, routing, &allocation, &disk_usage,
                                )))
                            }),
                        )
                        .await?;
                    Ok(MasterAck {})
                }
            }),
        );

        let master = Arc::clone(self);
        transport.register_handler(
            SHARD_FAILED_ACTION,
            crate::transport::typed_handler(move |request: ShardFailedRequest| {
                let master = Arc::clone(&master);
                async move {
                    master.ensure_master()?;
                    warn!(
                        shard = %request.shard_id,
                        node = %request.node_id,
                        reason = %request.reason,
                        "shard failure reported"
                    );
                    let allocation = Arc::clone(&master.allocation);
                    let disk_usage = master.disk_usage.read().clone();
                    master
                        .cluster
                        .update(
                            format!("shard-failed{}", request.shard_id),
                            Box::new(move |current| {
                                let Some(routing) = allocation.shard_failed(
                                    current,
                                    &request.shard_id,
                                    &request.node_id,
                                ) else {
                                    return Ok(None);
                                };
                                Ok(Some(apply_with_reroute(
                                    current, routing, &allocation, &disk_usage,
                                )))
                            }),
                        )
                        .await?;
                    Ok(MasterAck {})
                }
            }),
        );
    }

    fn register_admin_handlers(self: &Arc<Self>, transport: &dyn Transport) {
        let master = Arc::clone(self);
        transport.register_handler(
            CREATE_INDEX_ACTION,
            crate::transport::typed_handler(move |request: CreateIndexRequest| {
                let master = Arc::clone(&master);
                async move {
                    master.ensure_master()?;
                    master.cluster.check_block(crate::state::ClusterBlockLevel::Metadata)?;
                    request.settings.validate().map_err(ClusterError::from)?;
                    request.mapping.validate().map_err(ClusterError::from)?;

                    let allocation = Arc::clone(&master.allocation);
                    let disk_usage = master.disk_usage.read().clone();
                    master
                        .cluster
                        .update(
                            format!("create-index[{}]", request.name),
                            Box::new(move |current| {
                                if current.metadata.has_index(&request.name) {
                                    return Err(ClusterError::Validation(format!(
                                        "index [{}] already exists",
                                        request.name
                                    )));
                                }
                                let metadata_index = crate::state::metadata::IndexMetadata::new(
                                    request.name.clone(),
                                    request.settings.clone(),
                                    request.mapping.clone(),
                                );
                                let mut metadata = current.metadata.clone();
                                let mut routing = current.routing_table.clone();
                                routing.indices.insert(
                                    request.name.clone(),
                                    crate::state::routing::IndexRoutingTable::new_index(
                                        &metadata_index.uuid,
                                        &request.name,
                                        metadata_index.number_of_shards(),
                                        metadata_index.number_of_replicas(),
                                    ),
                                );
                                metadata
                                    .indices
                                    .insert(request.name.clone(), metadata_index);

                                let interim = ClusterState {
                                    metadata: metadata.clone(),
                                    routing_table: routing.clone(),
                                    ..current.clone()
                                };
                                let routing = allocation
                                    .reroute(&interim, &disk_usage)
                                    .unwrap_or(routing);
                                Ok(Some(
                                    current
                                        .builder()
                                        .metadata(metadata)
                                        .routing_table(routing)
                                        .build(),
                                ))
                            }),
                        )
                        .await?;
                    Ok(MasterAck {})
                }
            }),
        );

        let master = Arc::clone(self);
        transport.register_handler(
            DELETE_INDEX_ACTION,
            crate::transport::typed_handler(move |request: DeleteIndexRequest| {
                let master = Arc::clone(&master);
                async move {
                    master.ensure_master()?;
                    master.cluster.check_block(crate::state::ClusterBlockLevel::Metadata)?;
                    master
                        .cluster
                        .update(
                            format!("delete-index[{}]", request.name),
                            Box::new(move |current| {
                                if !current.metadata.has_index(&request.name) {
                                    return Err(ClusterError::IndexNotFound(request.name.clone()));
                                }
                                let mut metadata = current.metadata.clone();
                                let mut routing = current.routing_table.clone();
                                metadata.indices.remove(&request.name);
                                routing.indices.remove(&request.name);
                                Ok(Some(
                                    current
                                        .builder()
                                        .metadata(metadata)
                                        .routing_table(routing)
                                        .build(),
                                ))
                            }),
                        )
                        .await?;
                    Ok(MasterAck {})
                }
            }),
        );

        let master = Arc::clone(self);
        transport.register_handler(
            UPDATE_ALIASES_ACTION,
            crate::transport::typed_handler(move |request: UpdateAliasesRequest| {
                let master = Arc::clone(&master);
                async move {
                    master.ensure_master()?;
                    master.cluster.check_block(crate::state::ClusterBlockLevel::Metadata)?;
                    master
                        .cluster
                        .update(
                            format!("update-aliases[{}]", request.name),
                            Box::new(move |current| {
                                let Some(index) = current.metadata.index(&request.name) else {
                                    return Err(ClusterError::IndexNotFound(request.name.clone()));
                                };
                                // An alias may not shadow a concrete index name.
                                for alias in &request.add {
                                    if current.metadata.has_index(alias) {
                                        return Err(ClusterError::Validation(format!(
                                            "alias [{}] collides with an index name",
                                            alias
                                        )));
                                    }
                                }
                                let mut index = index.clone();
                                for alias in &request.add {
                                    index.aliases.insert(alias.clone());
                                }
                                for alias in &request.remove {
                                    index.aliases.remove(alias);
                                }
                                let mut metadata = current.metadata.clone();
                                metadata.indices.insert(request.name.clone(), index);
                                Ok(Some(current.builder().metadata(metadata).build()))
                            }),
                        )
                        .await?;
                    Ok(MasterAck {})
                }
            }),
        );

        let master = Arc::clone(self);
        transport.register_handler(
            UPDATE_REPLICAS_ACTION,
            crate::transport::typed_handler(move |request: UpdateReplicasRequest| {
                let master = Arc::clone(&master);
                async move {
                    master.ensure_master()?;
                    master.cluster.check_block(crate::state::ClusterBlockLevel::Metadata)?;
                    let allocation = Arc::clone(&master.allocation);
                    let disk_usage = master.disk_usage.read().clone();
                    master
                        .cluster
                        .update(
                            format!("update-replicas[{}]", request.name),
                            Box::new(move |current| {
                                let Some(index) = current.metadata.index(&request.name) else {
                                    return Err(ClusterError::IndexNotFound(request.name.clone()));
                                };
                                let mut index = index.clone();
                                // The primary count is immutable; only the
                                // replica count moves.
                                index.settings.number_of_replicas = request.replicas;

                                let mut routing = current.routing_table.clone();
                                if let Some(table) = routing.indices.get_mut(&request.name) {
                                    resize_replicas(table, request.replicas);
                                }
                                let mut metadata = current.metadata.clone();
                                metadata.indices.insert(request.name.clone(), index);

                                let interim = ClusterState {
                                    metadata: metadata.clone(),
                                    routing_table: routing.clone(),
                                    ..current.clone()
                                };
                                let routing = allocation
                                    .reroute(&interim, &disk_usage)
                                    .unwrap_or(routing);
                                Ok(Some(
                                    current
                                        .builder()
                                        .metadata(metadata)
                                        .routing_table(routing)
                                        .build(),
                                ))
                            }),
                        )
                        .await?;
                    Ok(MasterAck {})
                }
            }),
        );
    }

    fn ensure_master(&self) -> Result<()> {
        if !self.cluster.is_master() {
            return Err(ClusterError::NotMaster(
                "shard lifecycle reports go to the master".to_string(),
            ));
        }
        Ok(())
    }
}

/// Grow or shrink the replica slots of every shard in an index table.
fn resize_replicas(table: &mut IndexRoutingTable, replicas: u32) {
    for copies in table.shards.values_mut() {
        let current = copies.iter().filter(|c| !c.primary).count();
        let desired = replicas as usize;
        if current < desired {
            let primary = copies
                .iter()
                .find(|c| c.primary)
                .cloned()
                .expect("every shard has a primary slot");
            for _ in current..desired {
                copies.push(ShardRouting::unassigned(
                    primary.shard_id.clone(),
                    primary.index_name.clone(),
                    false,
                    RecoverySource::Peer,
                ));
            }
        } else if current > desired {
            // Drop unassigned replica slots first, then assigned ones.
            let mut surplus = current - desired;
            copies.retain(|c| {
                if surplus > 0 && !c.primary && c.state == ShardRoutingState::Unassigned {
                    surplus -= 1;
                    false
                } else {
                    true
                }
            });
            copies.retain(|c| {
                if surplus > 0 && !c.primary {
                    surplus -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }
}

/// Fold a routing change and its follow-up reroute into one new state.
fn apply_with_reroute(
    current: &ClusterState,
    routing: RoutingTable,
    allocation: &AllocationService,
    disk_usage: &HashMap<String, DiskUsage>,
) -> ClusterState {
    let interim = ClusterState {
        routing_table: routing.clone(),
        ..current.clone()
    };
    let final_routing = allocation.reroute(&interim, disk_usage).unwrap_or(routing);
    current.builder().routing_table(final_routing).build()
}
