//! The node: explicit wiring of every service, plus the client-facing API.
//!
//! Construction is leaves-first — transport, then the cluster-state service,
//! allocation, recovery, indices, replication, coordination, and finally
//! discovery — with references passed through constructors. No global state:
//! everything a node owns hangs off this struct.

use crate::allocation::AllocationService;
use crate::config::{load_or_create_node_id, ClusterConfig};
use crate::coordinate::{SearchCoordinator, SearchResponse};
use crate::discovery::Discovery;
use crate::error::{ClusterError, Result};
use crate::health::{cluster_health, ClusterHealth};
use crate::indices::{
    IndicesService, ShardActionRequest, ShardActionResponse, ShardStats, SHARD_FLUSH_ACTION,
    SHARD_REFRESH_ACTION, SHARD_STATS_ACTION,
};
use crate::master::{
    CreateIndexRequest, DeleteIndexRequest, MasterAck, MasterService, UpdateAliasesRequest,
    UpdateReplicasRequest, CREATE_INDEX_ACTION, DELETE_INDEX_ACTION, UPDATE_ALIASES_ACTION,
    UPDATE_REPLICAS_ACTION,
};
use crate::recovery::{RecoveryProgress, RecoveryService};
use crate::replication::{
    Consistency, ReplicationService, WriteOp, WriteResult,
};
use crate::routing::Preference;
use crate::state::service::ClusterService;
use crate::state::{ClusterState, DiscoveryNode, NodeRoles};
use crate::transport::tcp::{TcpTransport, TcpTransportConfig};
use crate::transport::{send_typed, Transport};
use meridian::breaker::{BreakerLimits, CircuitBreakerService};
use meridian::search::request::SearchRequest;
use meridian::threadpool::ThreadPools;
use meridian::{
    DeleteResult, Document, GetResult, IndexMapping, IndexResult, IndexSettings, ShardId,
    VersionType,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Operator surface: health answered as a generic self-describing wire
/// value, so any tooling speaking the payload encoding can read it without
/// this build's type definitions.
pub const CLUSTER_HEALTH_ACTION: &str = "cluster:monitor/health";

pub struct Node {
    pub config: ClusterConfig,
    local_node: DiscoveryNode,
    transport: Arc<dyn Transport>,
    cluster: Arc<ClusterService>,
    #[allow(dead_code)]
    allocation: Arc<AllocationService>,
    master: Arc<MasterService>,
    discovery: Arc<Discovery>,
    indices: Arc<IndicesService>,
    replication: Arc<ReplicationService>,
    coordinator: Arc<SearchCoordinator>,
    pools: Arc<ThreadPools>,
    breakers: Arc<CircuitBreakerService>,
}

impl Node {
    /// Start a node on the real TCP transport.
    pub async fn start(config: ClusterConfig) -> Result<Arc<Node>> {
        config.validate()?;
        let node_id = load_or_create_node_id(&config.data_dir)?;
        let transport = TcpTransport::new(TcpTransportConfig {
            bind_addr: config.bind_addr.clone(),
            node_id: node_id.clone(),
            compress_threshold: config.transport_compress_threshold,
        });
        transport.start().await?;
        Self::start_with_transport(config, node_id, transport as Arc<dyn Transport>).await
    }

    /// Start a node on an already-running transport (the in-process
    /// transport in tests).
    pub async fn start_with_transport(
        config: ClusterConfig,
        node_id: String,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Node>> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let local_node = DiscoveryNode {
            id: node_id.clone(),
            name: if config.node_name.is_empty() {
                format!("node-{}", &node_id[..8.min(node_id.len())])
            } else {
                config.node_name.clone()
            },
            address: transport.local_address(),
            roles: NodeRoles {
                master_eligible: config.master_eligible,
                data: config.data,
            },
            attributes: config.attributes.clone(),
        };

        let cluster = ClusterService::new(&config.cluster_name, &node_id);
        cluster.start();

        let pools = ThreadPools::new();
        let breakers = CircuitBreakerService::new(BreakerLimits::default());

        let allocation = Arc::new(AllocationService::with_settings(
            config.allocation.clone(),
            config.balancer.clone(),
        ));
        let master = MasterService::new(
            Arc::clone(&cluster),
            Arc::clone(&allocation),
            Arc::clone(&pools),
        );
        master.start(transport.as_ref());

        let recovery = RecoveryService::new(Arc::clone(&transport));
        let indices = IndicesService::new(
            node_id.clone(),
            config.data_dir.clone(),
            Arc::clone(&cluster),
            Arc::clone(&transport),
            Arc::clone(&recovery),
            Arc::clone(&pools),
            Arc::clone(&breakers),
        );
        indices.start();

        let replication = ReplicationService::new(
            Arc::clone(&cluster),
            Arc::clone(&transport),
            Arc::clone(&indices),
        );
        replication.start();

        let coordinator = SearchCoordinator::new(Arc::clone(&cluster), Arc::clone(&transport));

        let discovery = Discovery::new(
            config.discovery_config(),
            local_node.clone(),
            Arc::clone(&cluster),
            Arc::clone(&transport),
            master.membership_handler(),
        );
        discovery.start();

        let health_cluster = Arc::clone(&cluster);
        transport.register_handler(
            CLUSTER_HEALTH_ACTION,
            Arc::new(move |_payload: Vec<u8>| {
                let cluster = Arc::clone(&health_cluster);
                Box::pin(async move {
                    let health = cluster_health(&cluster.state());
                    let value = serde_json::to_value(&health)?;
                    let mut buf = bytes::BytesMut::new();
                    crate::wire::write_value(&mut buf, &value);
                    Ok(buf.to_vec())
                }) as crate::transport::HandlerFuture
            }),
        );

        let node = Arc::new(Node {
            config,
            local_node,
            transport,
            cluster,
            allocation,
            master,
            discovery,
            indices,
            replication,
            coordinator,
            pools,
            breakers,
        });
        info!(node = %node.local_node.id, name = %node.local_node.name, "node started");
        Ok(node)
    }

    pub fn stop(&self) {
        info!(node = %self.local_node.id, "stopping node");
        self.discovery.stop();
        self.master.stop();
        self.indices.stop();
    }

    pub fn node_id(&self) -> &str {
        &self.local_node.id
    }

    pub fn address(&self) -> String {
        self.transport.local_address()
    }

    pub fn is_master(&self) -> bool {
        self.cluster.is_master()
    }

    pub fn cluster_state(&self) -> Arc<ClusterState> {
        self.cluster.state()
    }

    pub fn cluster_service(&self) -> &Arc<ClusterService> {
        &self.cluster
    }

    pub fn pools(&self) -> &Arc<ThreadPools> {
        &self.pools
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerService> {
        &self.breakers
    }

    pub fn health(&self) -> ClusterHealth {
        cluster_health(&self.cluster.state())
    }

    /// Ask any node for its health view, decoded from the generic wire
    /// value encoding.
    pub async fn remote_health(&self, address: &str) -> Result<serde_json::Value> {
        let payload = self
            .transport
            .send_request(
                address,
                CLUSTER_HEALTH_ACTION,
                Vec::new(),
                Duration::from_secs(30),
            )
            .await?;
        let mut buf = bytes::Bytes::from(payload);
        crate::wire::read_value(&mut buf)
    }

    pub fn recovery_progress(&self) -> std::collections::HashMap<ShardId, RecoveryProgress> {
        self.indices.recovery_service().all_progress()
    }

    /// Wait until the health rollup reaches at least the given status.
    pub async fn wait_for_health(
        &self,
        wanted: crate::health::HealthStatus,
        timeout: Duration,
    ) -> Result<ClusterHealth> {
        use crate::health::HealthStatus;
        let rank = |status: HealthStatus| match status {
            HealthStatus::Green => 2,
            HealthStatus::Yellow => 1,
            HealthStatus::Red => 0,
        };
        let state = self
            .cluster
            .wait_for(timeout, move |state| {
                rank(cluster_health(state).status) >= rank(wanted)
            })
            .await?;
        Ok(cluster_health(&state))
    }

    // ------------------------------------------------------------------
    // Index administration (forwarded to the master).
    // ------------------------------------------------------------------

    pub async fn create_index(
        &self,
        name: &str,
        settings: IndexSettings,
        mapping: IndexMapping,
    ) -> Result<()> {
        self.send_to_master(
            CREATE_INDEX_ACTION,
            &CreateIndexRequest {
                name: name.to_string(),
                settings,
                mapping,
            },
        )
        .await
    }

    pub async fn delete_index(&self, name: &str) -> Result<()> {
        self.send_to_master(
            DELETE_INDEX_ACTION,
            &DeleteIndexRequest {
                name: name.to_string(),
            },
        )
        .await
    }

    pub async fn update_replicas(&self, name: &str, replicas: u32) -> Result<()> {
        self.send_to_master(
            UPDATE_REPLICAS_ACTION,
            &UpdateReplicasRequest {
                name: name.to_string(),
                replicas,
            },
        )
        .await
    }

    pub async fn update_aliases(
        &self,
        name: &str,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<()> {
        self.send_to_master(
            UPDATE_ALIASES_ACTION,
            &UpdateAliasesRequest {
                name: name.to_string(),
                add,
                remove,
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Document operations.
    // ------------------------------------------------------------------

    pub async fn index_doc(
        &self,
        index: &str,
        doc: Document,
        consistency: Consistency,
        version: Option<u64>,
        version_type: VersionType,
    ) -> Result<IndexResult> {
        let result = self
            .replication
            .write(
                index,
                WriteOp::Index {
                    doc,
                    version,
                    version_type,
                },
                consistency,
                Duration::from_millis(self.config.write_timeout_ms),
            )
            .await?;
        match result {
            WriteResult::Indexed(result) => Ok(result),
            WriteResult::Deleted(_) => Err(ClusterError::Internal(
                "index operation produced a delete result".to_string(),
            )),
        }
    }

    pub async fn delete_doc(
        &self,
        index: &str,
        id: &str,
        consistency: Consistency,
        version: Option<u64>,
        version_type: VersionType,
    ) -> Result<DeleteResult> {
        let result = self
            .replication
            .write(
                index,
                WriteOp::Delete {
                    id: id.to_string(),
                    version,
                    version_type,
                },
                consistency,
                Duration::from_millis(self.config.write_timeout_ms),
            )
            .await?;
        match result {
            WriteResult::Deleted(result) => Ok(result),
            WriteResult::Indexed(_) => Err(ClusterError::Internal(
                "delete operation produced an index result".to_string(),
            )),
        }
    }

    pub async fn bulk(
        &self,
        index: &str,
        ops: Vec<WriteOp>,
        consistency: Consistency,
    ) -> Result<Vec<Result<WriteResult>>> {
        self.replication
            .bulk(
                index,
                ops,
                consistency,
                Duration::from_millis(self.config.write_timeout_ms),
            )
            .await
    }

    pub async fn get_doc(
        &self,
        index: &str,
        id: &str,
        preference: &Preference,
    ) -> Result<Option<GetResult>> {
        self.coordinator.get(index, id, preference).await
    }

    pub async fn search(
        &self,
        index: &str,
        request: SearchRequest,
    ) -> Result<SearchResponse> {
        self.coordinator
            .search(index, request, &Preference::RoundRobin)
            .await
    }

    pub async fn search_with_preference(
        &self,
        index: &str,
        request: SearchRequest,
        preference: &Preference,
    ) -> Result<SearchResponse> {
        self.coordinator.search(index, request, preference).await
    }

    pub async fn scroll(&self, scroll_id: &str) -> Result<SearchResponse> {
        self.coordinator.scroll(scroll_id).await
    }

    pub async fn clear_scroll(&self, scroll_id: &str) -> Result<usize> {
        self.coordinator.clear_scroll(scroll_id).await
    }

    /// Refresh every active copy of an index so recent writes become
    /// searchable on all of them.
    pub async fn refresh(&self, index: &str) -> Result<()> {
        self.broadcast_shard_action(index, SHARD_REFRESH_ACTION).await
    }

    /// Flush every active copy: fsync translogs and advance commit points.
    pub async fn flush(&self, index: &str) -> Result<()> {
        self.broadcast_shard_action(index, SHARD_FLUSH_ACTION).await
    }

    /// Per-shard stats from every active copy.
    pub async fn shard_stats(&self, index: &str) -> Result<Vec<ShardStats>> {
        let state = self.cluster.state();
        let metadata = state.metadata.resolve(index, true)?[0].clone();
        let mut stats = Vec::new();
        for (shard_id, address) in self.active_copy_targets(&state, &metadata.name)? {
            let shard_stats: ShardStats = send_typed(
                self.transport.as_ref(),
                &address,
                SHARD_STATS_ACTION,
                &ShardActionRequest { shard_id },
                Duration::from_secs(30),
            )
            .await?;
            stats.push(shard_stats);
        }
        Ok(stats)
    }

    async fn broadcast_shard_action(&self, index: &str, action: &str) -> Result<()> {
        let state = self.cluster.state();
        let metadata = state.metadata.resolve(index, true)?[0].clone();
        for (shard_id, address) in self.active_copy_targets(&state, &metadata.name)? {
            let _: ShardActionResponse = send_typed(
                self.transport.as_ref(),
                &address,
                action,
                &ShardActionRequest { shard_id },
                Duration::from_secs(30),
            )
            .await?;
        }
        Ok(())
    }

    fn active_copy_targets(
        &self,
        state: &ClusterState,
        index_name: &str,
    ) -> Result<Vec<(ShardId, String)>> {
        let table = state.routing_table.index(index_name).ok_or_else(|| {
            ClusterError::UnavailableShards(format!("index [{}] has no routing", index_name))
        })?;
        let mut targets = Vec::new();
        for copies in table.shards.values() {
            for copy in copies {
                if !copy.active() {
                    continue;
                }
                let node_id = copy.current_node.as_deref().unwrap_or_default();
                if let Some(node) = state.nodes.get(node_id) {
                    targets.push((copy.shard_id.clone(), node.address.clone()));
                }
            }
        }
        Ok(targets)
    }

    async fn send_to_master<Req: Serialize + Sync>(
        &self,
        action: &str,
        request: &Req,
    ) -> Result<()> {
        let state = self.cluster.state();
        let master = state
            .nodes
            .master_node()
            .ok_or_else(|| ClusterError::MasterNotDiscovered("no master elected".to_string()))?;
        let address = master.address.clone();
        let _: MasterAck = send_typed(
            self.transport.as_ref(),
            &address,
            action,
            request,
            Duration::from_secs(60),
        )
        .await?;
        Ok(())
    }
}
