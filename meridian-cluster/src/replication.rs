//! Primary-driven write replication.
//!
//! A write enters at any node, which routes it by `hash(routing) mod
//! primaries` and forwards it to the primary's node. While the primary is
//! unassigned or initializing, the request parks and re-resolves on every
//! cluster-state change until its deadline. The primary checks the
//! consistency level against the active copy count, executes locally, fans
//! the sequenced operations out to its replicas concurrently, and reports
//! unresponsive replicas to the master for removal.

use crate::error::{ClusterError, Result};
use crate::indices::IndicesService;
use crate::master::{self, MasterAck, ShardFailedRequest};
use crate::routing::shard_for;
use crate::state::routing::ShardRoutingState;
use crate::state::service::ClusterService;
use crate::state::ClusterBlockLevel;
use crate::transport::{send_typed, Transport};
use meridian::shard::OperationOrigin;
use meridian::threadpool::PoolKind;
use meridian::{
    DeleteResult, Document, IndexResult, Operation, ShardId, VersionType,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const PRIMARY_WRITE_ACTION: &str = "indices:data/write/primary";
pub const REPLICA_WRITE_ACTION: &str = "indices:data/write/replica";

pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 60_000;

/// How many copies must be active before a write executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    One,
    Quorum,
    All,
}

impl Consistency {
    /// Required active copies out of `total_copies` (primary + replicas).
    /// Quorum only kicks in above two copies, otherwise a lone primary
    /// could never accept writes.
    pub fn required_copies(&self, total_copies: u32) -> u32 {
        match self {
            Consistency::One => 1,
            Consistency::All => total_copies,
            Consistency::Quorum => {
                if total_copies > 2 {
                    total_copies / 2 + 1
                } else {
                    1
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteOp {
    Index {
        doc: Document,
        version: Option<u64>,
        version_type: VersionType,
    },
    Delete {
        id: String,
        version: Option<u64>,
        version_type: VersionType,
    },
}

impl WriteOp {
    pub fn routing_key(&self) -> &str {
        match self {
            WriteOp::Index { doc, .. } => doc.routing_key(),
            WriteOp::Delete { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteResult {
    Indexed(IndexResult),
    Deleted(DeleteResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryWriteRequest {
    pub index: String,
    pub shard: u32,
    pub ops: Vec<WriteOp>,
    pub consistency: Consistency,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryWriteResponse {
    /// Per-op outcomes, in request order.
    pub results: Vec<std::result::Result<WriteResult, ClusterError>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaWriteRequest {
    pub shard_id: ShardId,
    pub ops: Vec<Operation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaWriteResponse {}

pub struct ReplicationService {
    cluster: Arc<ClusterService>,
    transport: Arc<dyn Transport>,
    indices: Arc<IndicesService>,
}

impl ReplicationService {
    pub fn new(
        cluster: Arc<ClusterService>,
        transport: Arc<dyn Transport>,
        indices: Arc<IndicesService>,
    ) -> Arc<ReplicationService> {
        Arc::new(ReplicationService {
            cluster,
            transport,
            indices,
        })
    }

    pub fn start(self: &Arc<Self>) {
        self.register_primary_handler();
        self.register_replica_handler();
    }

    /// Single-document write through the bulk path.
    pub async fn write(
        &self,
        index: &str,
        op: WriteOp,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<WriteResult> {
        let mut results = self.bulk(index, vec![op], consistency, timeout).await?;
        results.remove(0)
    }

    /// Bulk write: ops are grouped per target shard and executed through
    /// the replication path; per-item outcomes come back in request order.
    pub async fn bulk(
        &self,
        index: &str,
        ops: Vec<WriteOp>,
        consistency: Consistency,
        timeout: Duration,
    ) -> Result<Vec<Result<WriteResult>>> {
        self.cluster.check_block(ClusterBlockLevel::Write)?;
        let deadline = Instant::now() + timeout;

        let state = self.cluster.state();
        let metadata = state.metadata.resolve(index, true)?[0].clone();
        let primaries = metadata.number_of_shards();

        // Group per shard, remembering original positions.
        let mut by_shard: BTreeMap<u32, Vec<(usize, WriteOp)>> = BTreeMap::new();
        for (position, op) in ops.into_iter().enumerate() {
            let shard = shard_for(op.routing_key(), primaries);
            by_shard.entry(shard).or_default().push((position, op));
        }

        let mut combined: Vec<Option<Result<WriteResult>>> = Vec::new();
        combined.resize_with(by_shard.values().map(|v| v.len()).sum(), || None);

        let groups = by_shard.into_iter().map(|(shard, group)| {
            let metadata_name = metadata.name.clone();
            async move {
                let positions: Vec<usize> = group.iter().map(|(p, _)| *p).collect();
                let shard_ops: Vec<WriteOp> = group.into_iter().map(|(_, op)| op).collect();
                let response = self
                    .send_to_primary(&metadata_name, shard, shard_ops, consistency, deadline)
                    .await;
                (positions, response)
            }
        });
        for (positions, response) in futures::future::join_all(groups).await {
            match response {
                Ok(response) => {
                    for (position, result) in positions.into_iter().zip(response.results) {
                        combined[position] = Some(result.map_err(|e| e));
                    }
                }
                Err(err) => {
                    for position in positions {
                        combined[position] = Some(Err(err.clone()));
                    }
                }
            }
        }
        Ok(combined.into_iter().map(|r| r.expect("every op resolved")).collect())
    }

    /// Resolve the primary and forward, parking on cluster-state changes
    /// while it is unassigned or initializing.
    async fn send_to_primary(
        &self,
        index: &str,
        shard: u32,
        ops: Vec<WriteOp>,
        consistency: Consistency,
        deadline: Instant,
    ) -> Result<PrimaryWriteResponse> {
        loop {
            let state = self.cluster.state();
            let observed_version = state.version;
            let primary_address = state
                .routing_table
                .index(index)
                .and_then(|table| table.active_primary(shard))
                .and_then(|primary| primary.current_node.as_deref())
                .and_then(|node_id| state.nodes.get(node_id))
                .map(|node| node.address.clone());

            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(address) = primary_address {
                let request = PrimaryWriteRequest {
                    index: index.to_string(),
                    shard,
                    ops: ops.clone(),
                    consistency,
                    timeout_ms: remaining.as_millis() as u64,
                };
                // The transport wait outlives the request deadline slightly,
                // so the primary's own verdict (e.g. UnavailableShards from
                // the consistency gate) beats a transport timeout.
                match send_typed::<_, PrimaryWriteResponse>(
                    self.transport.as_ref(),
                    &address,
                    PRIMARY_WRITE_ACTION,
                    &request,
                    remaining.max(Duration::from_millis(1)) + Duration::from_secs(5),
                )
                .await
                {
                    Ok(response) => return Ok(response),
                    Err(err) if err.retryable() && Instant::now() < deadline => {
                        debug!(index, shard, error = %err, "primary write retrying");
                    }
                    Err(err) => return Err(err),
                }
            }

            if Instant::now() >= deadline {
                return Err(ClusterError::UnavailableShards(format!(
                    "primary for [{}][{}] not available within timeout",
                    index, shard
                )));
            }
            // Park until the routing changes, then re-resolve.
            let _ = self
                .cluster
                .wait_for_version(
                    observed_version + 1,
                    deadline.saturating_duration_since(Instant::now()),
                )
                .await;
        }
    }

    fn register_primary_handler(self: &Arc<Self>) {
        let service = Arc::clone(self);
        self.transport.register_handler(
            PRIMARY_WRITE_ACTION,
            crate::transport::typed_handler(move |request: PrimaryWriteRequest| {
                let service = Arc::clone(&service);
                async move { service.execute_on_primary(request).await }
            }),
        );
    }

    fn register_replica_handler(self: &Arc<Self>) {
        let service = Arc::clone(self);
        self.transport.register_handler(
            REPLICA_WRITE_ACTION,
            crate::transport::typed_handler(move |request: ReplicaWriteRequest| {
                let service = Arc::clone(&service);
                async move {
                    let recovery = service.indices.recovery_service();
                    for op in &request.ops {
                        // Copies mid-recovery buffer live replication and
                        // drain it at handoff.
                        if recovery.buffer_replication(&request.shard_id, op) {
                            continue;
                        }
                        let shard = service.indices.writable_shard(&request.shard_id)?;
                        shard.apply_operation(op, OperationOrigin::Replica)?;
                    }
                    Ok(ReplicaWriteResponse {})
                }
            }),
        );
    }

    async fn execute_on_primary(
        &self,
        request: PrimaryWriteRequest,
    ) -> Result<PrimaryWriteResponse> {
        let deadline = Instant::now() + Duration::from_millis(request.timeout_ms.max(1));
        let state = self.cluster.state();
        let metadata = state.metadata.resolve(&request.index, true)?[0].clone();
        let shard_id = ShardId::new(metadata.uuid.clone(), request.shard);

        let shard = self.indices.started_shard(&shard_id)?;
        if !shard.is_primary() {
            // Stale routing on the coordinator; retryable there.
            return Err(ClusterError::UnavailableShards(format!(
                "shard {} is not the primary here",
                shard_id
            )));
        }

        self.wait_for_consistency(&metadata.name, &shard_id, request.consistency, deadline)
            .await?;

        // Execute locally on the index/bulk pool, collecting the sequenced
        // operations to replicate. A saturated pool rejects synchronously.
        let pool = if request.ops.len() > 1 {
            PoolKind::Bulk
        } else {
            PoolKind::Index
        };
        let ops = request.ops;
        let executing_shard = Arc::clone(&shard);
        let (results, replicated) = self
            .indices
            .run_on_pool(pool, async move {
                let mut results = Vec::with_capacity(ops.len());
                let mut replicated = Vec::new();
                for op in &ops {
                    match op {
                        WriteOp::Index {
                            doc,
                            version,
                            version_type,
                        } => match executing_shard.index(doc, *version, *version_type) {
                            Ok(result) => {
                                replicated.push(Operation::Index {
                                    id: doc.id.clone(),
                                    source: doc.source.clone(),
                                    routing: doc.routing.clone(),
                                    seq_no: result.seq_no,
                                    version: result.version,
                                });
                                results.push(Ok(WriteResult::Indexed(result)));
                            }
                            Err(err) => results.push(Err(ClusterError::from(err))),
                        },
                        WriteOp::Delete {
                            id,
                            version,
                            version_type,
                        } => match executing_shard.delete(id, *version, *version_type) {
                            Ok(result) => {
                                replicated.push(Operation::Delete {
                                    id: id.clone(),
                                    seq_no: result.seq_no,
                                    version: result.version,
                                });
                                results.push(Ok(WriteResult::Deleted(result)));
                            }
                            Err(err) => results.push(Err(ClusterError::from(err))),
                        },
                    }
                }
                Ok((results, replicated))
            })
            .await?;

        if let Some(reason) = shard.failure() {
            // A failed engine fails the copy, not just the op.
            self.indices.notify_failed(&shard_id, &reason).await;
            return Err(ClusterError::ShardFailure(reason));
        }

        if !replicated.is_empty() {
            self.replicate(&metadata.name, &shard_id, replicated, deadline)
                .await;
        }
        Ok(PrimaryWriteResponse { results })
    }

    /// Park until enough copies are active for the consistency level, or
    /// fail with UnavailableShards at the deadline.
    async fn wait_for_consistency(
        &self,
        index: &str,
        shard_id: &ShardId,
        consistency: Consistency,
        deadline: Instant,
    ) -> Result<()> {
        loop {
            let state = self.cluster.state();
            let metadata = state.metadata.resolve(index, true)?[0].clone();
            let total_copies = 1 + metadata.number_of_replicas();
            let required = consistency.required_copies(total_copies);
            let active = state
                .routing_table
                .index(index)
                .map(|table| table.active_copies(shard_id.shard).len() as u32)
                .unwrap_or(0);
            if active >= required {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::UnavailableShards(format!(
                    "not enough active copies of {}: [{}] active, [{}] required",
                    shard_id, active, required
                )));
            }
            let _ = self
                .cluster
                .wait_for_version(
                    state.version + 1,
                    deadline.saturating_duration_since(Instant::now()),
                )
                .await;
        }
    }

    /// Fan out sequenced operations to every replica copy concurrently.
    /// Started replicas that fail are reported to the master; initializing
    /// targets are best-effort (recovery catches them up).
    async fn replicate(
        &self,
        index: &str,
        shard_id: &ShardId,
        ops: Vec<Operation>,
        deadline: Instant,
    ) {
        let state = self.cluster.state();
        let local_id = self.cluster.local_node_id();
        let Some(table) = state.routing_table.index(index) else {
            return;
        };
        let Some(copies) = table.shards.get(&shard_id.shard) else {
            return;
        };
        let targets: Vec<(String, String, bool)> = copies
            .iter()
            .filter(|copy| !copy.primary && copy.assigned())
            .filter(|copy| {
                matches!(
                    copy.state,
                    ShardRoutingState::Started | ShardRoutingState::Initializing
                )
            })
            .filter_map(|copy| {
                let node_id = copy.current_node.clone()?;
                if node_id == local_id {
                    return None;
                }
                let address = state.nodes.get(&node_id)?.address.clone();
                Some((
                    node_id,
                    address,
                    copy.state == ShardRoutingState::Started,
                ))
            })
            .collect();

        let request = ReplicaWriteRequest {
            shard_id: shard_id.clone(),
            ops,
        };
        let timeout = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        let sends = targets.into_iter().map(|(node_id, address, started)| {
            let request = request.clone();
            async move {
                let result: Result<ReplicaWriteResponse> = send_typed(
                    self.transport.as_ref(),
                    &address,
                    REPLICA_WRITE_ACTION,
                    &request,
                    timeout,
                )
                .await;
                (node_id, started, result)
            }
        });
        for (node_id, started, result) in futures::future::join_all(sends).await {
            if let Err(err) = result {
                if started {
                    warn!(
                        shard = %shard_id,
                        replica = %node_id,
                        error = %err,
                        "replica write failed, reporting to master"
                    );
                    self.report_replica_failure(shard_id, &node_id, &err.to_string())
                        .await;
                } else {
                    debug!(
                        shard = %shard_id,
                        replica = %node_id,
                        error = %err,
                        "initializing copy missed a replicated op"
                    );
                }
            }
        }
    }

    async fn report_replica_failure(&self, shard_id: &ShardId, node_id: &str, reason: &str) {
        let state = self.cluster.state();
        let Some(master) = state.nodes.master_node() else {
            return;
        };
        let request = ShardFailedRequest {
            shard_id: shard_id.clone(),
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        };
        let result: Result<MasterAck> = send_typed(
            self.transport.as_ref(),
            &master.address.clone(),
            master::SHARD_FAILED_ACTION,
            &request,
            Duration::from_secs(30),
        )
        .await;
        if let Err(err) = result {
            warn!(shard = %shard_id, error = %err, "failed to report replica failure");
        }
    }
}
