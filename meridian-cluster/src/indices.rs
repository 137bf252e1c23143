//! Node-local shard management.
//!
//! Every applied cluster state is reconciled against the shards this node
//! actually hosts: assigned copies are created and recovered, copies the
//! master moved away are closed (ownership is only released once a newer
//! state no longer assigns them here), and local replicas are promoted when
//! the routing table says they are primaries now.
//!
//! Also serves the shard-level read operations over the transport and runs
//! the per-shard maintenance loops (refresh, async translog fsync, scroll
//! expiry, engine-failure watchdog).

use crate::error::{ClusterError, Result};
use crate::master::{self, ShardFailedRequest, ShardStartedRequest};
use crate::recovery::RecoveryService;
use crate::snapshot::Repository;
use crate::state::routing::{RecoverySource, ShardRouting, ShardRoutingState};
use crate::state::service::ClusterService;
use crate::state::ClusterState;
use crate::transport::{send_typed, Transport};
use meridian::breaker::{BreakerKind, CircuitBreakerService};
use meridian::engine::store::ShardPath;
use meridian::engine::EngineConfig;
use meridian::search::request::{SearchRequest, ShardFetchResult, ShardQueryResult};
use meridian::threadpool::{PoolKind, ThreadPools};
use meridian::{GetResult, Shard, ShardId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const SHARD_GET_ACTION: &str = "indices:data/read/get";
pub const SHARD_REFRESH_ACTION: &str = "indices:admin/refresh";
pub const SHARD_FLUSH_ACTION: &str = "indices:admin/flush";
pub const SHARD_STATS_ACTION: &str = "indices:monitor/stats";
pub const SHARD_QUERY_ACTION: &str = "indices:data/read/query";
pub const SHARD_FETCH_ACTION: &str = "indices:data/read/fetch";
pub const SHARD_SCROLL_ACTION: &str = "indices:data/read/scroll";
pub const SHARD_SCROLL_CLEAR_ACTION: &str = "indices:data/read/scroll_clear";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardGetRequest {
    pub shard_id: ShardId,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardGetResponse {
    pub result: Option<GetResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardQueryRequest {
    pub shard_id: ShardId,
    pub request: SearchRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardFetchRequest {
    pub shard_id: ShardId,
    pub ids: Vec<String>,
    /// Fetch from a pinned scroll snapshot instead of the live searcher.
    pub scroll_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardScrollRequest {
    pub shard_id: ShardId,
    pub cursor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardScrollClearRequest {
    pub shard_id: ShardId,
    pub cursor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardScrollClearResponse {
    pub cleared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardActionRequest {
    pub shard_id: ShardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardActionResponse {}

/// Per-shard operator stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStats {
    pub shard_id: ShardId,
    pub primary: bool,
    pub doc_count: u64,
    pub max_seq_no: Option<u64>,
    pub local_checkpoint: Option<u64>,
    pub translog_operations: u64,
    pub translog_bytes: u64,
    pub open_scrolls: usize,
}

pub struct IndicesService {
    local_node_id: String,
    data_dir: PathBuf,
    cluster: Arc<ClusterService>,
    transport: Arc<dyn Transport>,
    recovery: Arc<RecoveryService>,
    pools: Arc<ThreadPools>,
    breakers: Arc<CircuitBreakerService>,
    repository: RwLock<Option<Arc<dyn Repository>>>,
    shards: RwLock<HashMap<ShardId, Arc<Shard>>>,
    recovering: Mutex<HashSet<ShardId>>,
    running: AtomicBool,
}

impl IndicesService {
    pub fn new(
        local_node_id: String,
        data_dir: PathBuf,
        cluster: Arc<ClusterService>,
        transport: Arc<dyn Transport>,
        recovery: Arc<RecoveryService>,
        pools: Arc<ThreadPools>,
        breakers: Arc<CircuitBreakerService>,
    ) -> Arc<IndicesService> {
        Arc::new(IndicesService {
            local_node_id,
            data_dir,
            cluster,
            transport,
            recovery,
            pools,
            breakers,
            repository: RwLock::new(None),
            shards: RwLock::new(HashMap::new()),
            recovering: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn pools(&self) -> &Arc<ThreadPools> {
        &self.pools
    }

    /// Run shard work on a named pool; a full queue rejects synchronously.
    pub async fn run_on_pool<T, F>(&self, kind: PoolKind, work: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.pools.execute(kind, work).map_err(ClusterError::from)?;
        handle
            .await
            .map_err(|e| ClusterError::Internal(format!("pool task aborted: {}", e)))?
    }

    pub fn set_repository(&self, repository: Arc<dyn Repository>) {
        *self.repository.write() = Some(repository);
    }

    pub fn shard(&self, shard_id: &ShardId) -> Option<Arc<Shard>> {
        self.shards.read().get(shard_id).cloned()
    }

    pub fn local_shards(&self) -> Vec<Arc<Shard>> {
        self.shards.read().values().cloned().collect()
    }

    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        self.register_read_handlers();

        let lookup_indices = Arc::clone(self);
        RecoveryService::register_source_handlers(
            self.transport.as_ref(),
            Arc::new(move |shard_id| lookup_indices.shard(shard_id)),
        );

        // React to every applied cluster state.
        let indices = Arc::clone(self);
        let mut applied = self.cluster.subscribe();
        tokio::spawn(async move {
            loop {
                match applied.recv().await {
                    Ok(state) => indices.apply_cluster_state(&state).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let state = indices.cluster.state();
                        indices.apply_cluster_state(&state).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Maintenance: refresh, translog fsync, scroll expiry, failure
        // watchdog.
        let indices = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(1000));
            while indices.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                indices.maintenance().await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for shard in self.local_shards() {
            shard.close();
        }
    }

    /// Reconcile local shards against an applied cluster state.
    pub async fn apply_cluster_state(self: &Arc<Self>, state: &Arc<ClusterState>) {
        let mut wanted: HashSet<ShardId> = HashSet::new();

        for table in state.routing_table.indices.values() {
            for copies in table.shards.values() {
                for routing in copies {
                    let local_owner = routing.on_node(&self.local_node_id) && routing.assigned();
                    let relocation_target = routing.state == ShardRoutingState::Relocating
                        && routing.relocating_node.as_deref() == Some(self.local_node_id.as_str());

                    if local_owner {
                        wanted.insert(routing.shard_id.clone());
                        self.reconcile_local_copy(state, routing).await;
                    } else if relocation_target {
                        wanted.insert(routing.shard_id.clone());
                        self.start_recovery_if_needed(state, routing, true).await;
                    }
                }
            }
        }

        // Ownership release: the master published a state that no longer
        // assigns these copies here.
        let to_remove: Vec<ShardId> = self
            .shards
            .read()
            .keys()
            .filter(|id| !wanted.contains(id))
            .cloned()
            .collect();
        for shard_id in to_remove {
            if let Some(shard) = self.shards.write().remove(&shard_id) {
                info!(shard = %shard_id, "releasing shard copy");
                shard.close();
            }
        }
    }

    async fn reconcile_local_copy(self: &Arc<Self>, state: &Arc<ClusterState>, routing: &ShardRouting) {
        let existing = self.shard(&routing.shard_id);
        match routing.state {
            ShardRoutingState::Initializing => {
                if existing.is_none() {
                    self.start_recovery_if_needed(state, routing, false).await;
                }
            }
            ShardRoutingState::Started | ShardRoutingState::Relocating => {
                if let Some(shard) = existing {
                    if routing.primary && !shard.is_primary() {
                        info!(shard = %routing.shard_id, "promoting local replica to primary");
                        shard.promote_to_primary();
                    }
                }
            }
            ShardRoutingState::Unassigned => {}
        }
    }

    async fn start_recovery_if_needed(
        self: &Arc<Self>,
        state: &Arc<ClusterState>,
        routing: &ShardRouting,
        relocation: bool,
    ) {
        if self.shard(&routing.shard_id).is_some() {
            return;
        }
        {
            let mut recovering = self.recovering.lock();
            if recovering.contains(&routing.shard_id) {
                return;
            }
            recovering.insert(routing.shard_id.clone());
        }
        let indices = Arc::clone(self);
        let state = Arc::clone(state);
        let routing = routing.clone();
        tokio::spawn(async move {
            let shard_id = routing.shard_id.clone();
            let result = indices.recover_copy(&state, &routing, relocation).await;
            indices.recovering.lock().remove(&shard_id);
            match result {
                Ok(()) => {
                    indices.notify_started(&shard_id).await;
                }
                Err(err) => {
                    warn!(shard = %shard_id, error = %err, "recovery failed");
                    indices.recovery.abort(&shard_id);
                    indices
                        .notify_failed(&shard_id, &format!("recovery failed: {}", err))
                        .await;
                }
            }
        });
    }

    async fn recover_copy(
        self: &Arc<Self>,
        state: &Arc<ClusterState>,
        routing: &ShardRouting,
        relocation: bool,
    ) -> Result<()> {
        let metadata = state
            .metadata
            .index_by_uuid(&routing.shard_id.index_uuid)
            .ok_or_else(|| {
                ClusterError::IndexNotFound(format!(
                    "no metadata for index uuid [{}]",
                    routing.shard_id.index_uuid
                ))
            })?
            .clone();
        let shard_path = ShardPath::new(
            &self.data_dir,
            &routing.shard_id.index_uuid,
            routing.shard_id.shard,
        );

        let source = if relocation {
            // Pull from the node the copy is moving away from.
            routing
                .current_node
                .clone()
                .and_then(|id| state.nodes.get(&id).map(|n| n.address.clone()))
        } else if routing.recovery_source == RecoverySource::Peer {
            // Replicas recover from their active primary.
            state
                .routing_table
                .index(&metadata.name)
                .and_then(|t| t.active_primary(routing.shard_id.shard))
                .and_then(|p| p.current_node.clone())
                .and_then(|id| state.nodes.get(&id).map(|n| n.address.clone()))
        } else {
            None
        };

        let needs_peer = relocation || routing.recovery_source == RecoverySource::Peer;
        let checkpoint = if needs_peer {
            let source = source.ok_or_else(|| {
                ClusterError::UnavailableShards(format!(
                    "no recovery source for {}",
                    routing.shard_id
                ))
            })?;
            self.recovery.begin_session(&routing.shard_id);
            let checkpoint = self
                .recovery
                .copy_files(&routing.shard_id, &shard_path, &source)
                .await?;
            Some((source, checkpoint))
        } else {
            if let RecoverySource::Snapshot {
                repository: _,
                snapshot,
            } = &routing.recovery_source
            {
                let repository = self
                    .repository
                    .read()
                    .clone()
                    .ok_or_else(|| {
                        ClusterError::Validation("no snapshot repository configured".to_string())
                    })?;
                let recovery = Arc::clone(&self.recovery);
                let snapshot = snapshot.clone();
                let shard_id = routing.shard_id.clone();
                let restore_path = shard_path.clone();
                self.run_on_pool(PoolKind::Snapshot, async move {
                    recovery
                        .restore_snapshot(repository.as_ref(), &snapshot, &shard_id, &restore_path)
                        .await
                })
                .await?;
            }
            None
        };

        let shard = Arc::new(
            Shard::open(
                routing.shard_id.clone(),
                &metadata.name,
                routing.primary && !relocation,
                EngineConfig {
                    index_uuid: routing.shard_id.index_uuid.clone(),
                    shard_path,
                    settings: metadata.settings.clone(),
                    mapping: metadata.mapping.clone(),
                },
            )
            .map_err(ClusterError::from)?,
        );

        match checkpoint {
            Some((source, checkpoint)) => {
                shard.mark_recovering();
                self.shards
                    .write()
                    .insert(routing.shard_id.clone(), Arc::clone(&shard));
                self.recovery
                    .replay_translog(&routing.shard_id, &shard, &source, checkpoint)
                    .await?;
                self.recovery.finish(&routing.shard_id, &shard)?;
            }
            None => {
                self.shards
                    .write()
                    .insert(routing.shard_id.clone(), Arc::clone(&shard));
                shard.mark_started();
            }
        }
        Ok(())
    }

    /// Tell the master a copy finished recovery.
    pub async fn notify_started(&self, shard_id: &ShardId) {
        let request = ShardStartedRequest {
            shard_id: shard_id.clone(),
            node_id: self.local_node_id.clone(),
        };
        if let Err(err) = self.send_to_master(master::SHARD_STARTED_ACTION, &request).await {
            warn!(shard = %shard_id, error = %err, "failed to report shard started");
        }
    }

    /// Tell the master a copy failed; the copy is closed locally.
    pub async fn notify_failed(&self, shard_id: &ShardId, reason: &str) {
        if let Some(shard) = self.shards.write().remove(shard_id) {
            shard.close();
        }
        let request = ShardFailedRequest {
            shard_id: shard_id.clone(),
            node_id: self.local_node_id.clone(),
            reason: reason.to_string(),
        };
        if let Err(err) = self.send_to_master(master::SHARD_FAILED_ACTION, &request).await {
            warn!(shard = %shard_id, error = %err, "failed to report shard failure");
        }
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
            .ok_or_else(|| ClusterError::MasterNotDiscovered("no master".to_string()))?;
        let address = master.address.clone();
        let _: master::MasterAck =
            send_typed(self.transport.as_ref(), &address, action, request, Duration::from_secs(30))
                .await?;
        Ok(())
    }

    async fn maintenance(self: &Arc<Self>) {
        for shard in self.local_shards() {
            if shard.state() != meridian::LocalShardState::Started {
                continue;
            }
            if let Some(reason) = shard.failure() {
                self.notify_failed(&shard.id.clone(), &reason).await;
                continue;
            }

            // The periodic refresh and translog fsync go through the
            // refresh pool like any other refresh.
            let worker = Arc::clone(&shard);
            let refreshed = self
                .run_on_pool(PoolKind::Refresh, async move {
                    worker.refresh().map_err(ClusterError::from)?;
                    worker.sync_translog().map_err(ClusterError::from)?;
                    Ok(())
                })
                .await;
            match refreshed {
                Ok(()) => {}
                Err(ClusterError::RejectedExecution(_)) => {
                    // Pool saturated: skip this tick, the next one retries.
                    continue;
                }
                Err(err) => {
                    warn!(shard = %shard.id, error = %err, "refresh failed");
                    self.notify_failed(&shard.id.clone(), &err.to_string()).await;
                    continue;
                }
            }

            let worker = Arc::clone(&shard);
            let _ = self
                .run_on_pool(PoolKind::Generic, async move {
                    worker.expire_scrolls();
                    Ok(())
                })
                .await;
        }
    }

    fn register_read_handlers(self: &Arc<Self>) {
        let indices = Arc::clone(self);
        self.transport.register_handler(
            SHARD_GET_ACTION,
            crate::transport::typed_handler(move |request: ShardGetRequest| {
                let indices = Arc::clone(&indices);
                async move {
                    let shard = indices.started_shard(&request.shard_id)?;
                    indices
                        .run_on_pool(PoolKind::Get, async move {
                            Ok(ShardGetResponse {
                                result: shard.get(&request.id).map_err(ClusterError::from)?,
                            })
                        })
                        .await
                }
            }),
        );

        let indices = Arc::clone(self);
        self.transport.register_handler(
            SHARD_QUERY_ACTION,
            crate::transport::typed_handler(move |request: ShardQueryRequest| {
                let indices = Arc::clone(&indices);
                async move {
                    // Account the in-flight request before doing the work.
                    let reservation = indices
                        .breakers
                        .try_reserve(BreakerKind::Request, query_memory_estimate(&request.request))
                        .map_err(ClusterError::from)?;
                    let shard = indices.started_shard(&request.shard_id)?;
                    indices
                        .run_on_pool(PoolKind::Search, async move {
                            let _reservation = reservation;
                            let result: ShardQueryResult = shard
                                .query_phase(&request.request)
                                .map_err(ClusterError::from)?;
                            Ok(result)
                        })
                        .await
                }
            }),
        );

        let indices = Arc::clone(self);
        self.transport.register_handler(
            SHARD_FETCH_ACTION,
            crate::transport::typed_handler(move |request: ShardFetchRequest| {
                let indices = Arc::clone(&indices);
                async move {
                    let shard = indices.started_shard(&request.shard_id)?;
                    indices
                        .run_on_pool(PoolKind::Search, async move {
                            let result: ShardFetchResult = match request.scroll_cursor {
                                Some(cursor) => shard
                                    .scroll_fetch(&cursor, &request.ids)
                                    .map_err(ClusterError::from)?,
                                None => shard
                                    .fetch_phase(&request.ids)
                                    .map_err(ClusterError::from)?,
                            };
                            Ok(result)
                        })
                        .await
                }
            }),
        );

        let indices = Arc::clone(self);
        self.transport.register_handler(
            SHARD_SCROLL_ACTION,
            crate::transport::typed_handler(move |request: ShardScrollRequest| {
                let indices = Arc::clone(&indices);
                async move {
                    let shard = indices.started_shard(&request.shard_id)?;
                    indices
                        .run_on_pool(PoolKind::Search, async move {
                            let result: ShardQueryResult = shard
                                .scroll_next(&request.cursor)
                                .map_err(ClusterError::from)?;
                            Ok(result)
                        })
                        .await
                }
            }),
        );

        let indices = Arc::clone(self);
        self.transport.register_handler(
            SHARD_REFRESH_ACTION,
            crate::transport::typed_handler(move |request: ShardActionRequest| {
                let indices = Arc::clone(&indices);
                async move {
                    let shard = indices.started_shard(&request.shard_id)?;
                    indices
                        .run_on_pool(PoolKind::Refresh, async move {
                            shard.refresh().map_err(ClusterError::from)?;
                            Ok(ShardActionResponse {})
                        })
                        .await
                }
            }),
        );

        let indices = Arc::clone(self);
        self.transport.register_handler(
            SHARD_FLUSH_ACTION,
            crate::transport::typed_handler(move |request: ShardActionRequest| {
                let indices = Arc::clone(&indices);
                async move {
                    let shard = indices.started_shard(&request.shard_id)?;
                    indices
                        .run_on_pool(PoolKind::Flush, async move {
                            shard.flush().map_err(ClusterError::from)?;
                            Ok(ShardActionResponse {})
                        })
                        .await
                }
            }),
        );

        let indices = Arc::clone(self);
        self.transport.register_handler(
            SHARD_STATS_ACTION,
            crate::transport::typed_handler(move |request: ShardActionRequest| {
                let indices = Arc::clone(&indices);
                async move {
                    let shard = indices.started_shard(&request.shard_id)?;
                    let (translog_operations, translog_bytes) = shard.translog_stats();
                    Ok(ShardStats {
                        shard_id: shard.id.clone(),
                        primary: shard.is_primary(),
                        doc_count: shard.doc_count(),
                        max_seq_no: shard.max_seq_no(),
                        local_checkpoint: shard.local_checkpoint(),
                        translog_operations,
                        translog_bytes,
                        open_scrolls: shard.open_scrolls(),
                    })
                }
            }),
        );

        let indices = Arc::clone(self);
        self.transport.register_handler(
            SHARD_SCROLL_CLEAR_ACTION,
            crate::transport::typed_handler(move |request: ShardScrollClearRequest| {
                let indices = Arc::clone(&indices);
                async move {
                    let cleared = indices
                        .shard(&request.shard_id)
                        .map(|shard| shard.clear_scroll(&request.cursor))
                        .unwrap_or(false);
                    Ok(ShardScrollClearResponse { cleared })
                }
            }),
        );
    }

    pub fn started_shard(&self, shard_id: &ShardId) -> Result<Arc<Shard>> {
        let shard = self.shard(shard_id).ok_or_else(|| {
            ClusterError::UnavailableShards(format!("shard {} is not hosted here", shard_id))
        })?;
        if shard.state() != meridian::LocalShardState::Started {
            return Err(ClusterError::UnavailableShards(format!(
                "shard {} is {:?}",
                shard_id,
                shard.state()
            )));
        }
        Ok(shard)
    }

    /// Used by the replication layer: a shard that may also be recovering.
    pub fn writable_shard(&self, shard_id: &ShardId) -> Result<Arc<Shard>> {
        self.shard(shard_id).ok_or_else(|| {
            ClusterError::UnavailableShards(format!("shard {} is not hosted here", shard_id))
        })
    }

    pub fn recovery_service(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }

    pub fn debug_state(&self) -> Vec<(ShardId, bool, meridian::LocalShardState)> {
        self.shards
            .read()
            .iter()
            .map(|(id, shard)| (id.clone(), shard.is_primary(), shard.state()))
            .collect()
    }
}

/// Rough transient-memory estimate for one shard query: per-hit bookkeeping
/// plus a fixed floor for the collectors.
fn query_memory_estimate(request: &SearchRequest) -> u64 {
    ((request.from + request.size) as u64) * 512 + 16 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_request_serde() {
        let request = ShardQueryRequest {
            shard_id: ShardId::new("u", 1),
            request: SearchRequest::new(meridian::search::query::SearchQuery::match_all()),
        };
        let bytes = bincode::serialize(&request).unwrap();
        let back: ShardQueryRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.shard_id.shard, 1);
    }
}
