//! Query coordination: scatter/gather across shards.
//!
//! Phase 1 sends a lightweight query to one active copy of every shard and
//! merges the per-shard top-K into the global top-K; phase 2 fetches the
//! sources of the surviving hits from just the shards that own them. Shard
//! failures (including deadline misses) contribute zero results and are
//! reported in the response's shard summary alongside the partial results.

use crate::error::{ClusterError, Result};
use crate::indices::{
    ShardFetchRequest, ShardGetRequest, ShardGetResponse, ShardQueryRequest,
    ShardScrollClearRequest, ShardScrollClearResponse, ShardScrollRequest, SHARD_FETCH_ACTION,
    SHARD_GET_ACTION, SHARD_QUERY_ACTION, SHARD_SCROLL_ACTION, SHARD_SCROLL_CLEAR_ACTION,
};
use crate::routing::{shard_for, OperationRouting, Preference};
use crate::state::service::ClusterService;
use crate::state::ClusterBlockLevel;
use crate::transport::{send_typed, Transport};
use base64::Engine as _;
use meridian::aggregations::{self, AggregationResult};
use meridian::search::request::{SearchRequest, ShardFetchResult, ShardQueryResult};
use meridian::{GetResult, ShardId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_SHARD_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub index: String,
    pub id: String,
    pub score: f32,
    pub source: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardFailure {
    pub index: String,
    pub shard: u32,
    pub node: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardStatistics {
    pub total: u32,
    pub successful: u32,
    pub failed: u32,
    pub failures: Vec<ShardFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub took_ms: u64,
    pub hits: Vec<SearchHit>,
    pub total_hits: u64,
    pub max_score: Option<f32>,
    pub aggregations: Vec<(String, AggregationResult)>,
    pub shards: ShardStatistics,
    pub scroll_id: Option<String>,
}

/// One per-shard cursor inside an opaque scroll id.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScrollCursor {
    index_name: String,
    shard_id: ShardId,
    node_id: String,
    address: String,
    cursor: String,
}

fn encode_scroll_id(cursors: &[ScrollCursor]) -> Result<String> {
    let bytes = bincode::serialize(cursors)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn decode_scroll_id(scroll_id: &str) -> Result<Vec<ScrollCursor>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(scroll_id)
        .map_err(|_| ClusterError::Validation("malformed scroll id".to_string()))?;
    Ok(bincode::deserialize(&bytes)?)
}

#[derive(Clone)]
struct ShardTarget {
    index_name: String,
    shard_id: ShardId,
    node_id: String,
    address: String,
}

pub struct SearchCoordinator {
    cluster: Arc<ClusterService>,
    transport: Arc<dyn Transport>,
    routing: OperationRouting,
}

impl SearchCoordinator {
    pub fn new(
        cluster: Arc<ClusterService>,
        transport: Arc<dyn Transport>,
    ) -> Arc<SearchCoordinator> {
        Arc::new(SearchCoordinator {
            cluster,
            transport,
            routing: OperationRouting::default(),
        })
    }

    /// Get by id, routed by preference to any active copy.
    pub async fn get(
        &self,
        index: &str,
        id: &str,
        preference: &Preference,
    ) -> Result<Option<GetResult>> {
        self.cluster.check_block(ClusterBlockLevel::Read)?;
        let state = self.cluster.state();
        let metadata = state.metadata.resolve(index, true)?[0].clone();
        let table = state.routing_table.index(&metadata.name).ok_or_else(|| {
            ClusterError::UnavailableShards(format!("index [{}] has no routing", metadata.name))
        })?;
        let shard = shard_for(id, metadata.number_of_shards());
        let copy = self
            .routing
            .select_copy(table, shard, preference, self.cluster.local_node_id())?;
        let node_id = copy.current_node.clone().unwrap();
        let address = state
            .nodes
            .get(&node_id)
            .map(|n| n.address.clone())
            .ok_or_else(|| ClusterError::NodeUnavailable(node_id.clone()))?;

        let response: ShardGetResponse = send_typed(
            self.transport.as_ref(),
            &address,
            SHARD_GET_ACTION,
            &ShardGetRequest {
                shard_id: ShardId::new(metadata.uuid.clone(), shard),
                id: id.to_string(),
            },
            Duration::from_millis(DEFAULT_SHARD_TIMEOUT_MS),
        )
        .await?;
        Ok(response.result)
    }

    /// Two-phase search across one index or alias.
    pub async fn search(
        &self,
        index: &str,
        request: SearchRequest,
        preference: &Preference,
    ) -> Result<SearchResponse> {
        self.cluster.check_block(ClusterBlockLevel::Read)?;
        let started = Instant::now();
        let state = self.cluster.state();
        let metas: Vec<_> = state
            .metadata
            .resolve(index, false)?
            .into_iter()
            .cloned()
            .collect();

        // One active copy per shard, honoring the preference.
        let mut targets = Vec::new();
        let mut failures = Vec::new();
        for meta in &metas {
            let Some(table) = state.routing_table.index(&meta.name) else {
                continue;
            };
            for shard in 0..meta.number_of_shards() {
                match self.routing.select_copy(
                    table,
                    shard,
                    preference,
                    self.cluster.local_node_id(),
                ) {
                    Ok(copy) => {
                        let node_id = copy.current_node.clone().unwrap();
                        match state.nodes.get(&node_id) {
                            Some(node) => targets.push(ShardTarget {
                                index_name: meta.name.clone(),
                                shard_id: ShardId::new(meta.uuid.clone(), shard),
                                node_id: node_id.clone(),
                                address: node.address.clone(),
                            }),
                            None => failures.push(ShardFailure {
                                index: meta.name.clone(),
                                shard,
                                node: Some(node_id),
                                reason: "node address unknown".to_string(),
                            }),
                        }
                    }
                    Err(err) => failures.push(ShardFailure {
                        index: meta.name.clone(),
                        shard,
                        node: None,
                        reason: err.to_string(),
                    }),
                }
            }
        }
        let total_shards = (targets.len() + failures.len()) as u32;

        // Phase 1: query.
        let shard_timeout = Duration::from_millis(
            request.timeout_ms.unwrap_or(DEFAULT_SHARD_TIMEOUT_MS) + 1_000,
        );
        let queries = targets.iter().map(|target| {
            let request = request.clone();
            async move {
                let result: Result<ShardQueryResult> = send_typed(
                    self.transport.as_ref(),
                    &target.address,
                    SHARD_QUERY_ACTION,
                    &ShardQueryRequest {
                        shard_id: target.shard_id.clone(),
                        request,
                    },
                    shard_timeout,
                )
                .await;
                (target.clone(), result)
            }
        });
        let mut successes: Vec<(ShardTarget, ShardQueryResult)> = Vec::new();
        for (target, result) in futures::future::join_all(queries).await {
            match result {
                Ok(result) => successes.push((target, result)),
                Err(err) => {
                    debug!(shard = %target.shard_id, error = %err, "query phase shard failure");
                    failures.push(ShardFailure {
                        index: target.index_name,
                        shard: target.shard_id.shard,
                        node: Some(target.node_id),
                        reason: err.to_string(),
                    });
                }
            }
        }

        // Merge: global top-K over (score desc, id asc).
        let total_hits: u64 = successes.iter().map(|(_, r)| r.total_hits).sum();
        let max_score = successes
            .iter()
            .filter_map(|(_, r)| r.max_score)
            .max_by(|a, b| a.total_cmp(b));
        let mut merged: Vec<(usize, String, f32)> = Vec::new();
        for (position, (_, result)) in successes.iter().enumerate() {
            for hit in &result.hits {
                merged.push((position, hit.id.clone(), hit.score));
            }
        }
        merged.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.1.cmp(&b.1)));
        let window: Vec<(usize, String, f32)> = merged
            .into_iter()
            .skip(request.from)
            .take(request.size)
            .collect();

        // Aggregations: reduce per-shard partials.
        let aggregations = if request.aggregations.is_empty() {
            Vec::new()
        } else {
            let partials: Vec<_> = successes
                .iter()
                .map(|(_, r)| r.aggregations.clone())
                .collect();
            let reduced = aggregations::reduce(&request.aggregations, partials)?;
            aggregations::finalize(&request.aggregations, reduced)
        };

        let scroll_id = if request.scroll_keep_alive_ms.is_some() {
            let cursors: Vec<ScrollCursor> = successes
                .iter()
                .filter_map(|(target, result)| {
                    result.scroll_cursor.clone().map(|cursor| ScrollCursor {
                        index_name: target.index_name.clone(),
                        shard_id: target.shard_id.clone(),
                        node_id: target.node_id.clone(),
                        address: target.address.clone(),
                        cursor,
                    })
                })
                .collect();
            Some(encode_scroll_id(&cursors)?)
        } else {
            None
        };

        // Phase 2: fetch sources from the owners of the surviving hits.
        let hits = self
            .fetch_phase(&successes, &window)
            .await?;

        let successful = successes.len() as u32;
        Ok(SearchResponse {
            took_ms: started.elapsed().as_millis() as u64,
            hits,
            total_hits,
            max_score,
            aggregations,
            shards: ShardStatistics {
                total: total_shards,
                successful,
                failed: failures.len() as u32,
                failures,
            },
            scroll_id,
        })
    }

    /// Continue a scroll: next batch from every shard cursor, merged by
    /// score.
    pub async fn scroll(&self, scroll_id: &str) -> Result<SearchResponse> {
        self.cluster.check_block(ClusterBlockLevel::Read)?;
        let started = Instant::now();
        let cursors = decode_scroll_id(scroll_id)?;

        let batches = cursors.iter().map(|cursor| async move {
            let result: Result<ShardQueryResult> = send_typed(
                self.transport.as_ref(),
                &cursor.address,
                SHARD_SCROLL_ACTION,
                &ShardScrollRequest {
                    shard_id: cursor.shard_id.clone(),
                    cursor: cursor.cursor.clone(),
                },
                Duration::from_millis(DEFAULT_SHARD_TIMEOUT_MS),
            )
            .await;
            (cursor.clone(), result)
        });

        let mut failures = Vec::new();
        let mut hits = Vec::new();
        let mut total_hits = 0u64;
        for (cursor, result) in futures::future::join_all(batches).await {
            match result {
                Ok(batch) => {
                    total_hits += batch.total_hits;
                    let ids: Vec<String> = batch.hits.iter().map(|h| h.id.clone()).collect();
                    if ids.is_empty() {
                        continue;
                    }
                    let fetched: Result<ShardFetchResult> = send_typed(
                        self.transport.as_ref(),
                        &cursor.address,
                        SHARD_FETCH_ACTION,
                        &ShardFetchRequest {
                            shard_id: cursor.shard_id.clone(),
                            ids: ids.clone(),
                            scroll_cursor: Some(cursor.cursor.clone()),
                        },
                        Duration::from_millis(DEFAULT_SHARD_TIMEOUT_MS),
                    )
                    .await;
                    match fetched {
                        Ok(fetched) => {
                            for (hit, source) in batch.hits.iter().zip(fetched.sources) {
                                hits.push(SearchHit {
                                    index: cursor.index_name.clone(),
                                    id: hit.id.clone(),
                                    score: hit.score,
                                    source,
                                });
                            }
                        }
                        Err(err) => failures.push(ShardFailure {
                            index: cursor.index_name.clone(),
                            shard: cursor.shard_id.shard,
                            node: Some(cursor.node_id.clone()),
                            reason: err.to_string(),
                        }),
                    }
                }
                Err(err) => failures.push(ShardFailure {
                    index: cursor.index_name.clone(),
                    shard: cursor.shard_id.shard,
                    node: Some(cursor.node_id.clone()),
                    reason: err.to_string(),
                }),
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

        let total = cursors.len() as u32;
        let failed = failures.len() as u32;
        Ok(SearchResponse {
            took_ms: started.elapsed().as_millis() as u64,
            max_score: hits.first().map(|h| h.score),
            hits,
            total_hits,
            aggregations: Vec::new(),
            shards: ShardStatistics {
                total,
                successful: total - failed,
                failed,
                failures,
            },
            scroll_id: Some(scroll_id.to_string()),
        })
    }

    /// Release every shard cursor of a scroll. Returns how many cleared.
    pub async fn clear_scroll(&self, scroll_id: &str) -> Result<usize> {
        let cursors = decode_scroll_id(scroll_id)?;
        let clears = cursors.iter().map(|cursor| async move {
            let result: Result<ShardScrollClearResponse> = send_typed(
                self.transport.as_ref(),
                &cursor.address,
                SHARD_SCROLL_CLEAR_ACTION,
                &ShardScrollClearRequest {
                    shard_id: cursor.shard_id.clone(),
                    cursor: cursor.cursor.clone(),
                },
                Duration::from_millis(DEFAULT_SHARD_TIMEOUT_MS),
            )
            .await;
            matches!(result, Ok(r) if r.cleared)
        });
        Ok(futures::future::join_all(clears)
            .await
            .into_iter()
            .filter(|cleared| *cleared)
            .count())
    }

    async fn fetch_phase(
        &self,
        successes: &[(ShardTarget, ShardQueryResult)],
        window: &[(usize, String, f32)],
    ) -> Result<Vec<SearchHit>> {
        // Group surviving hits by the shard that owns them.
        let mut by_shard: HashMap<usize, Vec<String>> = HashMap::new();
        for (position, id, _) in window {
            by_shard.entry(*position).or_default().push(id.clone());
        }

        let fetches = by_shard.iter().map(|(position, ids)| {
            let (target, result) = &successes[*position];
            let ids = ids.clone();
            async move {
                let fetched: Result<ShardFetchResult> = send_typed(
                    self.transport.as_ref(),
                    &target.address,
                    SHARD_FETCH_ACTION,
                    &ShardFetchRequest {
                        shard_id: target.shard_id.clone(),
                        ids: ids.clone(),
                        scroll_cursor: result.scroll_cursor.clone(),
                    },
                    Duration::from_millis(DEFAULT_SHARD_TIMEOUT_MS),
                )
                .await;
                (*position, ids, fetched)
            }
        });

        let mut sources: HashMap<(usize, String), Option<Value>> = HashMap::new();
        for (position, ids, fetched) in futures::future::join_all(fetches).await {
            match fetched {
                Ok(result) => {
                    for (id, source) in ids.into_iter().zip(result.sources) {
                        sources.insert((position, id), source);
                    }
                }
                Err(err) => {
                    debug!(error = %err, "fetch phase shard failure");
                }
            }
        }

        Ok(window
            .iter()
            .map(|(position, id, score)| SearchHit {
                index: successes[*position].0.index_name.clone(),
                id: id.clone(),
                score: *score,
                source: sources.remove(&(*position, id.clone())).flatten(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scroll_id_roundtrip() {
        let cursors = vec![ScrollCursor {
            index_name: "logs".to_string(),
            shard_id: ShardId::new("uuid", 2),
            node_id: "n1".to_string(),
            address: "local://n1".to_string(),
            cursor: "cursor-token".to_string(),
        }];
        let encoded = encode_scroll_id(&cursors).unwrap();
        let decoded = decode_scroll_id(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].shard_id.shard, 2);
        assert_eq!(decoded[0].cursor, "cursor-token");
    }

    #[test]
    fn test_malformed_scroll_id_rejected() {
        assert!(decode_scroll_id("not base64 at all!!!").is_err());
        let garbage = base64::engine::general_purpose::STANDARD.encode(b"junk");
        assert!(decode_scroll_id(&garbage).is_err());
    }
}
