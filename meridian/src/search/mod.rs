//! Shard-level search execution: the query and fetch phases of the
//! two-phase search, scroll continuation, and the query cache in front of
//! the query phase.

pub mod cache;
pub mod query;
pub mod request;
pub mod scroll;

use crate::aggregations::collector::AggCollector;
use crate::aggregations::AggregationPartial;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::mapping::FieldRegistry;
use cache::{CacheKey, QueryCache};
use request::{SearchRequest, ShardFetchResult, ShardQueryResult, ShardSearchHit};
use scroll::ScrollRegistry;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tantivy::collector::{Count, TopDocs};
use tantivy::query::TermQuery;
use tantivy::schema::{IndexRecordOption, OwnedValue};
use tantivy::{Searcher, TantivyDocument, Term};
use tracing::debug;

const DEFAULT_CACHE_BYTES: u64 = 8 * 1024 * 1024;

/// Per-shard search state: the query cache and open scroll contexts.
pub struct ShardSearchService {
    cache: QueryCache,
    scrolls: ScrollRegistry,
}

impl Default for ShardSearchService {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_BYTES)
    }
}

impl ShardSearchService {
    pub fn new(cache_max_bytes: u64) -> ShardSearchService {
        ShardSearchService {
            cache: QueryCache::new(cache_max_bytes),
            scrolls: ScrollRegistry::default(),
        }
    }

    /// Phase 1: top-K ids and scores plus aggregation partials, against a
    /// point-in-time searcher.
    pub fn query_phase(
        &self,
        engine: &Engine,
        shard: u32,
        request: &SearchRequest,
    ) -> Result<ShardQueryResult> {
        let deadline = request
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        if let Some(keep_alive_ms) = request.scroll_keep_alive_ms {
            return self.open_scroll(engine, shard, request, keep_alive_ms);
        }

        let generation = engine.reader_generation();
        let key = CacheKey {
            reader_generation: generation,
            fingerprint: request.fingerprint(),
        };
        if request.cache_eligible() {
            self.cache.purge_other_generations(generation);
            if let Some(cached) = self.cache.get(&key) {
                debug!(shard, "query cache hit");
                return Ok((*cached).clone());
            }
        }

        let searcher = engine.searcher();
        let registry = engine.registry();
        let limit = request.from + request.size;
        let (hits, total_hits) = execute_query(
            &searcher,
            registry,
            engine,
            &request.query,
            limit,
            deadline,
        )?;

        let aggregations = if request.aggregations.is_empty() {
            Vec::new()
        } else {
            run_aggregations(&searcher, registry, engine, request, deadline)?
        };

        let max_score = hits
            .iter()
            .map(|h| h.score)
            .max_by(|a, b| a.total_cmp(b));
        let result = ShardQueryResult {
            shard,
            hits,
            total_hits,
            max_score,
            aggregations,
            scroll_cursor: None,
        };
        if request.cache_eligible() {
            self.cache.put(key, Arc::new(result.clone()));
        }
        Ok(result)
    }

    /// Phase 2: resolve sources for the hits that survived the global merge.
    pub fn fetch_phase(
        &self,
        engine: &Engine,
        shard: u32,
        ids: &[String],
    ) -> Result<ShardFetchResult> {
        let searcher = engine.searcher();
        let registry = engine.registry();
        let sources = ids
            .iter()
            .map(|id| lookup_source(&searcher, registry, id))
            .collect::<Result<Vec<_>>>()?;
        Ok(ShardFetchResult { shard, sources })
    }

    /// Next batch for an open scroll: same pinned snapshot, advancing the
    /// cursor.
    pub fn scroll_next(
        &self,
        engine: &Engine,
        shard: u32,
        token: &str,
    ) -> Result<ShardQueryResult> {
        let registry = engine.registry();
        self.scrolls.with_context(token, |context| {
            let limit = context.offset + context.size;
            let (mut hits, total_hits) = execute_query(
                &context.searcher,
                registry,
                engine,
                &context.query,
                limit,
                None,
            )?;
            hits.drain(..context.offset.min(hits.len()));
            context.offset += hits.len();
            let max_score = hits.iter().map(|h| h.score).max_by(|a, b| a.total_cmp(b));
            Ok(ShardQueryResult {
                shard,
                hits,
                total_hits,
                max_score,
                aggregations: Vec::new(),
                scroll_cursor: Some(token.to_string()),
            })
        })
    }

    /// Fetch sources from the scroll's pinned snapshot, so a document
    /// deleted after the scroll opened is still returned.
    pub fn scroll_fetch(
        &self,
        engine: &Engine,
        shard: u32,
        token: &str,
        ids: &[String],
    ) -> Result<ShardFetchResult> {
        let registry = engine.registry();
        self.scrolls.with_context(token, |context| {
            let sources = ids
                .iter()
                .map(|id| lookup_source(&context.searcher, registry, id))
                .collect::<Result<Vec<_>>>()?;
            Ok(ShardFetchResult { shard, sources })
        })
    }

    pub fn clear_scroll(&self, token: &str) -> bool {
        self.scrolls.clear(token)
    }

    /// Periodic maintenance: drop idle scroll contexts.
    pub fn expire_scrolls(&self) -> usize {
        self.scrolls.expire_idle()
    }

    pub fn open_scrolls(&self) -> usize {
        self.scrolls.len()
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    fn open_scroll(
        &self,
        engine: &Engine,
        shard: u32,
        request: &SearchRequest,
        keep_alive_ms: u64,
    ) -> Result<ShardQueryResult> {
        let searcher = engine.searcher();
        let token = self.scrolls.create(
            searcher,
            request.query.clone(),
            request.size,
            Duration::from_millis(keep_alive_ms),
        );
        self.scroll_next(engine, shard, &token)
    }
}

fn execute_query(
    searcher: &Searcher,
    registry: &FieldRegistry,
    engine: &Engine,
    query: &query::SearchQuery,
    limit: usize,
    deadline: Option<Instant>,
) -> Result<(Vec<ShardSearchHit>, u64)> {
    check_deadline(deadline)?;
    let tantivy_query = query.to_tantivy(registry, engine.index())?;
    let (top, total) = searcher.search(
        &tantivy_query,
        &(TopDocs::with_limit(limit.max(1)), Count),
    )?;
    check_deadline(deadline)?;

    let mut hits = Vec::with_capacity(top.len());
    for (score, addr) in top {
        let doc: TantivyDocument = searcher.doc(addr)?;
        let id = match doc.get_first(registry.id_field) {
            Some(OwnedValue::Str(id)) => id.clone(),
            _ => continue,
        };
        hits.push(ShardSearchHit { id, score });
    }
    Ok((hits, total as u64))
}

fn run_aggregations(
    searcher: &Searcher,
    registry: &FieldRegistry,
    engine: &Engine,
    request: &SearchRequest,
    deadline: Option<Instant>,
) -> Result<Vec<AggregationPartial>> {
    let collector = AggCollector::new(request.aggregations.clone(), registry, deadline)?;
    let tantivy_query = request.query.to_tantivy(registry, engine.index())?;
    let partials = searcher.search(&tantivy_query, &collector)?;
    if collector.timed_out() {
        return Err(Error::SearchTimeout);
    }
    Ok(partials)
}

fn lookup_source(
    searcher: &Searcher,
    registry: &FieldRegistry,
    id: &str,
) -> Result<Option<Value>> {
    let term = Term::from_field_text(registry.id_field, id);
    let query = TermQuery::new(term, IndexRecordOption::Basic);
    let top = searcher.search(&query, &TopDocs::with_limit(1))?;
    let Some((_score, addr)) = top.first() else {
        return Ok(None);
    };
    let doc: TantivyDocument = searcher.doc(*addr)?;
    match doc.get_first(registry.source_field) {
        Some(OwnedValue::Bytes(bytes)) => Ok(Some(serde_json::from_slice(bytes)?)),
        _ => Ok(None),
    }
}

fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(Error::SearchTimeout),
        _ => Ok(()),
    }
}
