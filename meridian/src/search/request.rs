//! Search request/response shapes shared by the shard phases and the
//! cluster-level coordinator.

use crate::aggregations::{AggregationPartial, AggregationRequest};
use crate::search::query::SearchQuery;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

fn default_size() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: SearchQuery,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default)]
    pub from: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<AggregationRequest>,
    /// Per-request deadline; a shard past it reports a timeout failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Only deterministic requests are query-cache eligible. Callers must
    /// clear this for requests whose results depend on evaluation time.
    #[serde(default = "default_true")]
    pub deterministic: bool,
    /// Scroll keep-alive in milliseconds; presence turns this request into a
    /// scroll initiation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_keep_alive_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl SearchRequest {
    pub fn new(query: SearchQuery) -> SearchRequest {
        SearchRequest {
            query,
            size: default_size(),
            from: 0,
            aggregations: Vec::new(),
            timeout_ms: None,
            deterministic: true,
            scroll_keep_alive_ms: None,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_aggregations(mut self, aggregations: Vec<AggregationRequest>) -> Self {
        self.aggregations = aggregations;
        self
    }

    /// Stable fingerprint of the request body, for the shard query cache.
    pub fn fingerprint(&self) -> String {
        // serde_json serializes struct fields in declaration order, so equal
        // requests produce equal fingerprints.
        let canonical = serde_json::to_vec(self).expect("request is always serializable");
        hex::encode(Sha256::digest(&canonical))
    }

    pub fn cache_eligible(&self) -> bool {
        self.deterministic && self.scroll_keep_alive_ms.is_none()
    }
}

/// One hit as returned by the query phase: just enough to merge globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSearchHit {
    pub id: String,
    pub score: f32,
}

/// A shard's answer to the query phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardQueryResult {
    pub shard: u32,
    pub hits: Vec<ShardSearchHit>,
    pub total_hits: u64,
    pub max_score: Option<f32>,
    pub aggregations: Vec<AggregationPartial>,
    /// Cursor token when the request opened a scroll on this shard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_cursor: Option<String>,
}

/// A shard's answer to the fetch phase: sources for the surviving hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFetchResult {
    pub shard: u32,
    /// Parallel to the requested ids; `None` for ids that vanished between
    /// the phases.
    pub sources: Vec<Option<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_discriminating() {
        let a = SearchRequest::new(SearchQuery::term("tag", "x"));
        let b = SearchRequest::new(SearchQuery::term("tag", "x"));
        let c = SearchRequest::new(SearchQuery::term("tag", "y"));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());

        let sized = SearchRequest::new(SearchQuery::term("tag", "x")).with_size(5);
        assert_ne!(a.fingerprint(), sized.fingerprint());
    }

    #[test]
    fn test_cache_eligibility() {
        let mut request = SearchRequest::new(SearchQuery::match_all());
        assert!(request.cache_eligible());
        request.deterministic = false;
        assert!(!request.cache_eligible());

        let mut scroll = SearchRequest::new(SearchQuery::match_all());
        scroll.scroll_keep_alive_ms = Some(30_000);
        assert!(!scroll.cache_eligible());
    }

    #[test]
    fn test_request_serde_defaults() {
        let json = r#"{"query": "match_all"}"#;
        let request: SearchRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.size, 10);
        assert_eq!(request.from, 0);
        assert!(request.deterministic);
    }
}
