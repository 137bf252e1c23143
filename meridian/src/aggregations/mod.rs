//! Faceted aggregations.
//!
//! Each shard computes a serializable *partial* state over the documents
//! matching the query; the coordinator reduces partials with a
//! commutative-associative merge and finalizes them into client-facing
//! results. Terms aggregations bound their per-shard bucket count with the
//! usual shard-size heuristic, trading a little accuracy for memory.

pub mod collector;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to aggregate, per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Terms {
        field: String,
        size: usize,
        /// Per-shard bucket budget; defaults to `size * 3 / 2 + 10`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shard_size: Option<usize>,
    },
    Sum { field: String },
    Min { field: String },
    Max { field: String },
    Avg { field: String },
    ValueCount { field: String },
}

impl AggregationKind {
    pub fn field(&self) -> &str {
        match self {
            AggregationKind::Terms { field, .. }
            | AggregationKind::Sum { field }
            | AggregationKind::Min { field }
            | AggregationKind::Max { field }
            | AggregationKind::Avg { field }
            | AggregationKind::ValueCount { field } => field,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRequest {
    pub name: String,
    pub kind: AggregationKind,
}

impl AggregationRequest {
    pub fn terms(name: impl Into<String>, field: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            kind: AggregationKind::Terms {
                field: field.into(),
                size,
                shard_size: None,
            },
        }
    }

    pub fn sum(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AggregationKind::Sum { field: field.into() },
        }
    }

    pub fn effective_shard_size(&self) -> usize {
        match &self.kind {
            AggregationKind::Terms { size, shard_size, .. } => {
                shard_size.unwrap_or(size * 3 / 2 + 10)
            }
            _ => 0,
        }
    }
}

/// Per-shard partial aggregation state. Merging two partials of the same
/// name/kind is commutative and associative, so the coordinator can reduce
/// shard responses in any arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPartial {
    Terms {
        name: String,
        counts: BTreeMap<String, u64>,
    },
    Sum { name: String, sum: f64 },
    Min { name: String, min: Option<f64> },
    Max { name: String, max: Option<f64> },
    Avg { name: String, sum: f64, count: u64 },
    ValueCount { name: String, count: u64 },
}

impl AggregationPartial {
    pub fn empty_for(request: &AggregationRequest) -> AggregationPartial {
        let name = request.name.clone();
        match &request.kind {
            AggregationKind::Terms { .. } => AggregationPartial::Terms {
                name,
                counts: BTreeMap::new(),
            },
            AggregationKind::Sum { .. } => AggregationPartial::Sum { name, sum: 0.0 },
            AggregationKind::Min { .. } => AggregationPartial::Min { name, min: None },
            AggregationKind::Max { .. } => AggregationPartial::Max { name, max: None },
            AggregationKind::Avg { .. } => AggregationPartial::Avg {
                name,
                sum: 0.0,
                count: 0,
            },
            AggregationKind::ValueCount { .. } => {
                AggregationPartial::ValueCount { name, count: 0 }
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AggregationPartial::Terms { name, .. }
            | AggregationPartial::Sum { name, .. }
            | AggregationPartial::Min { name, .. }
            | AggregationPartial::Max { name, .. }
            | AggregationPartial::Avg { name, .. }
            | AggregationPartial::ValueCount { name, .. } => name,
        }
    }

    /// Fold `other` into `self`. sum → add, max → max, terms → merge bucket
    /// counts by key.
    pub fn merge(&mut self, other: &AggregationPartial) -> Result<()> {
        match (self, other) {
            (
                AggregationPartial::Terms { counts, .. },
                AggregationPartial::Terms { counts: theirs, .. },
            ) => {
                for (key, count) in theirs {
                    *counts.entry(key.clone()).or_insert(0) += count;
                }
                Ok(())
            }
            (
                AggregationPartial::Sum { sum, .. },
                AggregationPartial::Sum { sum: theirs, .. },
            ) => {
                *sum += theirs;
                Ok(())
            }
            (
                AggregationPartial::Min { min, .. },
                AggregationPartial::Min { min: theirs, .. },
            ) => {
                *min = match (*min, *theirs) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                Ok(())
            }
            (
                AggregationPartial::Max { max, .. },
                AggregationPartial::Max { max: theirs, .. },
            ) => {
                *max = match (*max, *theirs) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                Ok(())
            }
            (
                AggregationPartial::Avg { sum, count, .. },
                AggregationPartial::Avg {
                    sum: s2, count: c2, ..
                },
            ) => {
                *sum += s2;
                *count += c2;
                Ok(())
            }
            (
                AggregationPartial::ValueCount { count, .. },
                AggregationPartial::ValueCount { count: c2, .. },
            ) => {
                *count += c2;
                Ok(())
            }
            (me, other) => Err(Error::Validation(format!(
                "cannot merge aggregation partial [{}] with mismatched kind [{}]",
                me.name(),
                other.name()
            ))),
        }
    }

    /// Bound a terms partial to the shard-size budget, keeping the highest
    /// counts.
    pub fn truncate_terms(&mut self, shard_size: usize) {
        if let AggregationPartial::Terms { counts, .. } = self {
            if counts.len() <= shard_size {
                return;
            }
            let mut entries: Vec<(String, u64)> =
                counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            entries.truncate(shard_size);
            *counts = entries.into_iter().collect();
        }
    }
}

/// A finalized bucket for a terms aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub key: String,
    pub doc_count: u64,
}

/// Client-facing aggregation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationResult {
    Terms { buckets: Vec<Bucket> },
    Value { value: Option<f64> },
}

/// Reduce per-shard partials (outer: shards; inner: one partial per request,
/// in request order) into one partial per request.
pub fn reduce(
    requests: &[AggregationRequest],
    shard_partials: Vec<Vec<AggregationPartial>>,
) -> Result<Vec<AggregationPartial>> {
    let mut reduced: Vec<AggregationPartial> =
        requests.iter().map(AggregationPartial::empty_for).collect();
    for shard in &shard_partials {
        if shard.len() != requests.len() {
            return Err(Error::Validation(format!(
                "shard returned {} aggregation partials, expected {}",
                shard.len(),
                requests.len()
            )));
        }
        for (acc, partial) in reduced.iter_mut().zip(shard) {
            acc.merge(partial)?;
        }
    }
    Ok(reduced)
}

/// Turn reduced partials into final results.
pub fn finalize(
    requests: &[AggregationRequest],
    reduced: Vec<AggregationPartial>,
) -> Vec<(String, AggregationResult)> {
    requests
        .iter()
        .zip(reduced)
        .map(|(request, partial)| {
            let result = match (&request.kind, partial) {
                (AggregationKind::Terms { size, .. }, AggregationPartial::Terms { counts, .. }) => {
                    let mut buckets: Vec<Bucket> = counts
                        .into_iter()
                        .map(|(key, doc_count)| Bucket { key, doc_count })
                        .collect();
                    buckets.sort_by(|a, b| {
                        b.doc_count.cmp(&a.doc_count).then_with(|| a.key.cmp(&b.key))
                    });
                    buckets.truncate(*size);
                    AggregationResult::Terms { buckets }
                }
                (_, AggregationPartial::Sum { sum, .. }) => AggregationResult::Value {
                    value: Some(sum),
                },
                (_, AggregationPartial::Min { min, .. }) => AggregationResult::Value { value: min },
                (_, AggregationPartial::Max { max, .. }) => AggregationResult::Value { value: max },
                (_, AggregationPartial::Avg { sum, count, .. }) => AggregationResult::Value {
                    value: (count > 0).then(|| sum / count as f64),
                },
                (_, AggregationPartial::ValueCount { count, .. }) => AggregationResult::Value {
                    value: Some(count as f64),
                },
                (_, AggregationPartial::Terms { .. }) => {
                    AggregationResult::Terms { buckets: Vec::new() }
                }
            };
            (request.name.clone(), result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms_partial(name: &str, pairs: &[(&str, u64)]) -> AggregationPartial {
        AggregationPartial::Terms {
            name: name.to_string(),
            counts: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    #[test]
    fn test_terms_merge_by_key() {
        let mut a = terms_partial("tags", &[("error", 3), ("info", 1)]);
        let b = terms_partial("tags", &[("error", 2), ("warn", 5)]);
        a.merge(&b).unwrap();
        match a {
            AggregationPartial::Terms { counts, .. } => {
                assert_eq!(counts["error"], 5);
                assert_eq!(counts["warn"], 5);
                assert_eq!(counts["info"], 1);
            }
            _ => panic!("expected terms"),
        }
    }

    #[test]
    fn test_merge_is_commutative() {
        let base = terms_partial("t", &[("a", 1), ("b", 2)]);
        let other = terms_partial("t", &[("b", 3), ("c", 4)]);

        let mut left = base.clone();
        left.merge(&other).unwrap();
        let mut right = other.clone();
        right.merge(&base).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn test_min_max_merge_handles_empty_shards() {
        let mut min = AggregationPartial::Min {
            name: "m".into(),
            min: None,
        };
        min.merge(&AggregationPartial::Min {
            name: "m".into(),
            min: Some(3.0),
        })
        .unwrap();
        min.merge(&AggregationPartial::Min {
            name: "m".into(),
            min: None,
        })
        .unwrap();
        assert_eq!(
            min,
            AggregationPartial::Min {
                name: "m".into(),
                min: Some(3.0)
            }
        );
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut sum = AggregationPartial::Sum {
            name: "s".into(),
            sum: 1.0,
        };
        let err = sum
            .merge(&AggregationPartial::ValueCount {
                name: "s".into(),
                count: 2,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_reduce_and_finalize_avg() {
        let requests = vec![AggregationRequest {
            name: "avg_price".into(),
            kind: AggregationKind::Avg {
                field: "price".into(),
            },
        }];
        let shards = vec![
            vec![AggregationPartial::Avg {
                name: "avg_price".into(),
                sum: 10.0,
                count: 2,
            }],
            vec![AggregationPartial::Avg {
                name: "avg_price".into(),
                sum: 20.0,
                count: 3,
            }],
        ];
        let reduced = reduce(&requests, shards).unwrap();
        let results = finalize(&requests, reduced);
        assert_eq!(results[0].0, "avg_price");
        match &results[0].1 {
            AggregationResult::Value { value } => assert_eq!(*value, Some(6.0)),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn test_finalize_terms_sorts_and_truncates() {
        let requests = vec![AggregationRequest::terms("tags", "tag", 2)];
        let shards = vec![
            vec![terms_partial("tags", &[("a", 1), ("b", 7), ("c", 3)])],
            vec![terms_partial("tags", &[("a", 9), ("c", 1)])],
        ];
        let reduced = reduce(&requests, shards).unwrap();
        let results = finalize(&requests, reduced);
        match &results[0].1 {
            AggregationResult::Terms { buckets } => {
                assert_eq!(buckets.len(), 2);
                assert_eq!(buckets[0].key, "a");
                assert_eq!(buckets[0].doc_count, 10);
                assert_eq!(buckets[1].key, "b");
            }
            _ => panic!("expected terms"),
        }
    }

    #[test]
    fn test_shard_size_heuristic() {
        let request = AggregationRequest::terms("t", "f", 10);
        assert_eq!(request.effective_shard_size(), 25);

        let mut partial = terms_partial(
            "t",
            &[("a", 10), ("b", 9), ("c", 8), ("d", 1)],
        );
        partial.truncate_terms(2);
        match partial {
            AggregationPartial::Terms { counts, .. } => {
                assert_eq!(counts.len(), 2);
                assert!(counts.contains_key("a") && counts.contains_key("b"));
            }
            _ => panic!("expected terms"),
        }
    }

    #[test]
    fn test_reduce_rejects_ragged_shard_response() {
        let requests = vec![AggregationRequest::terms("t", "f", 5)];
        let shards = vec![vec![]];
        assert!(reduce(&requests, shards).is_err());
    }
}
