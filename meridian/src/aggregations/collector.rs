//! Shard-level aggregation execution over tantivy fast fields.
//!
//! One pass over the matching doc ids per segment: numeric metrics read the
//! segment's columnar values, terms aggregations count term ordinals and
//! resolve them to strings at harvest time. The search deadline is checked
//! at every segment boundary; a segment entered past the deadline collects
//! nothing and flags the whole pass as timed out.

use crate::aggregations::{
    reduce, AggregationKind, AggregationPartial, AggregationRequest,
};
use crate::error::{Error, Result};
use crate::mapping::{FieldRegistry, FieldType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tantivy::collector::{Collector, SegmentCollector};
use tantivy::columnar::StrColumn;
use tantivy::fastfield::Column;
use tantivy::{DocId, Score, SegmentOrdinal, SegmentReader};

#[derive(Clone, Copy)]
enum MetricOp {
    Sum,
    Min,
    Max,
    Avg,
    Count,
}

enum FieldPlan {
    Terms { field: String, shard_size: usize },
    MetricI64 { field: String, op: MetricOp },
    MetricF64 { field: String, op: MetricOp },
}

pub struct AggCollector {
    requests: Arc<Vec<AggregationRequest>>,
    plans: Arc<Vec<FieldPlan>>,
    deadline: Option<Instant>,
    timed_out: Arc<AtomicBool>,
}

impl AggCollector {
    /// Validate the requests against the mapping and build the execution
    /// plan. Terms wants a keyword field; metrics want a numeric one.
    pub fn new(
        requests: Vec<AggregationRequest>,
        registry: &FieldRegistry,
        deadline: Option<Instant>,
    ) -> Result<AggCollector> {
        let mut plans = Vec::with_capacity(requests.len());
        for request in &requests {
            let field = request.kind.field().to_string();
            let field_type = registry.field_type(&field).ok_or_else(|| {
                Error::Validation(format!(
                    "aggregation [{}] references unmapped field [{}]",
                    request.name, field
                ))
            })?;
            let plan = match (&request.kind, field_type) {
                (AggregationKind::Terms { .. }, FieldType::Keyword) => FieldPlan::Terms {
                    field,
                    shard_size: request.effective_shard_size(),
                },
                (AggregationKind::Terms { .. }, other) => {
                    return Err(Error::Validation(format!(
                        "terms aggregation [{}] requires a keyword field, [{}] is {:?}",
                        request.name, field, other
                    )))
                }
                (kind, FieldType::Long | FieldType::Date) => FieldPlan::MetricI64 {
                    field,
                    op: metric_op(kind),
                },
                (kind, FieldType::Double) => FieldPlan::MetricF64 {
                    field,
                    op: metric_op(kind),
                },
                (_, other) => {
                    return Err(Error::Validation(format!(
                        "metric aggregation [{}] requires a numeric field, [{}] is {:?}",
                        request.name, field, other
                    )))
                }
            };
            plans.push(plan);
        }
        Ok(AggCollector {
            requests: Arc::new(requests),
            plans: Arc::new(plans),
            deadline,
            timed_out: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

fn metric_op(kind: &AggregationKind) -> MetricOp {
    match kind {
        AggregationKind::Sum { .. } => MetricOp::Sum,
        AggregationKind::Min { .. } => MetricOp::Min,
        AggregationKind::Max { .. } => MetricOp::Max,
        AggregationKind::Avg { .. } => MetricOp::Avg,
        AggregationKind::ValueCount { .. } => MetricOp::Count,
        AggregationKind::Terms { .. } => unreachable!("terms has no metric op"),
    }
}

enum NumericColumn {
    I64(Column<i64>),
    F64(Column<f64>),
}

impl NumericColumn {
    fn first(&self, doc: DocId) -> Option<f64> {
        match self {
            NumericColumn::I64(col) => col.first(doc).map(|v| v as f64),
            NumericColumn::F64(col) => col.first(doc),
        }
    }
}

enum SegmentState {
    Terms {
        column: Option<StrColumn>,
        ord_counts: HashMap<u64, u64>,
        shard_size: usize,
    },
    Metric {
        column: Option<NumericColumn>,
        op: MetricOp,
        sum: f64,
        min: Option<f64>,
        max: Option<f64>,
        count: u64,
    },
}

pub struct AggSegmentCollector {
    requests: Arc<Vec<AggregationRequest>>,
    states: Vec<SegmentState>,
    enabled: bool,
}

impl Collector for AggCollector {
    type Fruit = Vec<AggregationPartial>;
    type Child = AggSegmentCollector;

    fn for_segment(
        &self,
        _segment_local_id: SegmentOrdinal,
        segment: &SegmentReader,
    ) -> tantivy::Result<AggSegmentCollector> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.timed_out.store(true, Ordering::SeqCst);
                return Ok(AggSegmentCollector {
                    requests: Arc::clone(&self.requests),
                    states: Vec::new(),
                    enabled: false,
                });
            }
        }

        let mut states = Vec::with_capacity(self.plans.len());
        for plan in self.plans.iter() {
            let state = match plan {
                FieldPlan::Terms { field, shard_size } => SegmentState::Terms {
                    column: segment.fast_fields().str(field)?,
                    ord_counts: HashMap::new(),
                    shard_size: *shard_size,
                },
                FieldPlan::MetricI64 { field, op } => SegmentState::Metric {
                    column: segment
                        .fast_fields()
                        .i64(field)
                        .ok()
                        .map(NumericColumn::I64),
                    op: *op,
                    sum: 0.0,
                    min: None,
                    max: None,
                    count: 0,
                },
                FieldPlan::MetricF64 { field, op } => SegmentState::Metric {
                    column: segment
                        .fast_fields()
                        .f64(field)
                        .ok()
                        .map(NumericColumn::F64),
                    op: *op,
                    sum: 0.0,
                    min: None,
                    max: None,
                    count: 0,
                },
            };
            states.push(state);
        }
        Ok(AggSegmentCollector {
            requests: Arc::clone(&self.requests),
            states,
            enabled: true,
        })
    }

    fn requires_scoring(&self) -> bool {
        false
    }

    fn merge_fruits(
        &self,
        segment_fruits: Vec<Vec<AggregationPartial>>,
    ) -> tantivy::Result<Vec<AggregationPartial>> {
        let merged = reduce(&self.requests, segment_fruits)
            .map_err(|e| tantivy::TantivyError::InvalidArgument(e.to_string()))?;
        Ok(merged)
    }
}

impl SegmentCollector for AggSegmentCollector {
    type Fruit = Vec<AggregationPartial>;

    fn collect(&mut self, doc: DocId, _score: Score) {
        if !self.enabled {
            return;
        }
        for state in &mut self.states {
            match state {
                SegmentState::Terms {
                    column: Some(column),
                    ord_counts,
                    ..
                } => {
                    for ord in column.term_ords(doc) {
                        *ord_counts.entry(ord).or_insert(0) += 1;
                    }
                }
                SegmentState::Metric {
                    column: Some(column),
                    op,
                    sum,
                    min,
                    max,
                    count,
                } => {
                    if let Some(value) = column.first(doc) {
                        match op {
                            MetricOp::Sum => *sum += value,
                            MetricOp::Avg => {
                                *sum += value;
                                *count += 1;
                            }
                            MetricOp::Count => *count += 1,
                            MetricOp::Min => {
                                *min = Some(min.map_or(value, |m| m.min(value)));
                            }
                            MetricOp::Max => {
                                *max = Some(max.map_or(value, |m| m.max(value)));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn harvest(self) -> Vec<AggregationPartial> {
        if !self.enabled {
            return self
                .requests
                .iter()
                .map(AggregationPartial::empty_for)
                .collect();
        }
        self.requests
            .iter()
            .zip(self.states)
            .map(|(request, state)| harvest_one(request, state))
            .collect()
    }
}

fn harvest_one(request: &AggregationRequest, state: SegmentState) -> AggregationPartial {
    let name = request.name.clone();
    match state {
        SegmentState::Terms {
            column,
            ord_counts,
            shard_size,
        } => {
            let mut partial = AggregationPartial::Terms {
                name,
                counts: Default::default(),
            };
            if let (Some(column), AggregationPartial::Terms { counts, .. }) =
                (column, &mut partial)
            {
                let mut key = String::new();
                for (ord, count) in ord_counts {
                    key.clear();
                    match column.ord_to_str(ord, &mut key) {
                        Ok(true) => {
                            *counts.entry(key.clone()).or_insert(0) += count;
                        }
                        _ => continue,
                    }
                }
            }
            partial.truncate_terms(shard_size);
            partial
        }
        SegmentState::Metric {
            op,
            sum,
            min,
            max,
            count,
            ..
        } => match op {
            MetricOp::Sum => AggregationPartial::Sum { name, sum },
            MetricOp::Min => AggregationPartial::Min { name, min },
            MetricOp::Max => AggregationPartial::Max { name, max },
            MetricOp::Avg => AggregationPartial::Avg { name, sum, count },
            MetricOp::Count => AggregationPartial::ValueCount { name, count },
        },
    }
}
