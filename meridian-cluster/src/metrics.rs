//! Cluster observability metrics.
//!
//! Prometheus-compatible metrics for the cluster layer: publication and
//! election activity, replication outcomes, search phases, recovery volume,
//! and the health rollup. The recorder itself is installed by the server
//! binary.

use crate::health::ClusterHealth;
use std::time::Duration;

/// Record a committed cluster-state publication.
pub fn record_publication(version: u64, nodes: usize, duration: Duration) {
    metrics::counter!("meridian_cluster_publications_total").increment(1);
    metrics::gauge!("meridian_cluster_state_version").set(version as f64);
    metrics::gauge!("meridian_cluster_publication_targets").set(nodes as f64);
    metrics::histogram!("meridian_cluster_publication_seconds").record(duration.as_secs_f64());
}

/// Record an election outcome.
pub fn record_election(outcome: &str) {
    metrics::counter!(
        "meridian_elections_total",
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Record a primary-side write batch.
pub fn record_write(op_count: usize, outcome: &str) {
    metrics::counter!(
        "meridian_write_operations_total",
        "outcome" => outcome.to_string(),
    )
    .increment(op_count as u64);
}

/// Record a replica fan-out result.
pub fn record_replication(outcome: &str) {
    metrics::counter!(
        "meridian_replication_sends_total",
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Record one phase of a search.
pub fn record_search_phase(phase: &str, duration: Duration) {
    metrics::histogram!(
        "meridian_search_phase_seconds",
        "phase" => phase.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record shard-level search failures reported in a response.
pub fn record_shard_failures(count: u32) {
    if count > 0 {
        metrics::counter!("meridian_search_shard_failures_total").increment(count as u64);
    }
}

/// Record recovery traffic.
pub fn record_recovery(files: usize, reused: usize, bytes: u64, ops: u64) {
    metrics::counter!("meridian_recovery_files_total").increment(files as u64);
    metrics::counter!("meridian_recovery_files_reused_total").increment(reused as u64);
    metrics::counter!("meridian_recovery_bytes_total").increment(bytes);
    metrics::counter!("meridian_recovery_ops_replayed_total").increment(ops);
}

/// Export the health rollup as gauges.
pub fn update_cluster_health(health: &ClusterHealth) {
    let status_value = match health.status.as_str() {
        "green" => 0.0,
        "yellow" => 1.0,
        _ => 2.0,
    };
    metrics::gauge!("meridian_cluster_status").set(status_value);
    metrics::gauge!("meridian_cluster_nodes").set(health.number_of_nodes as f64);
    metrics::gauge!("meridian_active_shards").set(health.active_shards as f64);
    metrics::gauge!("meridian_unassigned_shards").set(health.unassigned_shards as f64);
    metrics::gauge!("meridian_relocating_shards").set(health.relocating_shards as f64);
    metrics::gauge!("meridian_initializing_shards").set(health.initializing_shards as f64);
}

/// Record a tripped or served transport request.
pub fn record_transport_request(action: &str, outcome: &str) {
    metrics::counter!(
        "meridian_transport_requests_total",
        "action" => action.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}
