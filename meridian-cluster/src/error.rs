//! Cluster-level error taxonomy.
//!
//! Errors cross the wire inside response frames, so the enum is
//! serializable. `retryable()` drives the internal retry loops: transient
//! conditions are retried until the request deadline, terminal ones surface
//! immediately.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ClusterError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Version conflict: {0}")]
    VersionConflict(String),

    #[error("Cluster block: {0}")]
    ClusterBlock(String),

    #[error("Unavailable shards: {0}")]
    UnavailableShards(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Circuit breaking: {0}")]
    CircuitBreaking(String),

    #[error("Rejected execution: {0}")]
    RejectedExecution(String),

    #[error("Shard failure: {0}")]
    ShardFailure(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Incompatible protocol version: {0}")]
    IncompatibleVersion(String),

    #[error("Master not discovered: {0}")]
    MasterNotDiscovered(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Document missing: {0}")]
    DocumentMissing(String),

    #[error("Not master: {0}")]
    NotMaster(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Get the error type as a string for metrics labeling.
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::Validation(_) => "validation",
            ClusterError::VersionConflict(_) => "version_conflict",
            ClusterError::ClusterBlock(_) => "cluster_block",
            ClusterError::UnavailableShards(_) => "unavailable_shards",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::CircuitBreaking(_) => "circuit_breaking",
            ClusterError::RejectedExecution(_) => "rejected_execution",
            ClusterError::ShardFailure(_) => "shard_failure",
            ClusterError::Transport(_) => "transport",
            ClusterError::Serialization(_) => "serialization",
            ClusterError::NodeUnavailable(_) => "node_unavailable",
            ClusterError::IncompatibleVersion(_) => "incompatible_version",
            ClusterError::MasterNotDiscovered(_) => "master_not_discovered",
            ClusterError::IndexNotFound(_) => "index_not_found",
            ClusterError::DocumentMissing(_) => "document_missing",
            ClusterError::NotMaster(_) => "not_master",
            ClusterError::Internal(_) => "internal",
        }
    }

    /// Whether the condition can clear on its own and the operation may be
    /// retried before its deadline.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::ClusterBlock(_)
                | ClusterError::UnavailableShards(_)
                | ClusterError::RejectedExecution(_)
                | ClusterError::Transport(_)
                | ClusterError::NodeUnavailable(_)
                | ClusterError::MasterNotDiscovered(_)
                | ClusterError::NotMaster(_)
        )
    }
}

impl From<meridian::Error> for ClusterError {
    fn from(err: meridian::Error) -> Self {
        use meridian::Error as E;
        match err {
            E::Validation(msg) | E::Mapping(msg) | E::InvalidQuery(msg) => {
                ClusterError::Validation(msg)
            }
            E::VersionConflict { .. } => ClusterError::VersionConflict(err.to_string()),
            E::DocumentMissing(id) => ClusterError::DocumentMissing(id),
            E::CircuitBreaking { .. } => ClusterError::CircuitBreaking(err.to_string()),
            E::RejectedExecution { .. } => ClusterError::RejectedExecution(err.to_string()),
            E::SearchTimeout => ClusterError::Timeout("search deadline exceeded".to_string()),
            E::EngineClosed
            | E::EngineFailed(_)
            | E::TranslogCorrupted(_)
            | E::SequenceConflict { .. } => ClusterError::ShardFailure(err.to_string()),
            other => ClusterError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Transport(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
