use thiserror::Error;

/// Engine-side error taxonomy.
///
/// Cluster-level conditions (blocks, unavailable shards, transport faults)
/// live in `meridian_cluster::ClusterError`; everything a single shard engine
/// can produce is here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Version conflict on [{id}]: current version [{current}] is different than the one provided [{provided}]")]
    VersionConflict {
        id: String,
        current: u64,
        provided: u64,
    },

    #[error("Document missing: {0}")]
    DocumentMissing(String),

    #[error("Sequence number conflict: expected above [{expected_above}], got [{got}]")]
    SequenceConflict { expected_above: u64, got: u64 },

    #[error("Circuit breaking in [{breaker}]: wanted [{wanted}] bytes, limit [{limit}]")]
    CircuitBreaking {
        breaker: &'static str,
        wanted: u64,
        limit: u64,
    },

    #[error("Rejected execution on pool [{pool}]: queue is full")]
    RejectedExecution { pool: &'static str },

    #[error("Engine is closed")]
    EngineClosed,

    #[error("Engine failed: {0}")]
    EngineFailed(String),

    #[error("Translog corrupted: {0}")]
    TranslogCorrupted(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Search deadline exceeded")]
    SearchTimeout,

    #[error("Scroll context not found or expired: {0}")]
    ScrollMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Get the error type as a string for metrics labeling.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::VersionConflict { .. } => "version_conflict",
            Error::DocumentMissing(_) => "document_missing",
            Error::SequenceConflict { .. } => "sequence_conflict",
            Error::CircuitBreaking { .. } => "circuit_breaking",
            Error::RejectedExecution { .. } => "rejected_execution",
            Error::EngineClosed => "engine_closed",
            Error::EngineFailed(_) => "engine_failed",
            Error::TranslogCorrupted(_) => "translog_corrupted",
            Error::Mapping(_) => "mapping",
            Error::InvalidQuery(_) => "invalid_query",
            Error::SearchTimeout => "search_timeout",
            Error::ScrollMissing(_) => "scroll_missing",
            Error::Io(_) => "io",
            Error::Tantivy(_) => "tantivy",
            Error::Json(_) => "json",
            Error::Serialization(_) => "serialization",
        }
    }

    /// Whether this error fails the whole shard copy rather than just the
    /// operation that hit it.
    pub fn fails_shard(&self) -> bool {
        matches!(
            self,
            Error::EngineFailed(_) | Error::TranslogCorrupted(_) | Error::Io(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_message() {
        let err = Error::VersionConflict {
            id: "doc-1".to_string(),
            current: 6,
            provided: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("doc-1"));
        assert!(msg.contains("[6]"));
        assert!(msg.contains("[5]"));
        assert_eq!(err.error_type(), "version_conflict");
    }

    #[test]
    fn test_fails_shard() {
        assert!(Error::EngineFailed("disk".into()).fails_shard());
        assert!(!Error::Validation("bad".into()).fails_shard());
        assert!(!Error::VersionConflict {
            id: "x".into(),
            current: 2,
            provided: 1
        }
        .fails_shard());
    }
}
