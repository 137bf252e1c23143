//! Document model and write operations.
//!
//! A document is an opaque JSON source keyed by (index, id). The engine
//! tracks a per-document version and a per-shard sequence number for every
//! accepted operation; both travel with the operation through the translog
//! and replication.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    /// Opaque source payload. Field extraction happens against the index
    /// mapping at indexing time.
    pub source: Value,
    /// Routing key; defaults to the id when absent.
    #[serde(default)]
    pub routing: Option<String>,
}

impl Document {
    pub fn new(id: impl Into<String>, source: Value) -> Self {
        Self {
            id: id.into(),
            source,
            routing: None,
        }
    }

    pub fn with_routing(mut self, routing: impl Into<String>) -> Self {
        self.routing = Some(routing.into());
        self
    }

    /// Effective routing key used for shard selection.
    pub fn routing_key(&self) -> &str {
        self.routing.as_deref().unwrap_or(&self.id)
    }
}

/// Version precondition semantics for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionType {
    /// The provided version must match the currently stored version.
    Internal,
    /// The provided version must be strictly greater than the stored one and
    /// becomes the new stored version.
    External,
}

impl VersionType {
    /// Validate a write precondition and compute the version the operation
    /// will be stored under.
    ///
    /// `current` is `None` when the document does not exist (or is deleted).
    /// `provided` is `None` when the client did not claim a version, which is
    /// only legal for `Internal`.
    pub fn resolve(
        &self,
        id: &str,
        current: Option<u64>,
        provided: Option<u64>,
    ) -> Result<u64> {
        match self {
            VersionType::Internal => match provided {
                None => Ok(current.unwrap_or(0) + 1),
                Some(p) => {
                    let cur = current.unwrap_or(0);
                    if p == cur {
                        Ok(cur + 1)
                    } else {
                        Err(Error::VersionConflict {
                            id: id.to_string(),
                            current: cur,
                            provided: p,
                        })
                    }
                }
            },
            VersionType::External => {
                let p = provided.ok_or_else(|| {
                    Error::Validation("external version type requires a version".to_string())
                })?;
                let cur = current.unwrap_or(0);
                if p > cur {
                    Ok(p)
                } else {
                    Err(Error::VersionConflict {
                        id: id.to_string(),
                        current: cur,
                        provided: p,
                    })
                }
            }
        }
    }
}

/// A durable write operation, as recorded in the translog and shipped to
/// replicas. Sequence number and version are assigned by the primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Operation {
    Index {
        id: String,
        source: Value,
        routing: Option<String>,
        seq_no: u64,
        version: u64,
    },
    Delete {
        id: String,
        seq_no: u64,
        version: u64,
    },
}

impl Operation {
    pub fn id(&self) -> &str {
        match self {
            Operation::Index { id, .. } => id,
            Operation::Delete { id, .. } => id,
        }
    }

    pub fn seq_no(&self) -> u64 {
        match self {
            Operation::Index { seq_no, .. } => *seq_no,
            Operation::Delete { seq_no, .. } => *seq_no,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Operation::Index { version, .. } => *version,
            Operation::Delete { version, .. } => *version,
        }
    }

    pub fn op_type(&self) -> &'static str {
        match self {
            Operation::Index { .. } => "index",
            Operation::Delete { .. } => "delete",
        }
    }
}

/// Result of applying an index operation on the primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexResult {
    pub version: u64,
    pub seq_no: u64,
    /// True when the document did not previously exist.
    pub created: bool,
}

/// Result of applying a delete operation on the primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub version: u64,
    pub seq_no: u64,
    /// True when a live document was actually removed.
    pub found: bool,
}

/// A real-time get result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetResult {
    pub id: String,
    pub version: u64,
    pub seq_no: u64,
    pub source: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routing_defaults_to_id() {
        let doc = Document::new("a", json!({"f": 1}));
        assert_eq!(doc.routing_key(), "a");
        let doc = doc.with_routing("user-7");
        assert_eq!(doc.routing_key(), "user-7");
    }

    #[test]
    fn test_internal_version_unversioned_write() {
        assert_eq!(VersionType::Internal.resolve("x", None, None).unwrap(), 1);
        assert_eq!(
            VersionType::Internal.resolve("x", Some(4), None).unwrap(),
            5
        );
    }

    #[test]
    fn test_internal_version_must_match() {
        assert_eq!(
            VersionType::Internal.resolve("x", Some(5), Some(5)).unwrap(),
            6
        );
        let err = VersionType::Internal
            .resolve("x", Some(6), Some(5))
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { current: 6, .. }));
        // A versioned write against a missing document conflicts too.
        let err = VersionType::Internal.resolve("x", None, Some(3)).unwrap_err();
        assert!(matches!(err, Error::VersionConflict { current: 0, .. }));
    }

    #[test]
    fn test_external_version_strictly_greater() {
        assert_eq!(
            VersionType::External.resolve("x", Some(5), Some(9)).unwrap(),
            9
        );
        assert!(VersionType::External
            .resolve("x", Some(5), Some(5))
            .is_err());
        assert!(VersionType::External
            .resolve("x", Some(5), Some(4))
            .is_err());
        assert!(VersionType::External.resolve("x", None, None).is_err());
    }

    #[test]
    fn test_operation_accessors() {
        let op = Operation::Index {
            id: "d".into(),
            source: json!({"body": "hi"}),
            routing: None,
            seq_no: 12,
            version: 3,
        };
        assert_eq!(op.id(), "d");
        assert_eq!(op.seq_no(), 12);
        assert_eq!(op.version(), 3);
        assert_eq!(op.op_type(), "index");
    }
}
