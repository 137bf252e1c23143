//! Meridian core: the per-shard indexing and search engine.
//!
//! This crate owns everything a single shard copy needs — the translog,
//! version map, segment store (tantivy), search phases, aggregations, the
//! query cache and scroll contexts — plus node-wide services with no cluster
//! awareness: circuit breakers and the named thread pools. Cluster state,
//! routing, replication and coordination live in `meridian-cluster`.

pub mod aggregations;
pub mod breaker;
pub mod document;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod search;
pub mod settings;
pub mod shard;
pub mod threadpool;

pub use document::{
    DeleteResult, Document, GetResult, IndexResult, Operation, VersionType,
};
pub use error::{Error, Result};
pub use mapping::{FieldMapping, FieldType, IndexMapping};
pub use settings::{Durability, IndexSettings};
pub use shard::{LocalShardState, OperationOrigin, Shard, ShardId};
