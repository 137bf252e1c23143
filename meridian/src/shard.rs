//! One shard copy as hosted by a node: the engine plus the local state
//! machine and role gating around it.

use crate::document::{DeleteResult, Document, GetResult, IndexResult, Operation, VersionType};
use crate::engine::store::StoreFileMetadata;
use crate::engine::{Engine, EngineConfig};
use crate::error::{Error, Result};
use crate::search::request::{SearchRequest, ShardFetchResult, ShardQueryResult};
use crate::search::ShardSearchService;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identity of a shard: the owning index's UUID plus the shard number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index_uuid: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index_uuid: impl Into<String>, shard: u32) -> ShardId {
        ShardId {
            index_uuid: index_uuid.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index_uuid, self.shard)
    }
}

/// Local lifecycle of a hosted copy. Distinct from the routing-table state:
/// this is what the node itself knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalShardState {
    Created,
    Recovering,
    Started,
    Closed,
}

/// Where an operation comes from, which decides what gating applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOrigin {
    /// A client write executing on the primary.
    Primary,
    /// Replication from the primary.
    Replica,
    /// Translog replay during recovery.
    Recovery,
}

pub struct Shard {
    pub id: ShardId,
    pub index_name: String,
    engine: Engine,
    search: ShardSearchService,
    primary: AtomicBool,
    state: RwLock<LocalShardState>,
}

impl Shard {
    pub fn open(
        id: ShardId,
        index_name: impl Into<String>,
        primary: bool,
        engine_config: EngineConfig,
    ) -> Result<Shard> {
        let engine = Engine::open(engine_config)?;
        Ok(Shard {
            id,
            index_name: index_name.into(),
            engine,
            search: ShardSearchService::default(),
            primary: AtomicBool::new(primary),
            state: RwLock::new(LocalShardState::Created),
        })
    }

    pub fn state(&self) -> LocalShardState {
        *self.state.read()
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    /// Recovery finished; the copy serves reads and writes now.
    pub fn mark_started(&self) {
        *self.state.write() = LocalShardState::Started;
    }

    pub fn mark_recovering(&self) {
        *self.state.write() = LocalShardState::Recovering;
    }

    pub fn close(&self) {
        *self.state.write() = LocalShardState::Closed;
        self.engine.close();
    }

    /// Replica promoted after a primary failure. Sequence numbers continue
    /// above everything this copy has applied.
    pub fn promote_to_primary(&self) {
        self.primary.store(true, Ordering::SeqCst);
    }

    pub fn index(
        &self,
        doc: &Document,
        version: Option<u64>,
        version_type: VersionType,
    ) -> Result<IndexResult> {
        self.ensure_writable(OperationOrigin::Primary)?;
        self.engine.index(doc, version, version_type)
    }

    pub fn delete(
        &self,
        id: &str,
        version: Option<u64>,
        version_type: VersionType,
    ) -> Result<DeleteResult> {
        self.ensure_writable(OperationOrigin::Primary)?;
        self.engine.delete(id, version, version_type)
    }

    /// Apply a replicated or recovery-replayed operation.
    pub fn apply_operation(&self, op: &Operation, origin: OperationOrigin) -> Result<()> {
        self.ensure_writable(origin)?;
        self.engine.apply_replica(op)
    }

    pub fn get(&self, id: &str) -> Result<Option<GetResult>> {
        self.ensure_readable()?;
        self.engine.get(id)
    }

    pub fn query_phase(&self, request: &SearchRequest) -> Result<ShardQueryResult> {
        self.ensure_readable()?;
        self.search.query_phase(&self.engine, self.id.shard, request)
    }

    pub fn fetch_phase(&self, ids: &[String]) -> Result<ShardFetchResult> {
        self.ensure_readable()?;
        self.search.fetch_phase(&self.engine, self.id.shard, ids)
    }

    pub fn scroll_next(&self, token: &str) -> Result<ShardQueryResult> {
        self.ensure_readable()?;
        self.search.scroll_next(&self.engine, self.id.shard, token)
    }

    pub fn scroll_fetch(&self, token: &str, ids: &[String]) -> Result<ShardFetchResult> {
        self.ensure_readable()?;
        self.search
            .scroll_fetch(&self.engine, self.id.shard, token, ids)
    }

    pub fn clear_scroll(&self, token: &str) -> bool {
        self.search.clear_scroll(token)
    }

    pub fn expire_scrolls(&self) -> usize {
        self.search.expire_scrolls()
    }

    pub fn open_scrolls(&self) -> usize {
        self.search.open_scrolls()
    }

    pub fn refresh(&self) -> Result<()> {
        self.engine.refresh()
    }

    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }

    pub fn sync_translog(&self) -> Result<()> {
        self.engine.sync_translog()
    }

    pub fn local_checkpoint(&self) -> Option<u64> {
        self.engine.local_checkpoint()
    }

    pub fn max_seq_no(&self) -> Option<u64> {
        self.engine.max_seq_no()
    }

    pub fn doc_count(&self) -> u64 {
        self.engine.doc_count()
    }

    pub fn segment_files(&self) -> Result<Vec<StoreFileMetadata>> {
        self.engine.segment_files()
    }

    pub fn index_dir(&self) -> std::path::PathBuf {
        self.engine.shard_path().index_dir()
    }

    pub fn translog_operations_since(&self, after: Option<u64>) -> Result<Vec<Operation>> {
        self.engine.translog_operations_since(after)
    }

    pub fn translog_stats(&self) -> (u64, u64) {
        self.engine.translog_stats()
    }

    /// A failed engine fails the copy; the node reports it to the master.
    pub fn failure(&self) -> Option<String> {
        self.engine.failure_reason()
    }

    fn ensure_writable(&self, origin: OperationOrigin) -> Result<()> {
        let state = self.state();
        match origin {
            OperationOrigin::Primary => {
                if state != LocalShardState::Started {
                    return Err(Error::Validation(format!(
                        "shard {} is {:?}, not started",
                        self.id, state
                    )));
                }
                if !self.is_primary() {
                    return Err(Error::Validation(format!(
                        "shard {} is not the primary copy",
                        self.id
                    )));
                }
            }
            OperationOrigin::Replica | OperationOrigin::Recovery => {
                if !matches!(
                    state,
                    LocalShardState::Started | LocalShardState::Recovering
                ) {
                    return Err(Error::Validation(format!(
                        "shard {} is {:?}, cannot apply replicated operation",
                        self.id, state
                    )));
                }
            }
        }
        Ok(())
    }

    fn ensure_readable(&self) -> Result<()> {
        if self.state() != LocalShardState::Started {
            return Err(Error::Validation(format!(
                "shard {} is {:?}, not started",
                self.id,
                self.state()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::ShardPath;
    use crate::mapping::{FieldMapping, IndexMapping};
    use crate::settings::IndexSettings;
    use serde_json::json;

    fn open_shard(dir: &std::path::Path, primary: bool) -> Shard {
        Shard::open(
            ShardId::new("uuid", 0),
            "logs",
            primary,
            EngineConfig {
                index_uuid: "uuid".into(),
                shard_path: ShardPath::new(dir, "uuid", 0),
                settings: IndexSettings::default(),
                mapping: IndexMapping::builder()
                    .field("body", FieldMapping::text())
                    .build(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_writes_require_started_primary() {
        let dir = tempfile::tempdir().unwrap();
        let shard = open_shard(dir.path(), true);
        let doc = Document::new("1", json!({"body": "x"}));

        // Created: not yet writable.
        assert!(shard.index(&doc, None, VersionType::Internal).is_err());
        shard.mark_started();
        assert!(shard.index(&doc, None, VersionType::Internal).is_ok());
    }

    #[test]
    fn test_replica_rejects_primary_writes_but_accepts_replication() {
        let dir = tempfile::tempdir().unwrap();
        let shard = open_shard(dir.path(), false);
        shard.mark_started();

        let doc = Document::new("1", json!({"body": "x"}));
        assert!(shard.index(&doc, None, VersionType::Internal).is_err());

        let op = Operation::Index {
            id: "1".into(),
            source: json!({"body": "x"}),
            routing: None,
            seq_no: 0,
            version: 1,
        };
        shard
            .apply_operation(&op, OperationOrigin::Replica)
            .unwrap();
        assert_eq!(shard.get("1").unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_promotion_enables_primary_writes() {
        let dir = tempfile::tempdir().unwrap();
        let shard = open_shard(dir.path(), false);
        shard.mark_started();
        shard.promote_to_primary();

        let doc = Document::new("1", json!({"body": "x"}));
        let result = shard.index(&doc, None, VersionType::Internal).unwrap();
        assert_eq!(result.version, 1);
    }

    #[test]
    fn test_recovery_origin_allowed_while_recovering() {
        let dir = tempfile::tempdir().unwrap();
        let shard = open_shard(dir.path(), false);
        shard.mark_recovering();

        let op = Operation::Index {
            id: "1".into(),
            source: json!({"body": "x"}),
            routing: None,
            seq_no: 0,
            version: 1,
        };
        shard
            .apply_operation(&op, OperationOrigin::Recovery)
            .unwrap();
        // Reads stay blocked until started.
        assert!(shard.get("1").is_err());
        shard.mark_started();
        assert!(shard.get("1").unwrap().is_some());
    }

    #[test]
    fn test_shard_id_display() {
        let id = ShardId::new("abc", 3);
        assert_eq!(id.to_string(), "[abc][3]");
    }
}
