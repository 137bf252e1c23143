//! The per-shard engine.
//!
//! Owns one shard copy's durable state: a tantivy index (segments), a
//! write-ahead translog, and the live version map. Writes are serialized per
//! document id through striped locks; searches run lock-free against a
//! reference-counted searcher snapshot.
//!
//! Write path: resolve current version → enforce the version-type policy →
//! assign a sequence number → append to the translog → apply to the index
//! writer. A translog or index failure fails the whole engine, not just the
//! operation; the owning node reports the copy as failed to the master.

pub mod locks;
pub mod seqno;
pub mod store;
pub mod translog;
pub mod version_map;

use crate::document::{
    DeleteResult, Document, GetResult, IndexResult, Operation, VersionType,
};
use crate::error::{Error, Result};
use crate::mapping::{FieldRegistry, IndexMapping};
use crate::settings::{Durability, IndexSettings};
use locks::KeyedLocks;
use parking_lot::{Mutex, RwLock};
use seqno::SequenceNumbers;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use store::{ShardPath, ShardStateFile, StoreFileMetadata};
use tantivy::collector::TopDocs;
use tantivy::query::TermQuery;
use tantivy::schema::{IndexRecordOption, OwnedValue};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument, Term};
use tracing::{debug, info, warn};
use translog::Translog;
use version_map::LiveVersionMap;

const WRITER_HEAP_BYTES: usize = 50_000_000;
const TOMBSTONE_RETENTION: Duration = Duration::from_secs(300);

/// Everything needed to open one shard copy's engine.
pub struct EngineConfig {
    pub index_uuid: String,
    pub shard_path: ShardPath,
    pub settings: IndexSettings,
    pub mapping: IndexMapping,
}

pub struct Engine {
    registry: FieldRegistry,
    settings: IndexSettings,
    shard_path: ShardPath,
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    /// Bumped on every refresh; keys the query cache.
    reader_generation: AtomicU64,
    translog: Translog,
    version_map: LiveVersionMap,
    id_locks: KeyedLocks,
    seq_nos: SequenceNumbers,
    /// Strictly-increasing gate for replica-origin operations.
    replica_gate: Mutex<i64>,
    /// Serializes refresh/flush.
    commit_lock: Mutex<()>,
    commit_state: RwLock<ShardStateFile>,
    failure: RwLock<Option<String>>,
    closed: AtomicBool,
}

impl Engine {
    /// Open (or create) the engine for one shard copy, replaying any translog
    /// operations above the last commit point.
    pub fn open(config: EngineConfig) -> Result<Engine> {
        config.settings.validate()?;
        let registry = FieldRegistry::compile(&config.mapping)?;
        config.shard_path.create_dirs()?;

        let index_dir = config.shard_path.index_dir();
        let index = if index_dir.join("meta.json").exists() {
            Index::open_in_dir(&index_dir)?
        } else {
            Index::create_in_dir(&index_dir, registry.schema.clone())?
        };

        let commit_state = match ShardStateFile::load(&config.shard_path.shard_dir)? {
            Some(state) => state,
            None => {
                let state = ShardStateFile::initial(&config.index_uuid);
                state.persist(&config.shard_path.shard_dir)?;
                state
            }
        };

        let replay = Translog::recover_operations(
            &config.shard_path.translog_dir(),
            commit_state.translog_generation,
        )?;
        let to_replay: Vec<&Operation> = replay
            .iter()
            .filter(|op| match commit_state.committed_seq_no {
                Some(committed) => op.seq_no() > committed,
                None => true,
            })
            .collect();

        let mut writer: IndexWriter = index.writer(WRITER_HEAP_BYTES)?;
        let mut max_seen = commit_state.committed_seq_no;
        if !to_replay.is_empty() {
            info!(
                ops = to_replay.len(),
                "replaying translog operations above commit point"
            );
            for &op in &to_replay {
                apply_to_writer(&registry, &mut writer, op)?;
                let seq_no = op.seq_no();
                max_seen = Some(max_seen.map_or(seq_no, |m| m.max(seq_no)));
            }
            writer.commit()?;
        }

        let translog = Translog::open(
            config.shard_path.translog_dir(),
            config.settings.translog_durability,
        )?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        reader.reload()?;

        let replica_gate = max_seen.map(|s| s as i64).unwrap_or(-1);
        Ok(Engine {
            registry,
            settings: config.settings,
            shard_path: config.shard_path,
            index,
            writer: Mutex::new(writer),
            reader,
            reader_generation: AtomicU64::new(0),
            translog,
            version_map: LiveVersionMap::default(),
            id_locks: KeyedLocks::default(),
            seq_nos: SequenceNumbers::new(max_seen),
            replica_gate: Mutex::new(replica_gate),
            commit_lock: Mutex::new(()),
            commit_state: RwLock::new(commit_state),
            failure: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Index a document on the primary. Resolves the current version,
    /// enforces the version-type policy and assigns the next sequence number.
    pub fn index(
        &self,
        doc: &Document,
        provided_version: Option<u64>,
        version_type: VersionType,
    ) -> Result<IndexResult> {
        self.ensure_open()?;
        let _guard = self.id_locks.acquire(&doc.id);

        let current = self.resolve_version(&doc.id)?;
        let version = version_type.resolve(&doc.id, current, provided_version)?;
        let seq_no = self.seq_nos.generate();

        let result = self.apply_index(doc, seq_no, version);
        if result.is_err() {
            // Fill the checkpoint hole left by the assigned sequence number.
            self.seq_nos.mark_completed(seq_no);
        }
        result?;
        Ok(IndexResult {
            version,
            seq_no,
            created: current.is_none(),
        })
    }

    /// Delete a document on the primary.
    pub fn delete(
        &self,
        id: &str,
        provided_version: Option<u64>,
        version_type: VersionType,
    ) -> Result<DeleteResult> {
        self.ensure_open()?;
        let _guard = self.id_locks.acquire(id);

        let current = self.resolve_version(id)?;
        let version = version_type.resolve(id, current, provided_version)?;
        let seq_no = self.seq_nos.generate();

        let op = Operation::Delete {
            id: id.to_string(),
            seq_no,
            version,
        };
        if let Err(err) = self.append_and_apply(&op, None) {
            self.seq_nos.mark_completed(seq_no);
            return Err(err);
        }
        Ok(DeleteResult {
            version,
            seq_no,
            found: current.is_some(),
        })
    }

    /// Apply a replicated operation. The primary already assigned sequence
    /// number and version; replicas enforce arrival in sequence order.
    pub fn apply_replica(&self, op: &Operation) -> Result<()> {
        self.ensure_open()?;
        {
            let mut gate = self.replica_gate.lock();
            if (op.seq_no() as i64) <= *gate {
                return Err(Error::SequenceConflict {
                    expected_above: *gate as u64,
                    got: op.seq_no(),
                });
            }
            *gate = op.seq_no() as i64;
        }
        let _guard = self.id_locks.acquire(op.id());
        match op {
            Operation::Index {
                id,
                source,
                routing,
                seq_no,
                version,
            } => {
                let doc = Document {
                    id: id.clone(),
                    source: source.clone(),
                    routing: routing.clone(),
                };
                self.apply_index_operation(&doc, *seq_no, *version)?;
            }
            Operation::Delete { .. } => {
                self.append_and_apply(op, None)?;
            }
        }
        self.seq_nos.advance_to(op.seq_no());
        Ok(())
    }

    /// Real-time get: the in-memory map answers for operations not yet
    /// searchable; otherwise the current searcher does.
    pub fn get(&self, id: &str) -> Result<Option<GetResult>> {
        self.ensure_open()?;
        if let Some(hit) = self.version_map.lookup(id) {
            if hit.deleted {
                return Ok(None);
            }
            if let Some(source) = hit.source {
                return Ok(Some(GetResult {
                    id: id.to_string(),
                    version: hit.version,
                    seq_no: hit.seq_no,
                    source: (*source).clone(),
                }));
            }
        }
        self.lookup_from_searcher(id)
    }

    /// Reopen the searcher so recent writes become visible.
    pub fn refresh(&self) -> Result<()> {
        self.ensure_open()?;
        let _commit = self.commit_lock.lock();
        self.version_map.begin_refresh();
        let commit_result = self.writer.lock().commit();
        if let Err(err) = commit_result {
            self.fail(format!("commit failed: {}", err));
            return Err(Error::EngineFailed(err.to_string()));
        }
        self.reader.reload()?;
        self.reader_generation.fetch_add(1, Ordering::SeqCst);
        self.version_map.end_refresh();
        Ok(())
    }

    /// Commit, fsync the translog, and advance the commit point. Once this
    /// returns, no previously-accepted operation can be lost on
    /// crash-and-recover.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let _commit = self.commit_lock.lock();

        let max_before_roll = self.seq_nos.max_seq_no();
        let new_generation = self.translog.roll_generation()?;
        // Read before the commit: everything at or below this point is in
        // the writer and therefore in the commit we are about to make.
        let checkpoint = self.seq_nos.local_checkpoint();

        self.version_map.begin_refresh();
        let commit_result = self.writer.lock().commit();
        if let Err(err) = commit_result {
            self.fail(format!("commit failed: {}", err));
            return Err(Error::EngineFailed(err.to_string()));
        }
        self.reader.reload()?;
        self.reader_generation.fetch_add(1, Ordering::SeqCst);
        self.version_map.end_refresh();

        self.translog.sync()?;

        // Older generations can only go once every operation they hold is
        // covered by the commit, i.e. the checkpoint reached everything
        // assigned before the roll.
        let quiescent = checkpoint >= max_before_roll;
        let keep_from = if quiescent {
            new_generation
        } else {
            self.commit_state.read().translog_generation
        };
        let state = ShardStateFile {
            index_uuid: self.commit_state.read().index_uuid.clone(),
            committed_seq_no: checkpoint,
            translog_generation: keep_from,
        };
        state.persist(&self.shard_path.shard_dir)?;
        self.translog.trim_below(keep_from)?;
        *self.commit_state.write() = state;

        self.version_map.prune_tombstones(TOMBSTONE_RETENTION);
        debug!(?checkpoint, generation = new_generation, "flushed shard");
        Ok(())
    }

    /// fsync outstanding translog appends; the async-durability interval
    /// task calls this.
    pub fn sync_translog(&self) -> Result<()> {
        self.translog.sync()
    }

    /// A point-in-time searcher over the current segments.
    pub fn searcher(&self) -> Searcher {
        self.reader.searcher()
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn shard_path(&self) -> &ShardPath {
        &self.shard_path
    }

    pub fn reader_generation(&self) -> u64 {
        self.reader_generation.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn local_checkpoint(&self) -> Option<u64> {
        self.seq_nos.local_checkpoint()
    }

    pub fn max_seq_no(&self) -> Option<u64> {
        self.seq_nos.max_seq_no()
    }

    /// Retained translog operations above a sequence number, for peer
    /// recovery while this copy keeps serving writes.
    pub fn translog_operations_since(&self, after_seq_no: Option<u64>) -> Result<Vec<Operation>> {
        self.translog.operations_since(after_seq_no)
    }

    /// Live segment files with checksums, for the recovery file diff.
    pub fn segment_files(&self) -> Result<Vec<StoreFileMetadata>> {
        store::list_segment_files(&self.shard_path.index_dir())
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn translog_stats(&self) -> (u64, u64) {
        (
            self.translog.uncommitted_operations(),
            self.translog.uncommitted_bytes(),
        )
    }

    pub fn is_failed(&self) -> bool {
        self.failure.read().is_some()
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure.read().clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::EngineClosed);
        }
        if let Some(reason) = self.failure.read().clone() {
            return Err(Error::EngineFailed(reason));
        }
        Ok(())
    }

    fn fail(&self, reason: String) {
        warn!(reason = %reason, "failing engine");
        let mut failure = self.failure.write();
        if failure.is_none() {
            *failure = Some(reason);
        }
    }

    fn apply_index(&self, doc: &Document, seq_no: u64, version: u64) -> Result<()> {
        self.apply_index_operation(doc, seq_no, version)
    }

    fn apply_index_operation(&self, doc: &Document, seq_no: u64, version: u64) -> Result<()> {
        // Mapping validation happens before the translog sees the operation;
        // a malformed document must not fail the shard.
        let tdoc = self.registry.extract(doc, seq_no, version)?;
        let op = Operation::Index {
            id: doc.id.clone(),
            source: doc.source.clone(),
            routing: doc.routing.clone(),
            seq_no,
            version,
        };
        self.append_and_apply(&op, Some(tdoc))
    }

    /// Translog first, then the index writer, then the version map. Failures
    /// here poison the engine.
    fn append_and_apply(
        &self,
        op: &Operation,
        prepared: Option<TantivyDocument>,
    ) -> Result<()> {
        if let Err(err) = self.translog.append(op) {
            self.fail(format!("translog append failed: {}", err));
            return Err(Error::EngineFailed(err.to_string()));
        }
        {
            let mut writer = self.writer.lock();
            let id_term = Term::from_field_text(self.registry.id_field, op.id());
            writer.delete_term(id_term);
            if let Some(tdoc) = prepared {
                if let Err(err) = writer.add_document(tdoc) {
                    self.fail(format!("index write failed: {}", err));
                    return Err(Error::EngineFailed(err.to_string()));
                }
            }
        }
        match op {
            Operation::Index {
                id,
                source,
                seq_no,
                version,
                ..
            } => {
                self.version_map
                    .put_index(id, *version, *seq_no, Arc::new(source.clone()));
                self.seq_nos.mark_completed(*seq_no);
            }
            Operation::Delete {
                id,
                seq_no,
                version,
            } => {
                self.version_map.put_delete(id, *version, *seq_no);
                self.seq_nos.mark_completed(*seq_no);
            }
        }
        Ok(())
    }

    /// Current live version of a document, `None` when missing or deleted.
    fn resolve_version(&self, id: &str) -> Result<Option<u64>> {
        if let Some(hit) = self.version_map.lookup(id) {
            return Ok(if hit.deleted { None } else { Some(hit.version) });
        }
        Ok(self.lookup_from_searcher(id)?.map(|g| g.version))
    }

    fn lookup_from_searcher(&self, id: &str) -> Result<Option<GetResult>> {
        let searcher = self.reader.searcher();
        let term = Term::from_field_text(self.registry.id_field, id);
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        let Some((_score, addr)) = top.first() else {
            return Ok(None);
        };
        let doc: TantivyDocument = searcher.doc(*addr)?;

        let version = match doc.get_first(self.registry.version_field) {
            Some(OwnedValue::U64(v)) => *v,
            _ => 0,
        };
        let seq_no = match doc.get_first(self.registry.seq_no_field) {
            Some(OwnedValue::U64(v)) => *v,
            _ => 0,
        };
        let source = match doc.get_first(self.registry.source_field) {
            Some(OwnedValue::Bytes(bytes)) => serde_json::from_slice(bytes)?,
            _ => {
                return Err(Error::EngineFailed(format!(
                    "stored document [{}] has no source",
                    id
                )))
            }
        };
        Ok(Some(GetResult {
            id: id.to_string(),
            version,
            seq_no,
            source,
        }))
    }
}

fn apply_to_writer(
    registry: &FieldRegistry,
    writer: &mut IndexWriter,
    op: &Operation,
) -> Result<()> {
    let id_term = Term::from_field_text(registry.id_field, op.id());
    writer.delete_term(id_term);
    if let Operation::Index {
        id,
        source,
        routing,
        seq_no,
        version,
    } = op
    {
        let doc = Document {
            id: id.clone(),
            source: source.clone(),
            routing: routing.clone(),
        };
        let tdoc = registry.extract(&doc, *seq_no, *version)?;
        writer.add_document(tdoc)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::FieldMapping;
    use serde_json::json;

    fn engine_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            index_uuid: "test-uuid".to_string(),
            shard_path: ShardPath::new(dir, "test-uuid", 0),
            settings: IndexSettings::default(),
            mapping: IndexMapping::builder()
                .field("body", FieldMapping::text())
                .field("tag", FieldMapping::keyword())
                .build(),
        }
    }

    fn doc(id: &str, body: &str) -> Document {
        Document::new(id, json!({"body": body}))
    }

    #[test]
    fn test_index_then_get_realtime() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();

        let result = engine
            .index(&doc("1", "the quick brown fox"), None, VersionType::Internal)
            .unwrap();
        assert_eq!(result.version, 1);
        assert_eq!(result.seq_no, 0);
        assert!(result.created);

        // Visible to get before any refresh.
        let got = engine.get("1").unwrap().unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.source["body"], "the quick brown fox");
    }

    #[test]
    fn test_get_after_refresh_reads_from_searcher() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();
        engine
            .index(&doc("1", "hello"), None, VersionType::Internal)
            .unwrap();
        engine.refresh().unwrap();

        let got = engine.get("1").unwrap().unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.source["body"], "hello");
        assert_eq!(engine.doc_count(), 1);
    }

    #[test]
    fn test_index_delete_get_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();
        engine
            .index(&doc("1", "here"), None, VersionType::Internal)
            .unwrap();
        let deleted = engine.delete("1", None, VersionType::Internal).unwrap();
        assert!(deleted.found);
        assert_eq!(deleted.version, 2);
        assert!(engine.get("1").unwrap().is_none());

        engine.refresh().unwrap();
        assert!(engine.get("1").unwrap().is_none());
    }

    #[test]
    fn test_internal_version_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();
        engine
            .index(&doc("x", "v1"), None, VersionType::Internal)
            .unwrap();

        // Two writers both claim version 1; only one can win.
        let first = engine.index(&doc("x", "v2"), Some(1), VersionType::Internal);
        let second = engine.index(&doc("x", "v2-clash"), Some(1), VersionType::Internal);
        assert!(first.is_ok());
        let err = second.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { current: 2, .. }));

        let got = engine.get("x").unwrap().unwrap();
        assert_eq!(got.version, 2);
    }

    #[test]
    fn test_external_versioning() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();
        engine
            .index(&doc("x", "a"), Some(10), VersionType::External)
            .unwrap();
        assert!(engine
            .index(&doc("x", "b"), Some(10), VersionType::External)
            .is_err());
        let result = engine
            .index(&doc("x", "b"), Some(12), VersionType::External)
            .unwrap();
        assert_eq!(result.version, 12);
    }

    #[test]
    fn test_versions_never_decrease() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();
        let mut last = 0;
        for i in 0..5 {
            let result = engine
                .index(&doc("same", &format!("rev {}", i)), None, VersionType::Internal)
                .unwrap();
            assert!(result.version > last);
            last = result.version;
        }
        let del = engine.delete("same", None, VersionType::Internal).unwrap();
        assert!(del.version > last);
    }

    #[test]
    fn test_crash_recovery_replays_translog() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(engine_config(dir.path())).unwrap();
            engine
                .index(&doc("1", "survives"), None, VersionType::Internal)
                .unwrap();
            engine
                .index(&doc("2", "also survives"), None, VersionType::Internal)
                .unwrap();
            engine.delete("2", None, VersionType::Internal).unwrap();
            // No refresh, no flush: everything lives only in the translog.
        }

        let engine = Engine::open(engine_config(dir.path())).unwrap();
        let got = engine.get("1").unwrap().unwrap();
        assert_eq!(got.source["body"], "survives");
        assert!(engine.get("2").unwrap().is_none());
        assert_eq!(engine.max_seq_no(), Some(2));
    }

    #[test]
    fn test_flush_trims_translog_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(engine_config(dir.path())).unwrap();
            engine
                .index(&doc("1", "committed"), None, VersionType::Internal)
                .unwrap();
            engine.flush().unwrap();
            let (ops, _) = engine.translog_stats();
            assert_eq!(ops, 0, "flush rolled to a fresh generation");
        }

        let engine = Engine::open(engine_config(dir.path())).unwrap();
        assert_eq!(engine.local_checkpoint(), Some(0));
        let got = engine.get("1").unwrap().unwrap();
        assert_eq!(got.source["body"], "committed");
    }

    #[test]
    fn test_ops_after_flush_replay_on_crash() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(engine_config(dir.path())).unwrap();
            engine
                .index(&doc("1", "flushed"), None, VersionType::Internal)
                .unwrap();
            engine.flush().unwrap();
            engine
                .index(&doc("2", "unflushed"), None, VersionType::Internal)
                .unwrap();
        }
        let engine = Engine::open(engine_config(dir.path())).unwrap();
        assert!(engine.get("1").unwrap().is_some());
        assert_eq!(
            engine.get("2").unwrap().unwrap().source["body"],
            "unflushed"
        );
    }

    #[test]
    fn test_replica_applies_in_order_and_rejects_regression() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();

        let op0 = Operation::Index {
            id: "a".into(),
            source: json!({"body": "one"}),
            routing: None,
            seq_no: 0,
            version: 1,
        };
        let op1 = Operation::Index {
            id: "a".into(),
            source: json!({"body": "two"}),
            routing: None,
            seq_no: 1,
            version: 2,
        };
        engine.apply_replica(&op0).unwrap();
        engine.apply_replica(&op1).unwrap();

        // Replaying an old or duplicate sequence number is rejected.
        let err = engine.apply_replica(&op0).unwrap_err();
        assert!(matches!(err, Error::SequenceConflict { .. }));

        assert_eq!(engine.get("a").unwrap().unwrap().version, 2);
        // Promotion continues above the replicated maximum.
        let result = engine
            .index(&doc("b", "promoted"), None, VersionType::Internal)
            .unwrap();
        assert_eq!(result.seq_no, 2);
    }

    #[test]
    fn test_unmapped_field_does_not_fail_shard() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();
        let bad = Document::new("1", json!({"nope": "x"}));
        let err = engine.index(&bad, None, VersionType::Internal).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!engine.is_failed());

        // The engine keeps accepting good writes.
        engine
            .index(&doc("2", "fine"), None, VersionType::Internal)
            .unwrap();
    }

    #[test]
    fn test_closed_engine_rejects_ops() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();
        engine.close();
        let err = engine
            .index(&doc("1", "late"), None, VersionType::Internal)
            .unwrap_err();
        assert!(matches!(err, Error::EngineClosed));
    }

    #[test]
    fn test_reader_generation_bumps_on_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(engine_config(dir.path())).unwrap();
        let before = engine.reader_generation();
        engine.refresh().unwrap();
        assert_eq!(engine.reader_generation(), before + 1);
    }
}
