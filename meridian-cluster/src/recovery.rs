//! Shard recovery: bringing a copy from INITIALIZING to STARTED.
//!
//! Peer recovery is target-driven, in three stages:
//!
//! 1. **files** — the source flushes, then sends its live segment file list
//!    with checksums; the target fetches only the files it does not already
//!    hold byte-identically.
//! 2. **translog** — the target replays the source's retained translog
//!    operations above the transferred commit point, looping until a fetch
//!    comes back empty. The source keeps serving writes the whole time.
//! 3. **handoff** — writes replicated while the target was recovering were
//!    buffered; they are drained under the session lock and the copy is
//!    marked started.
//!
//! Empty-store and existing-store recoveries skip the network entirely;
//! snapshot restore pulls segment files from a content-addressed repository.

use crate::error::{ClusterError, Result};
use crate::snapshot::{Repository, SnapshotMetadata};
use crate::transport::{send_typed, Transport};
use meridian::engine::store::{self, ShardPath, ShardStateFile, StoreFileMetadata};
use meridian::shard::OperationOrigin;
use meridian::{Operation, Shard, ShardId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const RECOVERY_FILES_ACTION: &str = "internal:recovery/files";
pub const RECOVERY_FILE_CHUNK_ACTION: &str = "internal:recovery/file_chunk";
pub const RECOVERY_TRANSLOG_ACTION: &str = "internal:recovery/translog";

const FILE_CHUNK_BYTES: u64 = 512 * 1024;
const RECOVERY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListRequest {
    pub shard_id: ShardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListResponse {
    pub files: Vec<StoreFileMetadata>,
    /// Commit point covered by the transferred files; translog replay
    /// starts above it.
    pub checkpoint: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunkRequest {
    pub shard_id: ShardId,
    pub file: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunkResponse {
    pub data: Vec<u8>,
    pub eof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslogRequest {
    pub shard_id: ShardId,
    pub after_seq_no: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslogResponse {
    pub ops: Vec<Operation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    Init,
    Files,
    Translog,
    Done,
    Failed,
}

/// Operator-visible recovery progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryProgress {
    pub stage: RecoveryStage,
    pub files_total: usize,
    pub files_reused: usize,
    pub files_recovered: usize,
    pub bytes_recovered: u64,
    pub ops_replayed: u64,
}

impl Default for RecoveryProgress {
    fn default() -> Self {
        Self {
            stage: RecoveryStage::Init,
            files_total: 0,
            files_reused: 0,
            files_recovered: 0,
            bytes_recovered: 0,
            ops_replayed: 0,
        }
    }
}

struct PendingBuffer {
    ops: Vec<Operation>,
    accepting: bool,
}

/// Target-side session: buffers live replication while the copy replays.
struct TargetSession {
    pending: Mutex<PendingBuffer>,
}

pub type ShardLookup = Arc<dyn Fn(&ShardId) -> Option<Arc<Shard>> + Send + Sync>;

pub struct RecoveryService {
    transport: Arc<dyn Transport>,
    sessions: Mutex<HashMap<ShardId, Arc<TargetSession>>>,
    progress: RwLock<HashMap<ShardId, RecoveryProgress>>,
}

impl RecoveryService {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<RecoveryService> {
        Arc::new(RecoveryService {
            transport,
            sessions: Mutex::new(HashMap::new()),
            progress: RwLock::new(HashMap::new()),
        })
    }

    /// Source-side handlers; every data node serves these for the shards it
    /// hosts.
    pub fn register_source_handlers(transport: &dyn Transport, lookup: ShardLookup) {
        let files_lookup = Arc::clone(&lookup);
        transport.register_handler(
            RECOVERY_FILES_ACTION,
            crate::transport::typed_handler(move |request: FileListRequest| {
                let lookup = Arc::clone(&files_lookup);
                async move {
                    let shard = source_shard(&lookup, &request.shard_id)?;
                    // A flush pins the commit point the file transfer
                    // represents; later writes live in the translog.
                    shard.flush().map_err(ClusterError::from)?;
                    Ok(FileListResponse {
                        files: shard.segment_files().map_err(ClusterError::from)?,
                        checkpoint: shard.local_checkpoint(),
                    })
                }
            }),
        );

        let chunk_lookup = Arc::clone(&lookup);
        transport.register_handler(
            RECOVERY_FILE_CHUNK_ACTION,
            crate::transport::typed_handler(move |request: FileChunkRequest| {
                let lookup = Arc::clone(&chunk_lookup);
                async move {
                    let shard = source_shard(&lookup, &request.shard_id)?;
                    read_chunk(&shard, &request)
                }
            }),
        );

        transport.register_handler(
            RECOVERY_TRANSLOG_ACTION,
            crate::transport::typed_handler(move |request: TranslogRequest| {
                let lookup = Arc::clone(&lookup);
                async move {
                    let shard = source_shard(&lookup, &request.shard_id)?;
                    Ok(TranslogResponse {
                        ops: shard
                            .translog_operations_since(request.after_seq_no)
                            .map_err(ClusterError::from)?,
                    })
                }
            }),
        );
    }

    /// Open a buffering session before the target shard exists.
    pub fn begin_session(&self, shard_id: &ShardId) {
        self.sessions.lock().insert(
            shard_id.clone(),
            Arc::new(TargetSession {
                pending: Mutex::new(PendingBuffer {
                    ops: Vec::new(),
                    accepting: true,
                }),
            }),
        );
        self.progress
            .write()
            .insert(shard_id.clone(), RecoveryProgress::default());
    }

    /// Buffer a live replication op if this shard is mid-recovery. Returns
    /// false when the op should be applied directly.
    pub fn buffer_replication(&self, shard_id: &ShardId, op: &Operation) -> bool {
        let session = self.sessions.lock().get(shard_id).cloned();
        if let Some(session) = session {
            let mut pending = session.pending.lock();
            if pending.accepting {
                pending.ops.push(op.clone());
                return true;
            }
        }
        false
    }

    /// Stage 1: bring the local index directory up to the source's file
    /// set, reusing byte-identical files. Returns the source commit point.
    pub async fn copy_files(
        &self,
        shard_id: &ShardId,
        shard_path: &ShardPath,
        source_address: &str,
    ) -> Result<Option<u64>> {
        self.set_stage(shard_id, RecoveryStage::Files);
        let listing: FileListResponse = send_typed(
            self.transport.as_ref(),
            source_address,
            RECOVERY_FILES_ACTION,
            &FileListRequest {
                shard_id: shard_id.clone(),
            },
            RECOVERY_REQUEST_TIMEOUT,
        )
        .await?;

        shard_path.create_dirs().map_err(ClusterError::from)?;
        let index_dir = shard_path.index_dir();
        let local = store::list_segment_files(&index_dir).map_err(ClusterError::from)?;

        // Anything not in the source's live set is stale here.
        for file in &local {
            if !listing.files.iter().any(|f| f.name == file.name) {
                let _ = std::fs::remove_file(index_dir.join(&file.name));
            }
        }

        let mut reused = 0usize;
        let mut recovered = 0usize;
        let mut bytes = 0u64;
        for remote in &listing.files {
            if local.iter().any(|f| f.same(remote)) {
                reused += 1;
                continue;
            }
            bytes += self
                .fetch_file(shard_id, &index_dir, remote, source_address)
                .await?;
            recovered += 1;
        }
        {
            let mut progress = self.progress.write();
            if let Some(p) = progress.get_mut(shard_id) {
                p.files_total = listing.files.len();
                p.files_reused = reused;
                p.files_recovered = recovered;
                p.bytes_recovered = bytes;
            }
        }
        info!(
            shard = %shard_id,
            total = listing.files.len(),
            reused,
            recovered,
            "recovery file stage complete"
        );

        // Seed the commit metadata so the engine opens with the right
        // sequence-number floor.
        ShardStateFile {
            index_uuid: shard_id.index_uuid.clone(),
            committed_seq_no: listing.checkpoint,
            translog_generation: 1,
        }
        .persist(&shard_path.shard_dir)
        .map_err(ClusterError::from)?;
        Ok(listing.checkpoint)
    }

    /// Stage 2: replay source translog operations until a fetch drains dry.
    pub async fn replay_translog(
        &self,
        shard_id: &ShardId,
        shard: &Shard,
        source_address: &str,
        checkpoint: Option<u64>,
    ) -> Result<u64> {
        self.set_stage(shard_id, RecoveryStage::Translog);
        let mut after = checkpoint;
        let mut replayed = 0u64;
        loop {
            let response: TranslogResponse = send_typed(
                self.transport.as_ref(),
                source_address,
                RECOVERY_TRANSLOG_ACTION,
                &TranslogRequest {
                    shard_id: shard_id.clone(),
                    after_seq_no: after,
                },
                RECOVERY_REQUEST_TIMEOUT,
            )
            .await?;
            if response.ops.is_empty() {
                break;
            }
            for op in &response.ops {
                after = Some(after.map_or(op.seq_no(), |a| a.max(op.seq_no())));
                match shard.apply_operation(op, OperationOrigin::Recovery) {
                    Ok(()) => replayed += 1,
                    // Already covered by the file transfer or an earlier
                    // round.
                    Err(meridian::Error::SequenceConflict { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        if let Some(p) = self.progress.write().get_mut(shard_id) {
            p.ops_replayed = replayed;
        }
        debug!(shard = %shard_id, replayed, "recovery translog stage complete");
        Ok(replayed)
    }

    /// Stage 3: drain buffered live replication and mark the copy started.
    pub fn finish(&self, shard_id: &ShardId, shard: &Shard) -> Result<()> {
        let session = self.sessions.lock().remove(shard_id);
        if let Some(session) = session {
            let mut pending = session.pending.lock();
            pending.accepting = false;
            pending.ops.sort_by_key(|op| op.seq_no());
            for op in pending.ops.drain(..) {
                match shard.apply_operation(&op, OperationOrigin::Replica) {
                    Ok(()) => {}
                    Err(meridian::Error::SequenceConflict { .. }) => {}
                    Err(err) => {
                        self.set_stage(shard_id, RecoveryStage::Failed);
                        return Err(err.into());
                    }
                }
            }
            shard.mark_started();
        } else {
            shard.mark_started();
        }
        self.set_stage(shard_id, RecoveryStage::Done);
        info!(shard = %shard_id, "recovery complete");
        Ok(())
    }

    pub fn abort(&self, shard_id: &ShardId) {
        self.sessions.lock().remove(shard_id);
        self.set_stage(shard_id, RecoveryStage::Failed);
    }

    pub fn progress(&self, shard_id: &ShardId) -> Option<RecoveryProgress> {
        self.progress.read().get(shard_id).cloned()
    }

    pub fn all_progress(&self) -> HashMap<ShardId, RecoveryProgress> {
        self.progress.read().clone()
    }

    /// Restore segment files for one shard from a snapshot repository.
    pub async fn restore_snapshot(
        &self,
        repository: &dyn Repository,
        snapshot: &str,
        shard_id: &ShardId,
        shard_path: &ShardPath,
    ) -> Result<()> {
        self.set_stage(shard_id, RecoveryStage::Files);
        let metadata = repository.get_metadata(snapshot).await?;
        let key = SnapshotMetadata::shard_key(shard_id);
        let files = metadata.shards.get(&key).ok_or_else(|| {
            ClusterError::Validation(format!(
                "snapshot [{}] has no shard {}",
                snapshot, shard_id
            ))
        })?;

        shard_path.create_dirs().map_err(ClusterError::from)?;
        let index_dir = shard_path.index_dir();
        for file in files {
            let data = repository.get_blob(shard_id, &file.checksum).await?;
            std::fs::write(index_dir.join(&file.name), data).map_err(ClusterError::from)?;
        }
        ShardStateFile {
            index_uuid: shard_id.index_uuid.clone(),
            committed_seq_no: None,
            translog_generation: 1,
        }
        .persist(&shard_path.shard_dir)
        .map_err(ClusterError::from)?;
        Ok(())
    }

    async fn fetch_file(
        &self,
        shard_id: &ShardId,
        index_dir: &std::path::Path,
        file: &StoreFileMetadata,
        source_address: &str,
    ) -> Result<u64> {
        let tmp_path = index_dir.join(format!("{}.recovering", file.name));
        let mut out = std::fs::File::create(&tmp_path).map_err(ClusterError::from)?;
        let mut offset = 0u64;
        loop {
            let chunk: FileChunkResponse = send_typed(
                self.transport.as_ref(),
                source_address,
                RECOVERY_FILE_CHUNK_ACTION,
                &FileChunkRequest {
                    shard_id: shard_id.clone(),
                    file: file.name.clone(),
                    offset,
                    length: FILE_CHUNK_BYTES,
                },
                RECOVERY_REQUEST_TIMEOUT,
            )
            .await?;
            use std::io::Write;
            out.write_all(&chunk.data).map_err(ClusterError::from)?;
            offset += chunk.data.len() as u64;
            if chunk.eof {
                break;
            }
        }
        out.sync_data().map_err(ClusterError::from)?;
        drop(out);
        std::fs::rename(&tmp_path, index_dir.join(&file.name)).map_err(ClusterError::from)?;

        if offset != file.length {
            warn!(
                shard = %shard_id,
                file = %file.name,
                expected = file.length,
                got = offset,
                "recovered file length mismatch"
            );
            return Err(ClusterError::ShardFailure(format!(
                "recovered file [{}] is {} bytes, expected {}",
                file.name, offset, file.length
            )));
        }
        Ok(offset)
    }

    fn set_stage(&self, shard_id: &ShardId, stage: RecoveryStage) {
        let mut progress = self.progress.write();
        progress.entry(shard_id.clone()).or_default().stage = stage;
    }
}

fn source_shard(lookup: &ShardLookup, shard_id: &ShardId) -> Result<Arc<Shard>> {
    lookup(shard_id).ok_or_else(|| {
        ClusterError::UnavailableShards(format!("shard {} is not hosted here", shard_id))
    })
}

fn read_chunk(shard: &Shard, request: &FileChunkRequest) -> Result<FileChunkResponse> {
    // Served from the shard's index directory; the flush in the files stage
    // made these files immutable for the duration of the transfer.
    let files = shard.segment_files().map_err(ClusterError::from)?;
    let Some(meta) = files.iter().find(|f| f.name == request.file) else {
        return Err(ClusterError::Validation(format!(
            "no such recovery file [{}]",
            request.file
        )));
    };
    let path = shard_index_path(shard, &request.file);
    let mut file = std::fs::File::open(path).map_err(ClusterError::from)?;
    file.seek(SeekFrom::Start(request.offset))
        .map_err(ClusterError::from)?;
    let mut data = vec![0u8; request.length as usize];
    let mut read = 0usize;
    while read < data.len() {
        let n = file.read(&mut data[read..]).map_err(ClusterError::from)?;
        if n == 0 {
            break;
        }
        read += n;
    }
    data.truncate(read);
    let eof = request.offset + read as u64 >= meta.length;
    Ok(FileChunkResponse { data, eof })
}

fn shard_index_path(shard: &Shard, file: &str) -> std::path::PathBuf {
    shard.index_dir().join(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_session_lifecycle() {
        let transport = crate::transport::local::LocalTransport::new(
            &crate::transport::local::LocalNetwork::new(),
            "n",
        );
        let recovery = RecoveryService::new(transport as Arc<dyn Transport>);
        let shard_id = ShardId::new("u", 0);

        let op = Operation::Delete {
            id: "x".to_string(),
            seq_no: 7,
            version: 2,
        };
        // No session: ops apply directly.
        assert!(!recovery.buffer_replication(&shard_id, &op));

        recovery.begin_session(&shard_id);
        assert!(recovery.buffer_replication(&shard_id, &op));
        assert_eq!(
            recovery.progress(&shard_id).unwrap().stage,
            RecoveryStage::Init
        );

        recovery.abort(&shard_id);
        assert!(!recovery.buffer_replication(&shard_id, &op));
        assert_eq!(
            recovery.progress(&shard_id).unwrap().stage,
            RecoveryStage::Failed
        );
    }
}
