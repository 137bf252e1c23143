//! On-disk shard layout and commit metadata.
//!
//! ```text
//! <data>/indices/<index-uuid>/<shard>/
//!     shard.state        commit metadata (JSON)
//!     translog/          write-ahead log generations
//!     index/             tantivy segments + meta.json
//! ```
//!
//! `shard.state` records the highest sequence number covered by the last
//! commit and the lowest translog generation still needed; restart replays
//! everything above it. Segment-file listings with checksums drive the
//! file-reuse diff in peer recovery.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const SHARD_STATE_FILE: &str = "shard.state";
pub const TRANSLOG_DIR: &str = "translog";
pub const INDEX_DIR: &str = "index";

/// Commit metadata persisted per shard copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStateFile {
    pub index_uuid: String,
    /// Highest sequence number contained in the last commit; `None` before
    /// the first flush.
    pub committed_seq_no: Option<u64>,
    /// Lowest translog generation that must be retained for replay.
    pub translog_generation: u64,
}

impl ShardStateFile {
    pub fn initial(index_uuid: impl Into<String>) -> Self {
        Self {
            index_uuid: index_uuid.into(),
            committed_seq_no: None,
            translog_generation: 1,
        }
    }

    pub fn load(shard_dir: &Path) -> Result<Option<ShardStateFile>> {
        let path = shard_dir.join(SHARD_STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Atomically persist via write-to-temp + rename.
    pub fn persist(&self, shard_dir: &Path) -> Result<()> {
        let tmp = shard_dir.join(format!("{}.tmp", SHARD_STATE_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, shard_dir.join(SHARD_STATE_FILE))?;
        Ok(())
    }
}

/// Metadata of one live segment file, as exchanged during recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFileMetadata {
    pub name: String,
    pub length: u64,
    /// Hex SHA-256 of the file contents.
    pub checksum: String,
}

impl StoreFileMetadata {
    /// Same name, length and checksum: the target can reuse its local copy.
    pub fn same(&self, other: &StoreFileMetadata) -> bool {
        self.name == other.name && self.length == other.length && self.checksum == other.checksum
    }
}

/// Filesystem locations for one shard copy.
#[derive(Debug, Clone)]
pub struct ShardPath {
    pub shard_dir: PathBuf,
}

impl ShardPath {
    pub fn new(data_dir: &Path, index_uuid: &str, shard: u32) -> ShardPath {
        ShardPath {
            shard_dir: data_dir
                .join("indices")
                .join(index_uuid)
                .join(shard.to_string()),
        }
    }

    pub fn translog_dir(&self) -> PathBuf {
        self.shard_dir.join(TRANSLOG_DIR)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.shard_dir.join(INDEX_DIR)
    }

    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.translog_dir())?;
        fs::create_dir_all(self.index_dir())?;
        Ok(())
    }
}

pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// List the segment files of a shard's index directory with checksums.
/// The write lock file is skipped; it is never transferred.
pub fn list_segment_files(index_dir: &Path) -> Result<Vec<StoreFileMetadata>> {
    let mut files = Vec::new();
    if !index_dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(index_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| Error::Validation("non-utf8 segment file name".to_string()))?;
        if name.ends_with(".lock") {
            continue;
        }
        files.push(StoreFileMetadata {
            length: entry.metadata()?.len(),
            checksum: file_checksum(&path)?,
            name,
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShardStateFile::load(dir.path()).unwrap().is_none());

        let state = ShardStateFile {
            index_uuid: "uuid-1".into(),
            committed_seq_no: Some(41),
            translog_generation: 3,
        };
        state.persist(dir.path()).unwrap();

        let loaded = ShardStateFile::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_shard_path_layout() {
        let path = ShardPath::new(Path::new("/data"), "abc", 2);
        assert_eq!(
            path.shard_dir,
            PathBuf::from("/data/indices/abc/2")
        );
        assert!(path.translog_dir().ends_with("translog"));
        assert!(path.index_dir().ends_with("index"));
    }

    #[test]
    fn test_list_segment_files_skips_lock() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("seg_0.store"), b"hello").unwrap();
        fs::write(dir.path().join("meta.json"), b"{}").unwrap();
        fs::write(dir.path().join(".tantivy-writer.lock"), b"").unwrap();

        let files = list_segment_files(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["meta.json", "seg_0.store"]);
        assert_eq!(files[1].length, 5);
    }

    #[test]
    fn test_checksum_detects_difference() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();
        assert_eq!(file_checksum(&a).unwrap(), file_checksum(&b).unwrap());

        fs::write(&b, b"other bytes").unwrap();
        assert_ne!(file_checksum(&a).unwrap(), file_checksum(&b).unwrap());
    }

    #[test]
    fn test_store_file_metadata_same() {
        let f = StoreFileMetadata {
            name: "seg_0".into(),
            length: 10,
            checksum: "aa".into(),
        };
        let mut g = f.clone();
        assert!(f.same(&g));
        g.checksum = "bb".into();
        assert!(!f.same(&g));
    }
}
