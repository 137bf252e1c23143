//! Snapshot repositories: content-addressed blob storage for segment files.
//!
//! Layout: `indices/<index-uuid>/<shard>/<checksum>` for file blobs, plus a
//! snapshot metadata document enumerating the files of each shard. Because
//! blobs are addressed by checksum, an incremental snapshot only uploads
//! files the repository does not already hold. Only the protocol hook and a
//! filesystem implementation live here; external object stores plug in
//! behind the same trait.

use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use meridian::engine::store::StoreFileMetadata;
use meridian::ShardId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Metadata of one snapshot: which files make up each shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot: String,
    /// shard → files (name, length, checksum).
    pub shards: BTreeMap<String, Vec<StoreFileMetadata>>,
}

impl SnapshotMetadata {
    pub fn shard_key(shard_id: &ShardId) -> String {
        format!("{}/{}", shard_id.index_uuid, shard_id.shard)
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Store a blob under its content address; a no-op when it exists.
    async fn put_blob(&self, shard_id: &ShardId, checksum: &str, data: Vec<u8>) -> Result<()>;

    async fn get_blob(&self, shard_id: &ShardId, checksum: &str) -> Result<Vec<u8>>;

    async fn has_blob(&self, shard_id: &ShardId, checksum: &str) -> Result<bool>;

    async fn put_metadata(&self, metadata: &SnapshotMetadata) -> Result<()>;

    async fn get_metadata(&self, snapshot: &str) -> Result<SnapshotMetadata>;
}

/// Filesystem-backed repository.
pub struct FsRepository {
    root: PathBuf,
}

impl FsRepository {
    pub fn new(root: impl Into<PathBuf>) -> FsRepository {
        FsRepository { root: root.into() }
    }

    fn blob_path(&self, shard_id: &ShardId, checksum: &str) -> PathBuf {
        self.root
            .join("indices")
            .join(&shard_id.index_uuid)
            .join(shard_id.shard.to_string())
            .join(checksum)
    }

    fn metadata_path(&self, snapshot: &str) -> PathBuf {
        self.root.join(format!("snap-{}.json", snapshot))
    }
}

#[async_trait]
impl Repository for FsRepository {
    async fn put_blob(&self, shard_id: &ShardId, checksum: &str, data: Vec<u8>) -> Result<()> {
        let path = self.blob_path(shard_id, checksum);
        if path.exists() {
            // Content-addressed: an existing blob is the same blob.
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn get_blob(&self, shard_id: &ShardId, checksum: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(shard_id, checksum);
        tokio::fs::read(&path)
            .await
            .map_err(|e| ClusterError::Internal(format!("blob {} missing: {}", checksum, e)))
    }

    async fn has_blob(&self, shard_id: &ShardId, checksum: &str) -> Result<bool> {
        Ok(self.blob_path(shard_id, checksum).exists())
    }

    async fn put_metadata(&self, metadata: &SnapshotMetadata) -> Result<()> {
        let path = self.metadata_path(&metadata.snapshot);
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(metadata)?).await?;
        Ok(())
    }

    async fn get_metadata(&self, snapshot: &str) -> Result<SnapshotMetadata> {
        let path = self.metadata_path(snapshot);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| ClusterError::Internal(format!("snapshot {} missing: {}", snapshot, e)))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ShardId {
        ShardId::new("uuid-1", 0)
    }

    #[tokio::test]
    async fn test_blob_roundtrip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsRepository::new(dir.path());
        repo.put_blob(&shard(), "abc123", b"segment bytes".to_vec())
            .await
            .unwrap();

        assert!(repo.has_blob(&shard(), "abc123").await.unwrap());
        assert!(!repo.has_blob(&shard(), "zzz").await.unwrap());
        assert_eq!(
            repo.get_blob(&shard(), "abc123").await.unwrap(),
            b"segment bytes"
        );
        assert!(dir
            .path()
            .join("indices")
            .join("uuid-1")
            .join("0")
            .join("abc123")
            .exists());
    }

    #[tokio::test]
    async fn test_put_blob_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsRepository::new(dir.path());
        repo.put_blob(&shard(), "x", b"first".to_vec()).await.unwrap();
        // The second write with the same address is skipped entirely.
        repo.put_blob(&shard(), "x", b"second".to_vec()).await.unwrap();
        assert_eq!(repo.get_blob(&shard(), "x").await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsRepository::new(dir.path());
        let mut metadata = SnapshotMetadata {
            snapshot: "nightly-1".to_string(),
            shards: BTreeMap::new(),
        };
        metadata.shards.insert(
            SnapshotMetadata::shard_key(&shard()),
            vec![StoreFileMetadata {
                name: "meta.json".to_string(),
                length: 2,
                checksum: "ff".to_string(),
            }],
        );
        repo.put_metadata(&metadata).await.unwrap();
        let loaded = repo.get_metadata("nightly-1").await.unwrap();
        assert_eq!(loaded, metadata);
    }
}
