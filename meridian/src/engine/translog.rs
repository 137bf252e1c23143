//! Per-shard write-ahead log.
//!
//! Operations are appended before they touch the in-memory index; on restart
//! everything above the last commit point is replayed. Files are numbered by
//! generation and rolled on flush; generations below the commit point are
//! deleted once the commit metadata references a newer one.
//!
//! On-disk record framing:
//!
//! ```text
//! file   := header record*
//! header := magic "MTLG" | format u32 | generation u64
//! record := len u32 | payload (bincode Operation) | checksum u32
//! ```
//!
//! The checksum is the first four bytes of the payload's SHA-256. A cleanly
//! truncated tail (crash mid-append) is tolerated and replay stops there; a
//! checksum mismatch inside the file is corruption and fails the shard.

use crate::document::Operation;
use crate::error::{Error, Result};
use crate::settings::Durability;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"MTLG";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;

fn checksum(payload: &[u8]) -> u32 {
    let digest = Sha256::digest(payload);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn generation_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("translog-{}.log", generation))
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix("translog-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// List existing generations in ascending order.
fn list_generations(dir: &Path) -> Result<Vec<u64>> {
    let mut generations = Vec::new();
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(generation) = entry.file_name().to_str().and_then(parse_generation) {
                generations.push(generation);
            }
        }
    }
    generations.sort_unstable();
    Ok(generations)
}

struct Writer {
    generation: u64,
    file: File,
    bytes_written: u64,
    ops_written: u64,
    needs_sync: bool,
}

impl Writer {
    fn create(dir: &Path, generation: u64) -> Result<Writer> {
        let path = generation_path(dir, generation);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        file.write_all(MAGIC)?;
        file.write_all(&FORMAT_VERSION.to_be_bytes())?;
        file.write_all(&generation.to_be_bytes())?;
        file.sync_data()?;
        Ok(Writer {
            generation,
            file,
            bytes_written: HEADER_LEN,
            ops_written: 0,
            needs_sync: false,
        })
    }
}

pub struct Translog {
    dir: PathBuf,
    durability: Durability,
    writer: Mutex<Writer>,
}

impl Translog {
    /// Open the translog for appends, creating a fresh generation after any
    /// existing ones.
    pub fn open(dir: impl Into<PathBuf>, durability: Durability) -> Result<Translog> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let next_generation = list_generations(&dir)?.last().map(|g| g + 1).unwrap_or(1);
        let writer = Writer::create(&dir, next_generation)?;
        debug!(generation = next_generation, "opened translog");
        Ok(Translog {
            dir,
            durability,
            writer: Mutex::new(writer),
        })
    }

    /// Replay every operation recorded in generations >= `min_generation`,
    /// in file order.
    pub fn recover_operations(dir: &Path, min_generation: u64) -> Result<Vec<Operation>> {
        let mut ops = Vec::new();
        for generation in list_generations(dir)? {
            if generation < min_generation {
                continue;
            }
            read_file(&generation_path(dir, generation), &mut ops)?;
        }
        Ok(ops)
    }

    /// Append one operation; durability `Request` fsyncs before returning.
    pub fn append(&self, op: &Operation) -> Result<()> {
        let payload = bincode::serialize(op)?;
        let mut record = Vec::with_capacity(payload.len() + 8);
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        record.extend_from_slice(&payload);
        record.extend_from_slice(&checksum(&payload).to_be_bytes());

        let mut writer = self.writer.lock();
        writer.file.write_all(&record)?;
        writer.bytes_written += record.len() as u64;
        writer.ops_written += 1;
        if self.durability == Durability::Request {
            writer.file.sync_data()?;
        } else {
            writer.needs_sync = true;
        }
        Ok(())
    }

    /// fsync outstanding appends (async durability interval, and flush).
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.needs_sync {
            writer.file.sync_data()?;
            writer.needs_sync = false;
        }
        Ok(())
    }

    /// Close the current generation and start a new one. Returns the new
    /// generation number.
    pub fn roll_generation(&self) -> Result<u64> {
        let mut writer = self.writer.lock();
        writer.file.sync_data()?;
        let next = writer.generation + 1;
        *writer = Writer::create(&self.dir, next)?;
        Ok(next)
    }

    /// Delete generations strictly below `min_generation`.
    pub fn trim_below(&self, min_generation: u64) -> Result<()> {
        let _writer = self.writer.lock();
        for generation in list_generations(&self.dir)? {
            if generation < min_generation {
                fs::remove_file(generation_path(&self.dir, generation))?;
                debug!(generation, "trimmed translog generation");
            }
        }
        Ok(())
    }

    /// Read back every retained operation with `seq_no > after_seq_no`.
    /// Used by peer recovery while the shard keeps accepting writes.
    pub fn operations_since(&self, after_seq_no: Option<u64>) -> Result<Vec<Operation>> {
        {
            // Make sure the current file's tail is visible to the read path.
            let mut writer = self.writer.lock();
            writer.file.flush()?;
        }
        let mut ops = Vec::new();
        for generation in list_generations(&self.dir)? {
            read_file(&generation_path(&self.dir, generation), &mut ops)?;
        }
        ops.retain(|op| match after_seq_no {
            Some(after) => op.seq_no() > after,
            None => true,
        });
        ops.sort_by_key(|op| op.seq_no());
        Ok(ops)
    }

    pub fn current_generation(&self) -> u64 {
        self.writer.lock().generation
    }

    pub fn uncommitted_bytes(&self) -> u64 {
        self.writer.lock().bytes_written
    }

    pub fn uncommitted_operations(&self) -> u64 {
        self.writer.lock().ops_written
    }
}

fn read_file(path: &Path, ops: &mut Vec<Operation>) -> Result<()> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    if data.len() < HEADER_LEN as usize || &data[0..4] != MAGIC {
        return Err(Error::TranslogCorrupted(format!(
            "bad header in {}",
            path.display()
        )));
    }
    let format = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if format != FORMAT_VERSION {
        return Err(Error::TranslogCorrupted(format!(
            "unsupported translog format [{}] in {}",
            format,
            path.display()
        )));
    }

    let mut pos = HEADER_LEN as usize;
    loop {
        if pos == data.len() {
            break;
        }
        if pos + 4 > data.len() {
            warn!(path = %path.display(), "truncated translog tail; stopping replay");
            break;
        }
        let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let end = pos + 4 + len + 4;
        if end > data.len() {
            warn!(path = %path.display(), "truncated translog record; stopping replay");
            break;
        }
        let payload = &data[pos + 4..pos + 4 + len];
        let recorded = u32::from_be_bytes(data[pos + 4 + len..end].try_into().unwrap());
        if checksum(payload) != recorded {
            return Err(Error::TranslogCorrupted(format!(
                "checksum mismatch at offset {} in {}",
                pos,
                path.display()
            )));
        }
        let op: Operation = bincode::deserialize(payload)?;
        ops.push(op);
        pos = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Seek;

    fn index_op(id: &str, seq_no: u64) -> Operation {
        Operation::Index {
            id: id.to_string(),
            source: json!({"body": "quick brown fox"}),
            routing: None,
            seq_no,
            version: 1,
        }
    }

    #[test]
    fn test_append_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::open(dir.path(), Durability::Request).unwrap();
        translog.append(&index_op("a", 0)).unwrap();
        translog.append(&index_op("b", 1)).unwrap();
        translog
            .append(&Operation::Delete {
                id: "a".into(),
                seq_no: 2,
                version: 2,
            })
            .unwrap();
        drop(translog);

        let ops = Translog::recover_operations(dir.path(), 0).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].id(), "a");
        assert_eq!(ops[2].op_type(), "delete");
    }

    #[test]
    fn test_roll_and_trim() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::open(dir.path(), Durability::Request).unwrap();
        let first = translog.current_generation();
        translog.append(&index_op("a", 0)).unwrap();

        let next = translog.roll_generation().unwrap();
        assert_eq!(next, first + 1);
        translog.append(&index_op("b", 1)).unwrap();

        translog.trim_below(next).unwrap();
        let ops = Translog::recover_operations(dir.path(), 0).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id(), "b");
    }

    #[test]
    fn test_recover_skips_below_min_generation() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::open(dir.path(), Durability::Request).unwrap();
        translog.append(&index_op("old", 0)).unwrap();
        let next = translog.roll_generation().unwrap();
        translog.append(&index_op("new", 1)).unwrap();
        drop(translog);

        let ops = Translog::recover_operations(dir.path(), next).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id(), "new");
    }

    #[test]
    fn test_operations_since_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::open(dir.path(), Durability::Request).unwrap();
        for seq in 0..5 {
            translog.append(&index_op(&format!("d{}", seq), seq)).unwrap();
        }
        let ops = translog.operations_since(Some(2)).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].seq_no(), 3);
        assert_eq!(ops[1].seq_no(), 4);
    }

    #[test]
    fn test_truncated_tail_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::open(dir.path(), Durability::Request).unwrap();
        translog.append(&index_op("a", 0)).unwrap();
        translog.append(&index_op("b", 1)).unwrap();
        let generation = translog.current_generation();
        drop(translog);

        // Chop a few bytes off the end, as a crash mid-append would.
        let path = generation_path(dir.path(), generation);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 3).unwrap();

        let ops = Translog::recover_operations(dir.path(), 0).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id(), "a");
    }

    #[test]
    fn test_corrupted_record_fails() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::open(dir.path(), Durability::Request).unwrap();
        translog.append(&index_op("a", 0)).unwrap();
        let generation = translog.current_generation();
        drop(translog);

        // Flip a payload byte past the header and length prefix.
        let path = generation_path(dir.path(), generation);
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(std::io::SeekFrom::Start(HEADER_LEN + 6)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(std::io::SeekFrom::Start(HEADER_LEN + 6)).unwrap();
        file.write_all(&[byte[0] ^ 0xff]).unwrap();

        let err = Translog::recover_operations(dir.path(), 0).unwrap_err();
        assert!(matches!(err, Error::TranslogCorrupted(_)));
    }

    #[test]
    fn test_async_durability_defers_sync() {
        let dir = tempfile::tempdir().unwrap();
        let translog = Translog::open(dir.path(), Durability::Async).unwrap();
        translog.append(&index_op("a", 0)).unwrap();
        assert!(translog.writer.lock().needs_sync);
        translog.sync().unwrap();
        assert!(!translog.writer.lock().needs_sync);
    }
}
