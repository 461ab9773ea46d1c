//! Write-ahead log for the Master's metadata mutations (§4.4).
//!
//! Every mutating operation is appended as one JSON line and fsynced before the
//! caller is acknowledged. Recovery replays the log (after loading the latest
//! snapshot) to reconstruct in-memory state idempotently.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::GfsResult;
use crate::types::now_unix;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationKind {
    CreateFile,
    AllocateChunk,
    RegisterChunkServer,
    UpdateChunkSize,
    GrantLease,
    UpdateReplicas,
    DeleteChunk,
    IncrementVersion,
    SnapshotFile,
    RenameFile,
    DeleteFile,
    MarkGarbage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub sequence: u64,
    pub timestamp: u64,
    pub operation: OperationKind,
    pub data: Value,
}

/// Append-only, fsync-per-record log file.
pub struct Wal {
    path: PathBuf,
    file: File,
    sequence: u64,
}

impl Wal {
    /// Opens (or creates) the log at `dir/file_name`, recovering the last
    /// sequence number from whatever is already on disk.
    pub fn open(dir: &Path, file_name: &str) -> GfsResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(file_name);
        let sequence = Self::last_sequence_on_disk(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            sequence,
        })
    }

    fn last_sequence_on_disk(path: &Path) -> GfsResult<u64> {
        if !path.exists() {
            return Ok(0);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut last = 0u64;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<LogRecord>(&line) {
                last = record.sequence;
            }
        }
        Ok(last)
    }

    /// Appends one record, fsyncs, and returns its sequence number.
    pub fn append(&mut self, operation: OperationKind, data: Value) -> GfsResult<u64> {
        self.sequence += 1;
        let record = LogRecord {
            sequence: self.sequence,
            timestamp: now_unix(),
            operation,
            data,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(record.sequence)
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    /// Replays every record with `sequence > after_sequence`, applying each via
    /// `apply`. Used at startup after a snapshot has been loaded.
    pub fn replay<F>(path: &Path, after_sequence: u64, mut apply: F) -> GfsResult<usize>
    where
        F: FnMut(&LogRecord),
    {
        if !path.exists() {
            return Ok(0);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut count = 0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => {
                    if record.sequence > after_sequence {
                        apply(&record);
                        count += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("skipping unparseable WAL record: {e}");
                }
            }
        }
        Ok(count)
    }

    /// Truncates the log to only retain records after `checkpoint_sequence`.
    /// Crash-safe: the caller must have already durably written the snapshot
    /// that subsumes `checkpoint_sequence` before calling this.
    pub fn truncate_after(&mut self, checkpoint_sequence: u64) -> GfsResult<()> {
        let mut retained = Vec::new();
        if self.path.exists() {
            let file = File::open(&self.path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(record) = serde_json::from_str::<LogRecord>(&line) {
                    if record.sequence > checkpoint_sequence {
                        retained.push(line);
                    }
                }
            }
        }

        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for line in &retained {
                tmp.write_all(line.as_bytes())?;
                tmp.write_all(b"\n")?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_assigns_increasing_sequence_and_fsyncs() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path(), "wal.log").unwrap();
        let a = wal.append(OperationKind::CreateFile, json!({"path": "/a"})).unwrap();
        let b = wal.append(OperationKind::CreateFile, json!({"path": "/b"})).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(wal.last_sequence(), 2);
    }

    #[test]
    fn reopening_recovers_last_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = Wal::open(dir.path(), "wal.log").unwrap();
            wal.append(OperationKind::CreateFile, json!({"path": "/a"})).unwrap();
            wal.append(OperationKind::CreateFile, json!({"path": "/b"})).unwrap();
        }
        let wal = Wal::open(dir.path(), "wal.log").unwrap();
        assert_eq!(wal.last_sequence(), 2);
    }

    #[test]
    fn replay_applies_only_records_after_given_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(dir.path(), "wal.log").unwrap();
        wal.append(OperationKind::CreateFile, json!({"path": "/a"})).unwrap();
        wal.append(OperationKind::CreateFile, json!({"path": "/b"})).unwrap();
        wal.append(OperationKind::CreateFile, json!({"path": "/c"})).unwrap();

        let mut seen = Vec::new();
        let count = Wal::replay(&path, 1, |record| seen.push(record.sequence)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn truncate_after_drops_subsumed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(dir.path(), "wal.log").unwrap();
        wal.append(OperationKind::CreateFile, json!({"path": "/a"})).unwrap();
        wal.append(OperationKind::CreateFile, json!({"path": "/b"})).unwrap();
        wal.truncate_after(1).unwrap();

        let mut seen = Vec::new();
        Wal::replay(&path, 0, |record| seen.push(record.sequence)).unwrap();
        assert_eq!(seen, vec![2]);
    }
}
