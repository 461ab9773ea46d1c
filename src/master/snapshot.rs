//! Full point-in-time serialization of Master metadata (§4.4).
//!
//! A snapshot plus WAL replay from `last_sequence` onward is the Master's entire
//! recovery story: load the snapshot, then replay, then start serving.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::error::GfsResult;
use crate::types::{ChunkHandle, ChunkMetadata, ChunkServerInfo, FileMetadata};

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub last_sequence: u64,
    pub files: HashMap<String, FileMetadata>,
    pub chunks: HashMap<ChunkHandle, ChunkMetadata>,
    pub chunkservers: HashMap<String, ChunkServerInfo>,
}

impl Snapshot {
    /// Writes the snapshot to a temp file in the same directory, fsyncs it, then
    /// atomically renames it into place — the old snapshot is never observable in
    /// a half-written state.
    pub fn save(&self, path: &Path) -> GfsResult<()> {
        let tmp_path = path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, self)?;
            use std::io::Write;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> GfsResult<Option<Snapshot>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let snapshot: Snapshot = serde_json::from_reader(file)?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileMetadata;

    #[test]
    fn missing_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        assert!(Snapshot::load(&path).unwrap().is_none());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        let mut snapshot = Snapshot {
            last_sequence: 42,
            ..Default::default()
        };
        snapshot.files.insert("/a".to_string(), FileMetadata::new("/a"));
        snapshot.save(&path).unwrap();

        let loaded = Snapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded.last_sequence, 42);
        assert!(loaded.files.contains_key("/a"));
    }
}
