//! On-disk chunk storage engine (§4.5). Each chunk is one file named after its
//! handle, plus a JSON sidecar holding a 32-bit CRC per 64 KiB block so reads
//! can detect silent corruption without rehashing the whole chunk.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GfsError, GfsResult};
use crate::types::ChunkHandle;

pub const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Serialize, Deserialize, Default)]
struct ChunkSidecar {
    block_checksums: Vec<u32>,
}

pub struct ChunkStorage {
    data_dir: PathBuf,
}

impl ChunkStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> GfsResult<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn chunk_path(&self, handle: &ChunkHandle) -> PathBuf {
        self.data_dir.join(format!("{handle}.chunk"))
    }

    fn sidecar_path(&self, handle: &ChunkHandle) -> PathBuf {
        self.data_dir.join(format!("{handle}.checksums"))
    }

    fn block_checksums(data: &[u8]) -> Vec<u32> {
        data.chunks(BLOCK_SIZE)
            .map(|block| crc32fast::hash(block))
            .collect()
    }

    fn load(&self, handle: &ChunkHandle) -> GfsResult<Vec<u8>> {
        match fs::read(self.chunk_path(handle)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_sidecar(&self, handle: &ChunkHandle) -> GfsResult<ChunkSidecar> {
        match fs::read(self.sidecar_path(handle)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ChunkSidecar::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, handle: &ChunkHandle, contents: &[u8]) -> GfsResult<()> {
        let tmp = self.chunk_path(handle).with_extension("chunk.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(contents)?;
            f.flush()?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.chunk_path(handle))?;

        let sidecar = ChunkSidecar {
            block_checksums: Self::block_checksums(contents),
        };
        let sidecar_tmp = self.data_dir.join(format!("{handle}.checksums.tmp"));
        fs::write(&sidecar_tmp, serde_json::to_vec(&sidecar)?)?;
        fs::rename(&sidecar_tmp, self.sidecar_path(handle))?;
        Ok(())
    }

    pub fn size(&self, handle: &ChunkHandle) -> GfsResult<u64> {
        Ok(self.load(handle)?.len() as u64)
    }

    /// Writes `data` at `offset`, extending the chunk if needed. Reads the
    /// whole chunk, patches the byte range in memory, and rewrites the whole
    /// file — simple, and fine at the chunk sizes this system deals with.
    pub fn write_chunk(&self, handle: &ChunkHandle, offset: u64, data: &[u8]) -> GfsResult<(u64, u64)> {
        let mut contents = self.load(handle)?;
        let end = offset as usize + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[offset as usize..end].copy_from_slice(data);
        self.persist(handle, &contents)?;
        Ok((data.len() as u64, contents.len() as u64))
    }

    /// Overwrites a chunk wholesale with `contents` (used when receiving a
    /// clone from another chunkserver).
    pub fn write_whole(&self, handle: &ChunkHandle, contents: &[u8]) -> GfsResult<()> {
        self.persist(handle, contents)
    }

    pub fn read_chunk(
        &self,
        handle: &ChunkHandle,
        offset: u64,
        length: u64,
        verify: bool,
    ) -> GfsResult<Vec<u8>> {
        let contents = self.load(handle)?;
        if contents.is_empty() {
            return Err(GfsError::NotFound(handle.clone()));
        }

        if verify {
            let sidecar = self.load_sidecar(handle)?;
            let expected = Self::block_checksums(&contents);
            if expected != sidecar.block_checksums {
                return Err(GfsError::ChecksumError(handle.clone()));
            }
        }

        let start = (offset as usize).min(contents.len());
        let end = (start + length as usize).min(contents.len());
        Ok(contents[start..end].to_vec())
    }

    /// Appends `data` as a record at the current end of the chunk. If the
    /// chunk has no remaining space at all, fails as full (`(-1, 0)`). If it
    /// has some space but not enough for the whole record, writes only the
    /// leading `remaining` bytes of `data` — no padding — and returns
    /// `(offset, remaining)`; the caller is expected to retry the full
    /// record against a fresh chunk.
    pub fn append_record(&self, handle: &ChunkHandle, data: &[u8], chunk_size: u64) -> GfsResult<(i64, u64)> {
        let current_size = self.size(handle)?;
        let remaining = chunk_size.saturating_sub(current_size);

        if remaining == 0 {
            return Ok((-1, 0));
        }

        let to_write = (data.len() as u64).min(remaining);
        let offset = current_size;
        self.write_chunk(handle, offset, &data[..to_write as usize])?;
        Ok((offset as i64, to_write))
    }

    pub fn delete_chunk(&self, handle: &ChunkHandle) -> GfsResult<()> {
        let _ = fs::remove_file(self.chunk_path(handle));
        let _ = fs::remove_file(self.sidecar_path(handle));
        Ok(())
    }

    pub fn list_local_chunks(&self) -> GfsResult<HashSet<ChunkHandle>> {
        let mut handles = HashSet::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(name) = file_stem_if_chunk(&path) {
                handles.insert(name);
            }
        }
        Ok(handles)
    }
}

fn file_stem_if_chunk(path: &Path) -> Option<ChunkHandle> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".chunk").map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path()).unwrap();
        let handle = "h1".to_string();

        storage.write_chunk(&handle, 0, b"hello").unwrap();
        let data = storage.read_chunk(&handle, 0, 5, true).unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn write_extends_and_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path()).unwrap();
        let handle = "h1".to_string();

        storage.write_chunk(&handle, 0, b"AAAAAAAAAA").unwrap();
        storage.write_chunk(&handle, 3, b"BB").unwrap();
        let data = storage.read_chunk(&handle, 0, 10, true).unwrap();
        assert_eq!(&data, b"AAABBAAAAA");
    }

    #[test]
    fn read_past_end_of_chunk_returns_fewer_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path()).unwrap();
        let handle = "h1".to_string();
        storage.write_chunk(&handle, 0, b"abc").unwrap();

        let data = storage.read_chunk(&handle, 0, 100, true).unwrap();
        assert_eq!(data, b"abc");
    }

    #[test]
    fn corrupted_chunk_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path()).unwrap();
        let handle = "h1".to_string();
        storage.write_chunk(&handle, 0, b"abc").unwrap();

        std::fs::write(dir.path().join("h1.chunk"), b"xyz").unwrap();
        let err = storage.read_chunk(&handle, 0, 3, true).unwrap_err();
        assert!(matches!(err, GfsError::ChecksumError(_)));
    }

    #[test]
    fn append_fits_fully_when_space_allows() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path()).unwrap();
        let handle = "h1".to_string();

        let (offset, written) = storage.append_record(&handle, b"0123456789", 16).unwrap();
        assert_eq!((offset, written), (0, 10));
    }

    #[test]
    fn append_truncates_to_remaining_space_without_padding() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path()).unwrap();
        let handle = "h1".to_string();

        storage.append_record(&handle, b"0123456789", 16).unwrap();
        let (offset, written) = storage.append_record(&handle, b"ABCDEFGHIJ", 16).unwrap();
        assert_eq!((offset, written), (10, 6));
        assert_eq!(storage.size(&handle).unwrap(), 16);
    }

    #[test]
    fn append_to_a_full_chunk_reports_full() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path()).unwrap();
        let handle = "h1".to_string();

        storage.write_chunk(&handle, 0, &vec![0u8; 16]).unwrap();
        let (offset, written) = storage.append_record(&handle, b"more", 16).unwrap();
        assert_eq!((offset, written), (-1, 0));
    }

    #[test]
    fn list_local_chunks_finds_persisted_handles() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path()).unwrap();
        storage.write_chunk(&"h1".to_string(), 0, b"a").unwrap();
        storage.write_chunk(&"h2".to_string(), 0, b"b").unwrap();

        let handles = storage.list_local_chunks().unwrap();
        assert_eq!(handles.len(), 2);
        assert!(handles.contains("h1"));
        assert!(handles.contains("h2"));
    }
}
