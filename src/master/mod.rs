//! The Master: namespace, chunk placement, and lease authority (§4.1-§4.4).

pub mod background;
pub mod service;
pub mod snapshot;
pub mod state;
pub mod wal;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::{CommonConfig, MasterConfig};
use crate::error::{GfsError, GfsResult};
use snapshot::Snapshot;
use state::MasterState;
use wal::{OperationKind, Wal};

/// Everything guarded by the Master's single mutex: metadata plus the log that
/// durably records every mutation to it. Both live behind one lock (§5) so a
/// mutation and its WAL record are never observed apart from one another.
pub struct MasterInner {
    pub state: MasterState,
    pub wal: Wal,
    pub last_checkpoint_sequence: u64,
}

impl MasterInner {
    /// Appends a record unless `log_data` is `Null`, which marks an idempotent
    /// no-op retry (e.g. re-allocating an already-allocated chunk index).
    fn maybe_log(&mut self, kind: OperationKind, data: serde_json::Value) -> GfsResult<()> {
        if data.is_null() {
            return Ok(());
        }
        self.wal.append(kind, data)?;
        Ok(())
    }

    fn log_many(&mut self, records: Vec<(OperationKind, serde_json::Value)>) -> GfsResult<()> {
        for (kind, data) in records {
            self.wal.append(kind, data)?;
        }
        Ok(())
    }
}

pub struct Master {
    pub inner: Mutex<MasterInner>,
    pub config: MasterConfig,
    pub common: CommonConfig,
    pub metadata_dir: PathBuf,
}

impl Master {
    /// Recovers state from the latest snapshot plus WAL replay, then opens the
    /// log for further appends. This is the Master's entire crash-recovery story
    /// (§4.4): snapshot gets you close, the WAL tail gets you exact.
    pub async fn open(config: MasterConfig, common: CommonConfig) -> GfsResult<Arc<Self>> {
        let metadata_dir = PathBuf::from(&config.metadata_dir);
        std::fs::create_dir_all(&metadata_dir)?;

        let snapshot_path = metadata_dir.join(&config.snapshot_file);
        let wal_path = metadata_dir.join(&config.wal_file);

        let snapshot = Snapshot::load(&snapshot_path)?;
        let (mut state, last_checkpoint_sequence) = match snapshot {
            Some(s) => {
                let seq = s.last_sequence;
                (MasterState::from_snapshot(s), seq)
            }
            None => (MasterState::new(), 0),
        };

        let replayed = Wal::replay(&wal_path, last_checkpoint_sequence, |record| {
            state.apply_record(record);
        })?;
        info!(replayed, "recovered master state from snapshot + WAL");

        let wal = Wal::open(&metadata_dir, &config.wal_file)?;

        Ok(Arc::new(Self {
            inner: Mutex::new(MasterInner {
                state,
                wal,
                last_checkpoint_sequence,
            }),
            config,
            common,
            metadata_dir,
        }))
    }

    fn snapshot_path(&self) -> PathBuf {
        self.metadata_dir.join(&self.config.snapshot_file)
    }

    /// Writes a full snapshot at the current sequence and truncates the WAL
    /// up to that point. Called periodically by the background checkpoint task.
    pub async fn checkpoint(&self) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        let sequence = inner.wal.last_sequence();
        let snapshot = inner.state.to_snapshot(sequence);
        snapshot.save(&self.snapshot_path())?;
        inner.wal.truncate_after(sequence)?;
        inner.last_checkpoint_sequence = sequence;
        info!(sequence, "checkpointed master metadata");
        Ok(())
    }

    // ---- namespace operations ------------------------------------------

    pub async fn create_file(&self, path: &str) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner.state.create_file(path)?;
        inner.maybe_log(OperationKind::CreateFile, data)?;
        Ok(())
    }

    pub async fn get_file_info(&self, path: &str) -> GfsResult<state::FileInfoView> {
        let inner = self.inner.lock().await;
        inner.state.get_file_info(path)
    }

    pub async fn list_directory(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.state.list_directory(prefix)
    }

    pub async fn rename_file(&self, old: &str, new: &str) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner.state.rename_file(old, new)?;
        inner.maybe_log(OperationKind::RenameFile, data)?;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner.state.delete_file(path)?;
        inner.maybe_log(OperationKind::DeleteFile, data)?;
        Ok(())
    }

    pub async fn snapshot_file(&self, src: &str, dst: &str) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner.state.snapshot_file(src, dst)?;
        inner.maybe_log(OperationKind::SnapshotFile, data)?;
        Ok(())
    }

    // ---- chunk allocation / lease ---------------------------------------

    pub async fn allocate_chunk(
        &self,
        path: &str,
        chunk_index: usize,
    ) -> GfsResult<(crate::types::ChunkHandle, Vec<crate::types::ChunkLocation>, Option<String>)> {
        let mut inner = self.inner.lock().await;
        let (handle, replicas, primary_id, is_new, data) =
            inner.state.allocate_chunk(path, chunk_index, self.common.replication_factor)?;
        if is_new {
            inner.maybe_log(OperationKind::AllocateChunk, data)?;
        }
        Ok((handle, replicas, primary_id))
    }

    pub async fn get_chunk_locations(
        &self,
        handle: &crate::types::ChunkHandle,
    ) -> GfsResult<(Vec<crate::types::ChunkLocation>, Option<String>, u64, u64)> {
        let mut inner = self.inner.lock().await;
        let outcome = inner
            .state
            .get_or_grant_lease(handle, self.common.lease_duration)?;
        if !outcome.log_records.is_empty() {
            inner.log_many(outcome.log_records)?;
        }
        let view = inner
            .state
            .chunk_view(handle)
            .ok_or_else(|| GfsError::NotFound(handle.clone()))?;
        Ok((view.replicas, outcome.primary_id, view.size, view.reference_count))
    }

    pub async fn update_chunk_size(&self, handle: &crate::types::ChunkHandle, size: u64) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner.state.update_chunk_size(handle, size)?;
        inner.maybe_log(OperationKind::UpdateChunkSize, data)?;
        Ok(())
    }

    pub async fn clone_shared_chunk(
        &self,
        path: &str,
        chunk_index: usize,
        old_handle: &crate::types::ChunkHandle,
    ) -> GfsResult<(crate::types::ChunkHandle, Vec<crate::types::ChunkLocation>)> {
        let mut inner = self.inner.lock().await;
        let (new_handle, src_replicas, data) =
            inner.state.clone_shared_chunk(path, chunk_index, old_handle)?;
        inner.maybe_log(OperationKind::AllocateChunk, data)?;
        Ok((new_handle, src_replicas))
    }

    pub async fn record_replica_added(
        &self,
        handle: &crate::types::ChunkHandle,
        loc: crate::types::ChunkLocation,
    ) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(data) = inner.state.record_replica_added(handle, loc) {
            inner.maybe_log(OperationKind::UpdateReplicas, data)?;
        }
        Ok(())
    }

    // ---- chunkserver registration / heartbeat ---------------------------

    pub async fn register_chunkserver(
        &self,
        id: &str,
        address: &str,
        rack_id: &str,
        chunks: Vec<crate::types::ChunkHandle>,
    ) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner.state.register_chunkserver(id, address, rack_id, chunks);
        inner.maybe_log(OperationKind::RegisterChunkServer, data)?;
        Ok(())
    }

    pub async fn heartbeat(&self, id: &str, chunks: Vec<crate::types::ChunkHandle>) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        inner.state.heartbeat(id, chunks)
    }

    // ---- background maintenance (§4.3, used by `background`) ------------

    pub async fn detect_dead_chunkservers(&self) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        inner.state.detect_dead_chunkservers(self.common.heartbeat_timeout)
    }

    pub async fn chunks_needing_replication(&self) -> Vec<crate::types::ChunkHandle> {
        let inner = self.inner.lock().await;
        inner.state.chunks_needing_replication(self.common.replication_factor)
    }

    pub async fn select_source_and_target(
        &self,
        handle: &crate::types::ChunkHandle,
    ) -> Option<(String, String, String, String)> {
        let inner = self.inner.lock().await;
        inner.state.select_source_and_target(handle)
    }

    pub async fn mark_garbage_pass(&self) -> GfsResult<usize> {
        let mut inner = self.inner.lock().await;
        let marked = inner.state.mark_garbage_pass();
        let count = marked.len();
        inner.log_many(
            marked
                .into_iter()
                .map(|(_, data)| (OperationKind::MarkGarbage, data))
                .collect(),
        )?;
        Ok(count)
    }

    pub async fn collect_deletable_garbage(&self) -> Vec<(crate::types::ChunkHandle, Vec<crate::types::ChunkLocation>)> {
        let inner = self.inner.lock().await;
        inner.state.collect_deletable_garbage(self.config.retention_window_secs)
    }

    pub async fn physically_delete_chunk(&self, handle: &crate::types::ChunkHandle) -> GfsResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner.state.physically_delete_chunk(handle);
        inner.maybe_log(OperationKind::DeleteChunk, data)
    }
}
