//! The Master's authoritative in-memory metadata and the operations over it
//! (§4.1, §4.2, §4.3 of the design). Every mutating method here is called with
//! the Master's single mutex held (see `master::Master`); none of them perform
//! I/O or RPCs themselves — those are the caller's job, outside the lock.

use serde_json::json;
use std::collections::{HashMap, HashSet};

use crate::error::{GfsError, GfsResult};
use crate::master::snapshot::Snapshot;
use crate::master::wal::{LogRecord, OperationKind};
use crate::types::{
    new_chunk_handle, now_unix, ChunkHandle, ChunkLocation, ChunkMetadata, ChunkServerInfo,
    FileMetadata, LeaseInfo,
};

/// A single field of a `ChunkInfo` returned to clients, fully reconciled against
/// chunkserver liveness and reported inventory (§3 "ownership" — replicas are a
/// weak reference; this is where the reconciliation actually happens).
#[derive(Clone, Debug)]
pub struct ChunkView {
    pub handle: ChunkHandle,
    pub replicas: Vec<ChunkLocation>,
    pub primary_id: Option<String>,
    pub size: u64,
    pub version: u64,
    pub reference_count: u64,
}

#[derive(Clone, Debug)]
pub struct FileInfoView {
    pub path: String,
    pub chunk_handles: Vec<Option<ChunkHandle>>,
    pub chunks_info: Vec<ChunkView>,
}

/// Outcome of a lease request: who the primary is (if any), plus zero or more
/// WAL records the caller must persist before acknowledging (INCREMENT_VERSION
/// followed by GRANT_LEASE, only when a new lease was actually granted).
pub struct LeaseOutcome {
    pub primary_id: Option<String>,
    pub log_records: Vec<(OperationKind, serde_json::Value)>,
}

#[derive(Default)]
pub struct MasterState {
    pub files: HashMap<String, FileMetadata>,
    pub chunks: HashMap<ChunkHandle, ChunkMetadata>,
    pub chunkservers: HashMap<String, ChunkServerInfo>,
    pub leases: HashMap<ChunkHandle, LeaseInfo>,
    pub chunkserver_chunks: HashMap<String, HashSet<ChunkHandle>>,
}

impl MasterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut chunkserver_chunks: HashMap<String, HashSet<ChunkHandle>> = HashMap::new();
        for (id, cs) in &snapshot.chunkservers {
            chunkserver_chunks.insert(id.clone(), cs.reported_chunks.clone());
        }
        Self {
            files: snapshot.files,
            chunks: snapshot.chunks,
            chunkservers: snapshot.chunkservers,
            leases: HashMap::new(),
            chunkserver_chunks,
        }
    }

    pub fn to_snapshot(&self, last_sequence: u64) -> Snapshot {
        // ChunkServers are marked dead in the snapshot (is_alive = false):
        // recovery requires re-registration before a replica counts as live.
        let mut chunkservers = self.chunkservers.clone();
        for cs in chunkservers.values_mut() {
            cs.is_alive = false;
        }
        Snapshot {
            last_sequence,
            files: self.files.clone(),
            chunks: self.chunks.clone(),
            chunkservers,
        }
    }

    fn is_replica_effective(&self, handle: &ChunkHandle, cs_id: &str) -> bool {
        self.chunkservers
            .get(cs_id)
            .map(|cs| cs.is_alive)
            .unwrap_or(false)
            && self
                .chunkserver_chunks
                .get(cs_id)
                .map(|set| set.contains(handle))
                .unwrap_or(false)
    }

    /// Reconciles a chunk's recorded replica list against current chunkserver
    /// liveness and reported inventory. This supersedes any stale entry in
    /// `ChunkMetadata::replicas` (§3).
    pub fn effective_replicas(&self, handle: &ChunkHandle) -> Vec<ChunkLocation> {
        let Some(meta) = self.chunks.get(handle) else {
            return Vec::new();
        };
        meta.replicas
            .iter()
            .filter(|r| self.is_replica_effective(handle, &r.chunkserver_id))
            .cloned()
            .collect()
    }

    pub fn chunk_view(&self, handle: &ChunkHandle) -> Option<ChunkView> {
        let meta = self.chunks.get(handle)?;
        Some(ChunkView {
            handle: handle.clone(),
            replicas: self.effective_replicas(handle),
            primary_id: meta.primary_id.clone(),
            size: meta.size,
            version: meta.version,
            reference_count: meta.reference_count,
        })
    }

    // ---- namespace ----------------------------------------------------

    pub fn create_file(&mut self, path: &str) -> GfsResult<serde_json::Value> {
        if self.files.contains_key(path) {
            return Err(GfsError::AlreadyExists(path.to_string()));
        }
        self.files.insert(path.to_string(), FileMetadata::new(path));
        Ok(json!({ "path": path }))
    }

    pub fn get_file_info(&self, path: &str) -> GfsResult<FileInfoView> {
        let meta = self
            .files
            .get(path)
            .ok_or_else(|| GfsError::NotFound(path.to_string()))?;
        let chunks_info = meta
            .chunk_handles
            .iter()
            .filter_map(|h| h.as_ref())
            .filter_map(|h| self.chunk_view(h))
            .collect();
        Ok(FileInfoView {
            path: meta.path.clone(),
            chunk_handles: meta.chunk_handles.clone(),
            chunks_info,
        })
    }

    pub fn list_directory(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .files
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    pub fn rename_file(&mut self, old: &str, new: &str) -> GfsResult<serde_json::Value> {
        if !self.files.contains_key(old) {
            return Err(GfsError::NotFound(old.to_string()));
        }
        if self.files.contains_key(new) {
            return Err(GfsError::AlreadyExists(new.to_string()));
        }
        let mut meta = self.files.remove(old).unwrap();
        meta.path = new.to_string();
        self.files.insert(new.to_string(), meta);
        Ok(json!({ "old_path": old, "new_path": new }))
    }

    pub fn delete_file(&mut self, path: &str) -> GfsResult<serde_json::Value> {
        let meta = self
            .files
            .remove(path)
            .ok_or_else(|| GfsError::NotFound(path.to_string()))?;
        let now = now_unix();
        for handle in meta.chunk_handles.into_iter().flatten() {
            self.decrement_reference(&handle, now);
        }
        Ok(json!({ "path": path }))
    }

    fn decrement_reference(&mut self, handle: &ChunkHandle, now: u64) {
        if let Some(chunk) = self.chunks.get_mut(handle) {
            chunk.reference_count = chunk.reference_count.saturating_sub(1);
            if chunk.reference_count == 0 && chunk.garbage_since.is_none() {
                chunk.garbage_since = Some(now);
            }
        }
    }

    // ---- chunk allocation & placement ----------------------------------

    /// Picks up to `count` distinct alive chunkservers, preferring distinct
    /// rack ids; falls back to any remaining alive server once racks run out.
    pub fn select_replicas(&self, count: usize) -> Vec<ChunkLocation> {
        let mut by_rack: HashMap<&str, Vec<&ChunkServerInfo>> = HashMap::new();
        for cs in self.chunkservers.values() {
            if cs.is_alive {
                by_rack.entry(cs.rack_id.as_str()).or_default().push(cs);
            }
        }

        let mut chosen: Vec<ChunkLocation> = Vec::new();
        let mut chosen_ids: HashSet<&str> = HashSet::new();

        // Round-robin across racks first so replicas land on distinct racks
        // whenever there are enough of them.
        let mut racks: Vec<&str> = by_rack.keys().copied().collect();
        racks.sort();
        let mut rack_cursor = 0usize;
        while chosen.len() < count && !racks.is_empty() {
            let rack = racks[rack_cursor % racks.len()];
            rack_cursor += 1;
            if let Some(candidates) = by_rack.get(rack) {
                if let Some(cs) = candidates
                    .iter()
                    .find(|cs| !chosen_ids.contains(cs.id.as_str()))
                {
                    chosen_ids.insert(cs.id.as_str());
                    chosen.push(ChunkLocation {
                        chunkserver_id: cs.id.clone(),
                        address: cs.address.clone(),
                    });
                }
            }
            if rack_cursor >= racks.len() * count.max(1) {
                break;
            }
        }

        // Fill any remaining slots from any alive server not already chosen.
        if chosen.len() < count {
            let mut all: Vec<&ChunkServerInfo> = self.chunkservers.values().filter(|cs| cs.is_alive).collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            for cs in all {
                if chosen.len() >= count {
                    break;
                }
                if !chosen_ids.contains(cs.id.as_str()) {
                    chosen_ids.insert(cs.id.as_str());
                    chosen.push(ChunkLocation {
                        chunkserver_id: cs.id.clone(),
                        address: cs.address.clone(),
                    });
                }
            }
        }

        chosen
    }

    /// Returns `(handle, replicas, primary_id, is_new)`. `is_new == false` means
    /// this was an idempotent retry of an already-allocated chunk_index and the
    /// caller must not write a new WAL record.
    pub fn allocate_chunk(
        &mut self,
        path: &str,
        chunk_index: usize,
        replication_factor: usize,
    ) -> GfsResult<(ChunkHandle, Vec<ChunkLocation>, Option<String>, bool, serde_json::Value)> {
        if !self.files.contains_key(path) {
            return Err(GfsError::NotFound(path.to_string()));
        }

        if let Some(existing) = self
            .files
            .get(path)
            .and_then(|f| f.chunk_handles.get(chunk_index).cloned().flatten())
        {
            let meta = self.chunks.get(&existing).expect("dangling chunk handle");
            return Ok((
                existing,
                meta.replicas.clone(),
                meta.primary_id.clone(),
                false,
                serde_json::Value::Null,
            ));
        }

        let replicas = self.select_replicas(replication_factor);
        if replicas.is_empty() {
            return Err(GfsError::NoCapacity(
                "no alive chunkserver available for placement".to_string(),
            ));
        }

        let handle = new_chunk_handle();
        let chunk_meta = ChunkMetadata::new(handle.clone(), replicas.clone());
        let primary_id = chunk_meta.primary_id.clone();
        self.chunks.insert(handle.clone(), chunk_meta);

        let file_meta = self.files.get_mut(path).unwrap();
        while file_meta.chunk_handles.len() <= chunk_index {
            file_meta.chunk_handles.push(None);
        }
        file_meta.chunk_handles[chunk_index] = Some(handle.clone());

        for loc in &replicas {
            self.chunkserver_chunks
                .entry(loc.chunkserver_id.clone())
                .or_default()
                .insert(handle.clone());
        }

        let log_data = json!({
            "path": path,
            "chunk_index": chunk_index,
            "chunk_handle": handle,
            "replicas": replicas,
        });
        Ok((handle, replicas, primary_id, true, log_data))
    }

    pub fn snapshot_file(&mut self, src: &str, dst: &str) -> GfsResult<serde_json::Value> {
        if self.files.contains_key(dst) {
            return Err(GfsError::AlreadyExists(dst.to_string()));
        }
        let src_meta = self
            .files
            .get(src)
            .ok_or_else(|| GfsError::NotFound(src.to_string()))?
            .clone();

        for handle in src_meta.chunk_handles.iter().flatten() {
            if let Some(chunk) = self.chunks.get_mut(handle) {
                chunk.reference_count += 1;
            }
        }

        let dst_meta = FileMetadata {
            path: dst.to_string(),
            created_at: now_unix(),
            chunk_handles: src_meta.chunk_handles.clone(),
        };
        self.files.insert(dst.to_string(), dst_meta);

        Ok(json!({ "source_path": src, "dest_path": dst }))
    }

    /// Copy-on-write materialization: allocates a fresh handle sharing the old
    /// chunk's replica placement, then rewires `path`'s chunk_index to it. The
    /// physical byte-copy to each replica is dispatched by the caller (service
    /// layer), outside the metadata lock.
    pub fn clone_shared_chunk(
        &mut self,
        path: &str,
        chunk_index: usize,
        old_handle: &ChunkHandle,
    ) -> GfsResult<(ChunkHandle, Vec<ChunkLocation>, serde_json::Value)> {
        let old_meta = self
            .chunks
            .get(old_handle)
            .ok_or_else(|| GfsError::NotFound(old_handle.clone()))?
            .clone();

        if !self.files.contains_key(path) {
            return Err(GfsError::NotFound(path.to_string()));
        }

        let new_handle = new_chunk_handle();
        let mut new_meta = ChunkMetadata::new(new_handle.clone(), old_meta.replicas.clone());
        new_meta.version = old_meta.version;
        new_meta.size = old_meta.size;
        new_meta.reference_count = 1;
        self.chunks.insert(new_handle.clone(), new_meta);

        for loc in &old_meta.replicas {
            self.chunkserver_chunks
                .entry(loc.chunkserver_id.clone())
                .or_default()
                .insert(new_handle.clone());
        }

        let file_meta = self.files.get_mut(path).unwrap();
        while file_meta.chunk_handles.len() <= chunk_index {
            file_meta.chunk_handles.push(None);
        }
        file_meta.chunk_handles[chunk_index] = Some(new_handle.clone());

        self.decrement_reference(old_handle, now_unix());

        let log_data = json!({
            "path": path,
            "chunk_index": chunk_index,
            "chunk_handle": new_handle,
            "old_handle": old_handle,
            "replicas": old_meta.replicas,
        });
        Ok((new_handle, old_meta.replicas, log_data))
    }

    pub fn update_chunk_size(&mut self, handle: &ChunkHandle, size: u64) -> GfsResult<serde_json::Value> {
        let chunk = self
            .chunks
            .get_mut(handle)
            .ok_or_else(|| GfsError::NotFound(handle.clone()))?;
        if size > chunk.size {
            chunk.size = size;
        }
        Ok(json!({ "chunk_handle": handle, "size": chunk.size }))
    }

    // ---- lease manager (§4.2) ------------------------------------------

    pub fn get_or_grant_lease(
        &mut self,
        handle: &ChunkHandle,
        lease_duration_secs: u64,
    ) -> GfsResult<LeaseOutcome> {
        if !self.chunks.contains_key(handle) {
            return Err(GfsError::NotFound(handle.clone()));
        }

        let now = now_unix();
        if let Some(lease) = self.leases.get(handle) {
            if lease.expiration > now && self.is_replica_effective(handle, &lease.primary_id) {
                return Ok(LeaseOutcome {
                    primary_id: Some(lease.primary_id.clone()),
                    log_records: Vec::new(),
                });
            }
        }

        let candidate = self
            .effective_replicas(handle)
            .into_iter()
            .next()
            .map(|r| r.chunkserver_id);

        let Some(primary_id) = candidate else {
            return Ok(LeaseOutcome {
                primary_id: None,
                log_records: Vec::new(),
            });
        };

        let chunk = self.chunks.get_mut(handle).unwrap();
        chunk.version += 1;
        chunk.primary_id = Some(primary_id.clone());
        let new_version = chunk.version;

        let expiration = now + lease_duration_secs;
        self.leases.insert(
            handle.clone(),
            LeaseInfo {
                chunk_handle: handle.clone(),
                primary_id: primary_id.clone(),
                expiration,
            },
        );

        Ok(LeaseOutcome {
            primary_id: Some(primary_id.clone()),
            log_records: vec![
                (
                    OperationKind::IncrementVersion,
                    json!({ "chunk_handle": handle, "version": new_version }),
                ),
                (
                    OperationKind::GrantLease,
                    json!({ "chunk_handle": handle, "primary_id": primary_id, "expiration": expiration }),
                ),
            ],
        })
    }

    // ---- chunkserver registration / heartbeat (§4.6) -------------------

    pub fn register_chunkserver(
        &mut self,
        id: &str,
        address: &str,
        rack_id: &str,
        chunks: Vec<ChunkHandle>,
    ) -> serde_json::Value {
        let entry = self
            .chunkservers
            .entry(id.to_string())
            .or_insert_with(|| ChunkServerInfo::new(id, address, rack_id));
        entry.address = address.to_string();
        entry.rack_id = rack_id.to_string();
        entry.last_heartbeat = now_unix();
        entry.is_alive = true;
        entry.reported_chunks = chunks.iter().cloned().collect();

        self.reconcile_reported_chunks(id, &chunks);

        json!({ "id": id, "address": address, "rack_id": rack_id, "chunks": chunks })
    }

    pub fn heartbeat(&mut self, id: &str, chunks: Vec<ChunkHandle>) -> GfsResult<()> {
        let cs = self
            .chunkservers
            .get_mut(id)
            .ok_or_else(|| GfsError::NotFound(id.to_string()))?;
        cs.last_heartbeat = now_unix();
        cs.is_alive = true;
        cs.reported_chunks = chunks.iter().cloned().collect();
        self.reconcile_reported_chunks(id, &chunks);
        Ok(())
    }

    /// Keeps `ChunkMetadata::replicas` and `chunkserver_chunks` consistent with
    /// what a chunkserver actually reports, dropping this server from chunks it
    /// no longer lists and adding it to chunks it newly reports.
    fn reconcile_reported_chunks(&mut self, id: &str, chunks: &[ChunkHandle]) {
        let new_set: HashSet<ChunkHandle> = chunks.iter().cloned().collect();
        let old_set = self.chunkserver_chunks.get(id).cloned().unwrap_or_default();

        for handle in old_set.difference(&new_set) {
            if let Some(chunk) = self.chunks.get_mut(handle) {
                chunk.replicas.retain(|r| r.chunkserver_id != id);
                if chunk.primary_id.as_deref() == Some(id) {
                    chunk.primary_id = None;
                    self.leases.remove(handle);
                }
            }
        }

        let address = self
            .chunkservers
            .get(id)
            .map(|cs| cs.address.clone())
            .unwrap_or_default();
        for handle in new_set.difference(&old_set) {
            if let Some(chunk) = self.chunks.get_mut(handle) {
                if !chunk.replicas.iter().any(|r| r.chunkserver_id == id) {
                    chunk.replicas.push(ChunkLocation {
                        chunkserver_id: id.to_string(),
                        address: address.clone(),
                    });
                }
            }
        }

        self.chunkserver_chunks.insert(id.to_string(), new_set);
    }

    pub fn record_replica_added(&mut self, handle: &ChunkHandle, loc: ChunkLocation) -> Option<serde_json::Value> {
        let chunk = self.chunks.get_mut(handle)?;
        if !chunk.replicas.iter().any(|r| r.chunkserver_id == loc.chunkserver_id) {
            chunk.replicas.push(loc.clone());
        }
        self.chunkserver_chunks
            .entry(loc.chunkserver_id.clone())
            .or_default()
            .insert(handle.clone());
        Some(json!({ "chunk_handle": handle, "replica": loc }))
    }

    // ---- failure detection & re-replication (§4.3) ---------------------

    pub fn detect_dead_chunkservers(&mut self, heartbeat_timeout_secs: u64) -> Vec<String> {
        let now = now_unix();
        let mut dead = Vec::new();
        for cs in self.chunkservers.values_mut() {
            if cs.is_alive && now.saturating_sub(cs.last_heartbeat) > heartbeat_timeout_secs {
                cs.is_alive = false;
                dead.push(cs.id.clone());
            }
        }
        dead
    }

    pub fn chunks_needing_replication(&self, replication_factor: usize) -> Vec<ChunkHandle> {
        self.chunks
            .keys()
            .filter(|h| self.effective_replicas(h).len() < replication_factor)
            .cloned()
            .collect()
    }

    /// Picks (source_id, source_addr, target_id, target_addr) for repairing one
    /// under-replicated chunk, or `None` if no valid pair exists right now.
    pub fn select_source_and_target(
        &self,
        handle: &ChunkHandle,
    ) -> Option<(String, String, String, String)> {
        let source = self.effective_replicas(handle).into_iter().next()?;
        let target = self
            .chunkservers
            .values()
            .filter(|cs| cs.is_alive && cs.id != source.chunkserver_id)
            .find(|cs| {
                !self
                    .chunkserver_chunks
                    .get(&cs.id)
                    .map(|set| set.contains(handle))
                    .unwrap_or(false)
            })?;
        Some((
            source.chunkserver_id.clone(),
            source.address.clone(),
            target.id.clone(),
            target.address.clone(),
        ))
    }

    // ---- garbage collection ---------------------------------------------

    pub fn mark_garbage_pass(&mut self) -> Vec<(ChunkHandle, serde_json::Value)> {
        let now = now_unix();
        let mut marked = Vec::new();
        for (handle, chunk) in self.chunks.iter_mut() {
            if chunk.reference_count == 0 && chunk.garbage_since.is_none() {
                chunk.garbage_since = Some(now);
                marked.push((handle.clone(), json!({ "chunk_handle": handle, "garbage_since": now })));
            }
        }
        marked
    }

    pub fn collect_deletable_garbage(&self, retention_window_secs: u64) -> Vec<(ChunkHandle, Vec<ChunkLocation>)> {
        let now = now_unix();
        self.chunks
            .values()
            .filter_map(|chunk| {
                let since = chunk.garbage_since?;
                if now.saturating_sub(since) > retention_window_secs {
                    Some((chunk.handle.clone(), chunk.replicas.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn physically_delete_chunk(&mut self, handle: &ChunkHandle) -> serde_json::Value {
        self.chunks.remove(handle);
        self.leases.remove(handle);
        for set in self.chunkserver_chunks.values_mut() {
            set.remove(handle);
        }
        json!({ "chunk_handle": handle })
    }

    // ---- recovery (idempotent replay of a WAL record) --------------------

    pub fn apply_record(&mut self, record: &LogRecord) {
        let data = &record.data;
        match record.operation {
            OperationKind::CreateFile => {
                if let Some(path) = data.get("path").and_then(|v| v.as_str()) {
                    self.files
                        .entry(path.to_string())
                        .or_insert_with(|| FileMetadata::new(path));
                }
            }
            OperationKind::AllocateChunk => {
                let (Some(path), Some(handle)) = (
                    data.get("path").and_then(|v| v.as_str()),
                    data.get("chunk_handle").and_then(|v| v.as_str()),
                ) else {
                    return;
                };
                let chunk_index = data.get("chunk_index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let replicas: Vec<ChunkLocation> = data
                    .get("replicas")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();

                if let Some(old_handle) = data.get("old_handle").and_then(|v| v.as_str()) {
                    self.decrement_reference(&old_handle.to_string(), record.timestamp);
                }

                self.chunks
                    .entry(handle.to_string())
                    .or_insert_with(|| ChunkMetadata::new(handle.to_string(), replicas.clone()));
                for loc in &replicas {
                    self.chunkserver_chunks
                        .entry(loc.chunkserver_id.clone())
                        .or_default()
                        .insert(handle.to_string());
                }
                let file_meta = self
                    .files
                    .entry(path.to_string())
                    .or_insert_with(|| FileMetadata::new(path));
                while file_meta.chunk_handles.len() <= chunk_index {
                    file_meta.chunk_handles.push(None);
                }
                file_meta.chunk_handles[chunk_index] = Some(handle.to_string());
            }
            OperationKind::RegisterChunkServer => {
                let (Some(id), Some(address), Some(rack_id)) = (
                    data.get("id").and_then(|v| v.as_str()),
                    data.get("address").and_then(|v| v.as_str()),
                    data.get("rack_id").and_then(|v| v.as_str()),
                ) else {
                    return;
                };
                self.chunkservers
                    .entry(id.to_string())
                    .or_insert_with(|| ChunkServerInfo::new(id, address, rack_id));
            }
            OperationKind::UpdateChunkSize => {
                let (Some(handle), Some(size)) = (
                    data.get("chunk_handle").and_then(|v| v.as_str()),
                    data.get("size").and_then(|v| v.as_u64()),
                ) else {
                    return;
                };
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    if size > chunk.size {
                        chunk.size = size;
                    }
                }
            }
            OperationKind::IncrementVersion => {
                let (Some(handle), Some(version)) = (
                    data.get("chunk_handle").and_then(|v| v.as_str()),
                    data.get("version").and_then(|v| v.as_u64()),
                ) else {
                    return;
                };
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    chunk.version = chunk.version.max(version);
                }
            }
            OperationKind::GrantLease => {
                // Leases are intentionally not recovered (§4.4): the next
                // mutation re-grants lazily. Nothing to replay here.
            }
            OperationKind::UpdateReplicas => {
                let Some(handle) = data.get("chunk_handle").and_then(|v| v.as_str()) else {
                    return;
                };
                if let Ok(loc) = serde_json::from_value::<ChunkLocation>(
                    data.get("replica").cloned().unwrap_or_default(),
                ) {
                    self.record_replica_added(&handle.to_string(), loc);
                }
            }
            OperationKind::DeleteChunk => {
                if let Some(handle) = data.get("chunk_handle").and_then(|v| v.as_str()) {
                    self.physically_delete_chunk(&handle.to_string());
                }
            }
            OperationKind::SnapshotFile => {
                let (Some(src), Some(dst)) = (
                    data.get("source_path").and_then(|v| v.as_str()),
                    data.get("dest_path").and_then(|v| v.as_str()),
                ) else {
                    return;
                };
                if self.files.contains_key(src) && !self.files.contains_key(dst) {
                    let _ = self.snapshot_file(src, dst);
                }
            }
            OperationKind::RenameFile => {
                let (Some(old), Some(new)) = (
                    data.get("old_path").and_then(|v| v.as_str()),
                    data.get("new_path").and_then(|v| v.as_str()),
                ) else {
                    return;
                };
                if self.files.contains_key(old) && !self.files.contains_key(new) {
                    let _ = self.rename_file(old, new);
                }
            }
            OperationKind::DeleteFile => {
                if let Some(path) = data.get("path").and_then(|v| v.as_str()) {
                    let _ = self.delete_file(path);
                }
            }
            OperationKind::MarkGarbage => {
                let (Some(handle), Some(since)) = (
                    data.get("chunk_handle").and_then(|v| v.as_str()),
                    data.get("garbage_since").and_then(|v| v.as_u64()),
                ) else {
                    return;
                };
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    if chunk.garbage_since.is_none() {
                        chunk.garbage_since = Some(since);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(state: &mut MasterState, id: &str, rack: &str) {
        state.register_chunkserver(id, &format!("{id}:9000"), rack, Vec::new());
    }

    #[test]
    fn allocate_chunk_is_idempotent_on_retry() {
        let mut state = MasterState::new();
        register(&mut state, "cs1", "rack-a");
        register(&mut state, "cs2", "rack-b");
        register(&mut state, "cs3", "rack-c");
        state.create_file("/a").unwrap();

        let (handle1, _, _, is_new1, _) = state.allocate_chunk("/a", 0, 3).unwrap();
        let (handle2, _, _, is_new2, _) = state.allocate_chunk("/a", 0, 3).unwrap();
        assert_eq!(handle1, handle2);
        assert!(is_new1);
        assert!(!is_new2);
    }

    #[test]
    fn placement_prefers_distinct_racks() {
        let mut state = MasterState::new();
        register(&mut state, "cs1", "rack-a");
        register(&mut state, "cs2", "rack-b");
        register(&mut state, "cs3", "rack-a");

        let replicas = state.select_replicas(2);
        let racks: HashSet<&str> = replicas
            .iter()
            .map(|r| state.chunkservers[&r.chunkserver_id].rack_id.as_str())
            .collect();
        assert_eq!(racks.len(), 2);
    }

    #[test]
    fn allocate_fails_with_no_capacity_when_no_chunkservers_alive() {
        let mut state = MasterState::new();
        state.create_file("/a").unwrap();
        let err = state.allocate_chunk("/a", 0, 3).unwrap_err();
        assert!(matches!(err, GfsError::NoCapacity(_)));
    }

    #[test]
    fn lease_grant_bumps_version_and_is_reused_until_expiry() {
        let mut state = MasterState::new();
        register(&mut state, "cs1", "rack-a");
        state.create_file("/a").unwrap();
        let (handle, _, _, _, _) = state.allocate_chunk("/a", 0, 1).unwrap();
        state.heartbeat("cs1", vec![handle.clone()]).unwrap();

        let outcome = state.get_or_grant_lease(&handle, 60).unwrap();
        assert_eq!(outcome.primary_id.as_deref(), Some("cs1"));
        assert_eq!(outcome.log_records.len(), 2);
        assert_eq!(state.chunks[&handle].version, 1);

        let outcome2 = state.get_or_grant_lease(&handle, 60).unwrap();
        assert!(outcome2.log_records.is_empty());
        assert_eq!(state.chunks[&handle].version, 1);
    }

    #[test]
    fn snapshot_file_shares_chunks_and_bumps_reference_count() {
        let mut state = MasterState::new();
        register(&mut state, "cs1", "rack-a");
        state.create_file("/a").unwrap();
        let (handle, _, _, _, _) = state.allocate_chunk("/a", 0, 1).unwrap();
        state.snapshot_file("/a", "/b").unwrap();

        assert_eq!(state.chunks[&handle].reference_count, 2);
        assert_eq!(state.files["/b"].chunk_handles[0], Some(handle));
    }

    #[test]
    fn clone_shared_chunk_allocates_new_handle_and_releases_old_reference() {
        let mut state = MasterState::new();
        register(&mut state, "cs1", "rack-a");
        state.create_file("/a").unwrap();
        let (old_handle, _, _, _, _) = state.allocate_chunk("/a", 0, 1).unwrap();
        state.snapshot_file("/a", "/b").unwrap();

        let (new_handle, _, _) = state.clone_shared_chunk("/a", 0, &old_handle).unwrap();
        assert_ne!(new_handle, old_handle);
        assert_eq!(state.chunks[&old_handle].reference_count, 1);
        assert_eq!(state.chunks[&new_handle].reference_count, 1);
        assert_eq!(state.files["/a"].chunk_handles[0], Some(new_handle));
    }

    #[test]
    fn delete_file_marks_unreferenced_chunk_as_garbage() {
        let mut state = MasterState::new();
        register(&mut state, "cs1", "rack-a");
        state.create_file("/a").unwrap();
        let (handle, _, _, _, _) = state.allocate_chunk("/a", 0, 1).unwrap();
        state.delete_file("/a").unwrap();

        assert_eq!(state.chunks[&handle].reference_count, 0);
        assert!(state.chunks[&handle].garbage_since.is_some());
    }

    #[test]
    fn heartbeat_drops_replica_when_no_longer_reported() {
        let mut state = MasterState::new();
        register(&mut state, "cs1", "rack-a");
        register(&mut state, "cs2", "rack-b");
        state.create_file("/a").unwrap();
        let (handle, _, _, _, _) = state.allocate_chunk("/a", 0, 2).unwrap();
        state.heartbeat("cs1", vec![handle.clone()]).unwrap();
        state.heartbeat("cs2", vec![handle.clone()]).unwrap();
        assert_eq!(state.effective_replicas(&handle).len(), 2);

        state.heartbeat("cs2", vec![]).unwrap();
        assert_eq!(state.effective_replicas(&handle).len(), 1);
    }

    #[test]
    fn detect_dead_chunkservers_flips_liveness_after_timeout() {
        let mut state = MasterState::new();
        register(&mut state, "cs1", "rack-a");
        state.chunkservers.get_mut("cs1").unwrap().last_heartbeat = 0;
        let dead = state.detect_dead_chunkservers(30);
        assert_eq!(dead, vec!["cs1".to_string()]);
        assert!(!state.chunkservers["cs1"].is_alive);
    }
}
