//! In-memory data model held by the Master (§3 of the design).
//!
//! Every cross-reference between a chunk and a chunkserver is stored as an id on
//! both sides (`ChunkMetadata::replicas` / `MasterState::chunkserver_chunks`)
//! rather than a shared pointer, so the two inverted maps can never disagree about
//! ownership and there is nothing to make `Send`/`Sync` awkward.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub type ChunkHandle = String;

pub fn new_chunk_handle() -> ChunkHandle {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// A chunkserver's location as recorded on a `ChunkMetadata`. Informational only —
/// the Master's `chunkservers` / `chunkserver_chunks` indexes are authoritative for
/// whether the replica is actually live.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkLocation {
    pub chunkserver_id: String,
    pub address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub created_at: u64,
    /// chunk_handles[i] is the i-th chunk of the file. `None` marks an
    /// unallocated hole; the vector's length equals max allocated index + 1.
    pub chunk_handles: Vec<Option<ChunkHandle>>,
}

impl FileMetadata {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            created_at: now_unix(),
            chunk_handles: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub handle: ChunkHandle,
    pub version: u64,
    pub replicas: Vec<ChunkLocation>,
    pub primary_id: Option<String>,
    pub size: u64,
    pub reference_count: u64,
    pub garbage_since: Option<u64>,
}

impl ChunkMetadata {
    pub fn new(handle: ChunkHandle, replicas: Vec<ChunkLocation>) -> Self {
        let primary_id = replicas.first().map(|r| r.chunkserver_id.clone());
        Self {
            handle,
            version: 0,
            replicas,
            primary_id,
            size: 0,
            reference_count: 1,
            garbage_since: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub chunk_handle: ChunkHandle,
    pub primary_id: String,
    /// Unix timestamp (seconds) at which the lease expires.
    pub expiration: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkServerInfo {
    pub id: String,
    pub address: String,
    pub rack_id: String,
    pub last_heartbeat: u64,
    pub reported_chunks: std::collections::HashSet<ChunkHandle>,
    pub is_alive: bool,
}

impl ChunkServerInfo {
    pub fn new(id: impl Into<String>, address: impl Into<String>, rack_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            rack_id: rack_id.into(),
            last_heartbeat: now_unix(),
            reported_chunks: std::collections::HashSet::new(),
            is_alive: true,
        }
    }
}
