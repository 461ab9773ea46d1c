//! Client coordination library (§4.7): splits writes/reads across chunk
//! boundaries, drives the primary-first write pipeline, and triggers
//! copy-on-write materialization before mutating a shared chunk.

use tracing::debug;

use crate::config::{ClientConfig, CommonConfig};
use crate::error::{GfsError, GfsResult};
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::{AppendRecordRequest, ReadChunkRequest, WriteChunkRequest};
use crate::proto::master::master_client::MasterClient;
use crate::proto::master::{
    AllocateChunkRequest, CloneSharedChunkRequest, CreateFileRequest, DeleteFileRequest,
    GetChunkLocationsRequest, GetFileInfoRequest, ListDirectoryRequest, RenameFileRequest,
    SnapshotFileRequest,
};

pub struct Client {
    master_address: String,
    common: CommonConfig,
}

impl Client {
    pub fn new(config: ClientConfig, common: CommonConfig) -> Self {
        Self {
            master_address: config.master_address,
            common,
        }
    }

    async fn connect_master(&self) -> GfsResult<MasterClient<tonic::transport::Channel>> {
        MasterClient::connect(format!("http://{}", self.master_address))
            .await
            .map_err(|e| GfsError::Transient(e.to_string()))
    }

    async fn connect_chunk(&self, address: &str) -> GfsResult<ChunkClient<tonic::transport::Channel>> {
        ChunkClient::connect(format!("http://{address}"))
            .await
            .map_err(|e| GfsError::Transient(e.to_string()))
    }

    pub async fn create_file(&self, path: &str) -> GfsResult<()> {
        let mut master = self.connect_master().await?;
        let resp = master
            .create_file(CreateFileRequest { path: path.to_string() })
            .await
            .map_err(status_to_error)?
            .into_inner();
        ok_or_err(resp.success, resp.message)
    }

    pub async fn delete_file(&self, path: &str) -> GfsResult<()> {
        let mut master = self.connect_master().await?;
        let resp = master
            .delete_file(DeleteFileRequest { path: path.to_string() })
            .await
            .map_err(status_to_error)?
            .into_inner();
        ok_or_err(resp.success, resp.message)
    }

    pub async fn rename_file(&self, old_path: &str, new_path: &str) -> GfsResult<()> {
        let mut master = self.connect_master().await?;
        let resp = master
            .rename_file(RenameFileRequest {
                old_path: old_path.to_string(),
                new_path: new_path.to_string(),
            })
            .await
            .map_err(status_to_error)?
            .into_inner();
        ok_or_err(resp.success, resp.message)
    }

    pub async fn snapshot(&self, source_path: &str, dest_path: &str) -> GfsResult<()> {
        let mut master = self.connect_master().await?;
        let resp = master
            .snapshot_file(SnapshotFileRequest {
                source_path: source_path.to_string(),
                dest_path: dest_path.to_string(),
            })
            .await
            .map_err(status_to_error)?
            .into_inner();
        ok_or_err(resp.success, resp.message)
    }

    pub async fn list_directory(&self, prefix: &str) -> GfsResult<Vec<String>> {
        let mut master = self.connect_master().await?;
        let resp = master
            .list_directory(ListDirectoryRequest { prefix: prefix.to_string() })
            .await
            .map_err(status_to_error)?
            .into_inner();
        Ok(resp.paths)
    }

    /// Writes `data` at `offset`, splitting across chunk boundaries and
    /// materializing a private copy of any chunk still shared by a snapshot
    /// before mutating it.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> GfsResult<()> {
        let chunk_size = self.common.chunk_size;
        let mut written: usize = 0;

        while written < data.len() {
            let abs_offset = offset + written as u64;
            let chunk_index = (abs_offset / chunk_size) as usize;
            let intra_offset = abs_offset % chunk_size;
            let space_in_chunk = (chunk_size - intra_offset) as usize;
            let take = space_in_chunk.min(data.len() - written);
            let slice = data[written..written + take].to_vec();

            let mut master = self.connect_master().await?;
            let alloc = master
                .allocate_chunk(AllocateChunkRequest {
                    path: path.to_string(),
                    chunk_index: chunk_index as u64,
                })
                .await
                .map_err(status_to_error)?
                .into_inner();

            let mut handle = alloc.chunk_handle;
            let mut locations = master
                .get_chunk_locations(GetChunkLocationsRequest {
                    chunk_handle: handle.clone(),
                })
                .await
                .map_err(status_to_error)?
                .into_inner();

            if locations.reference_count > 1 {
                debug!(%handle, "chunk is shared, materializing private copy before write");
                let cloned = master
                    .clone_shared_chunk(CloneSharedChunkRequest {
                        path: path.to_string(),
                        chunk_index: chunk_index as u64,
                        old_chunk_handle: handle.clone(),
                    })
                    .await
                    .map_err(status_to_error)?
                    .into_inner();
                handle = cloned.chunk_handle;
                locations = master
                    .get_chunk_locations(GetChunkLocationsRequest {
                        chunk_handle: handle.clone(),
                    })
                    .await
                    .map_err(status_to_error)?
                    .into_inner();
            }

            if locations.primary_id.is_empty() {
                return Err(GfsError::NoCapacity(format!("no primary available for chunk {handle}")));
            }
            let primary_addr = locations
                .replicas
                .iter()
                .find(|r| r.chunkserver_id == locations.primary_id)
                .map(|r| r.address.clone())
                .ok_or_else(|| GfsError::NoCapacity(format!("primary {} not in replica list", locations.primary_id)))?;
            let secondary_addrs: Vec<String> = locations
                .replicas
                .iter()
                .filter(|r| r.chunkserver_id != locations.primary_id)
                .map(|r| r.address.clone())
                .collect();

            let mut primary = self.connect_chunk(&primary_addr).await?;
            let resp = primary
                .write_chunk_pipeline(WriteChunkRequest {
                    chunk_handle: handle.clone(),
                    offset: intra_offset,
                    data: slice,
                    src_address: String::new(),
                    secondary_addresses: secondary_addrs,
                })
                .await
                .map_err(status_to_error)?
                .into_inner();
            if !resp.success {
                return Err(GfsError::Transient(resp.message));
            }

            master
                .update_chunk_size(crate::proto::master::UpdateChunkSizeRequest {
                    chunk_handle: handle,
                    size: resp.chunk_size,
                })
                .await
                .map_err(status_to_error)?;

            written += take;
        }
        Ok(())
    }

    /// Reads `length` bytes starting at `offset`. Holes (unallocated chunk
    /// indices within the requested range) read back as zero bytes.
    pub async fn read(&self, path: &str, offset: u64, length: u64) -> GfsResult<Vec<u8>> {
        let mut master = self.connect_master().await?;
        let info = master
            .get_file_info(GetFileInfoRequest { path: path.to_string() })
            .await
            .map_err(status_to_error)?
            .into_inner();

        let chunk_size = self.common.chunk_size;
        let mut result = Vec::with_capacity(length as usize);
        let mut remaining = length;
        let mut abs_offset = offset;

        while remaining > 0 {
            let chunk_index = (abs_offset / chunk_size) as usize;
            let intra_offset = abs_offset % chunk_size;
            let take = remaining.min(chunk_size - intra_offset);

            let handle = info.chunk_handles.get(chunk_index).filter(|h| !h.is_empty());
            let Some(handle) = handle else {
                result.extend(std::iter::repeat(0u8).take(take as usize));
                abs_offset += take;
                remaining -= take;
                continue;
            };

            let chunk_info = info
                .chunks_info
                .iter()
                .find(|c| &c.chunk_handle == handle)
                .ok_or_else(|| GfsError::NotFound(handle.clone()))?;
            let replica = chunk_info
                .replicas
                .first()
                .ok_or_else(|| GfsError::NoCapacity(format!("no live replica for chunk {handle}")))?;

            let mut chunk_client = self.connect_chunk(&replica.address).await?;
            let resp = chunk_client
                .read_chunk(ReadChunkRequest {
                    chunk_handle: handle.clone(),
                    offset: intra_offset,
                    length: take,
                    verify: true,
                })
                .await
                .map_err(status_to_error)?
                .into_inner();
            result.extend_from_slice(&resp.data);

            abs_offset += take;
            remaining -= take;
        }

        Ok(result)
    }

    /// Appends `data` as one record at the end of the file, rolling over to a
    /// fresh chunk automatically when the current last chunk is full. Returns
    /// the `(chunk_index, intra-chunk offset)` the record landed at.
    pub async fn append_record(&self, path: &str, data: &[u8]) -> GfsResult<(usize, u64)> {
        let chunk_size = self.common.chunk_size;
        loop {
            let mut master = self.connect_master().await?;
            let info = master
                .get_file_info(GetFileInfoRequest { path: path.to_string() })
                .await
                .map_err(status_to_error)?
                .into_inner();
            let chunk_index = info.chunk_handles.len().saturating_sub(1);

            let alloc = master
                .allocate_chunk(AllocateChunkRequest {
                    path: path.to_string(),
                    chunk_index: chunk_index as u64,
                })
                .await
                .map_err(status_to_error)?
                .into_inner();

            let mut handle = alloc.chunk_handle;
            let mut locations = master
                .get_chunk_locations(GetChunkLocationsRequest {
                    chunk_handle: handle.clone(),
                })
                .await
                .map_err(status_to_error)?
                .into_inner();

            if locations.reference_count > 1 {
                let cloned = master
                    .clone_shared_chunk(CloneSharedChunkRequest {
                        path: path.to_string(),
                        chunk_index: chunk_index as u64,
                        old_chunk_handle: handle.clone(),
                    })
                    .await
                    .map_err(status_to_error)?
                    .into_inner();
                handle = cloned.chunk_handle;
                locations = master
                    .get_chunk_locations(GetChunkLocationsRequest {
                        chunk_handle: handle.clone(),
                    })
                    .await
                    .map_err(status_to_error)?
                    .into_inner();
            }

            if locations.primary_id.is_empty() {
                return Err(GfsError::NoCapacity(format!("no primary available for chunk {handle}")));
            }
            let primary_addr = locations
                .replicas
                .iter()
                .find(|r| r.chunkserver_id == locations.primary_id)
                .map(|r| r.address.clone())
                .ok_or_else(|| GfsError::NoCapacity(format!("primary {} not in replica list", locations.primary_id)))?;
            let secondary_addrs: Vec<String> = locations
                .replicas
                .iter()
                .filter(|r| r.chunkserver_id != locations.primary_id)
                .map(|r| r.address.clone())
                .collect();

            let mut primary = self.connect_chunk(&primary_addr).await?;
            let resp = primary
                .append_record(AppendRecordRequest {
                    chunk_handle: handle.clone(),
                    data: data.to_vec(),
                    chunk_size,
                })
                .await
                .map_err(status_to_error)?
                .into_inner();

            if resp.offset < 0 || resp.bytes_written < data.len() as u64 {
                // The chunk was full, or only fit a leading prefix of the
                // record: allocate the next chunk and retry the whole record
                // there (GFS-style record append: at-least-once, duplicates
                // are the application's problem).
                master
                    .allocate_chunk(AllocateChunkRequest {
                        path: path.to_string(),
                        chunk_index: (chunk_index + 1) as u64,
                    })
                    .await
                    .map_err(status_to_error)?;
                continue;
            }

            for addr in &secondary_addrs {
                let mut secondary = self.connect_chunk(addr).await?;
                secondary
                    .append_record(AppendRecordRequest {
                        chunk_handle: handle.clone(),
                        data: data.to_vec(),
                        chunk_size,
                    })
                    .await
                    .map_err(status_to_error)?;
            }

            master
                .update_chunk_size(crate::proto::master::UpdateChunkSizeRequest {
                    chunk_handle: handle,
                    size: resp.offset as u64 + resp.bytes_written,
                })
                .await
                .map_err(status_to_error)?;

            return Ok((chunk_index, resp.offset as u64));
        }
    }
}

fn ok_or_err(success: bool, message: String) -> GfsResult<()> {
    if success {
        Ok(())
    } else {
        Err(GfsError::Transient(message))
    }
}

fn status_to_error(status: tonic::Status) -> GfsError {
    GfsError::Transient(status.message().to_string())
}
