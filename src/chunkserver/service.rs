//! gRPC surface for the ChunkServer (§6, §4.5).

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::chunkserver::storage::ChunkStorage;
use crate::config::{ChunkServerConfig, CommonConfig};
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::chunk_server::Chunk as ChunkRpc;
use crate::proto::chunk::*;

pub struct ChunkService {
    storage: Arc<ChunkStorage>,
    config: ChunkServerConfig,
    common: CommonConfig,
}

impl ChunkService {
    pub fn new(storage: Arc<ChunkStorage>, config: ChunkServerConfig, common: CommonConfig) -> Self {
        Self {
            storage,
            config,
            common,
        }
    }

    fn self_address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

#[tonic::async_trait]
impl ChunkRpc for ChunkService {
    #[instrument(skip(self, request))]
    async fn write_chunk(
        &self,
        request: Request<WriteChunkRequest>,
    ) -> Result<Response<WriteChunkResponse>, Status> {
        let req = request.into_inner();
        let (bytes_written, chunk_size) = self
            .storage
            .write_chunk(&req.chunk_handle, req.offset, &req.data)?;
        Ok(Response::new(WriteChunkResponse {
            success: true,
            message: String::new(),
            bytes_written,
            chunk_size,
        }))
    }

    /// Entry point for a client's primary-first write. Applies the write
    /// locally, then forwards the identical write to every secondary before
    /// acknowledging — matching the ordering §5 requires (the primary is the
    /// one place that decides an append's offset, so its local write happens
    /// first).
    async fn write_chunk_pipeline(
        &self,
        request: Request<WriteChunkRequest>,
    ) -> Result<Response<WriteChunkResponse>, Status> {
        let req = request.into_inner();
        let (bytes_written, chunk_size) = self
            .storage
            .write_chunk(&req.chunk_handle, req.offset, &req.data)?;

        for secondary in &req.secondary_addresses {
            let mut client = ChunkClient::connect(format!("http://{secondary}"))
                .await
                .map_err(|e| Status::unavailable(e.to_string()))?;
            let resp = client
                .write_chunk(WriteChunkRequest {
                    chunk_handle: req.chunk_handle.clone(),
                    offset: req.offset,
                    data: req.data.clone(),
                    src_address: self.self_address(),
                    secondary_addresses: Vec::new(),
                })
                .await?
                .into_inner();
            if !resp.success {
                return Err(Status::internal(resp.message));
            }
        }

        Ok(Response::new(WriteChunkResponse {
            success: true,
            message: String::new(),
            bytes_written,
            chunk_size,
        }))
    }

    async fn read_chunk(
        &self,
        request: Request<ReadChunkRequest>,
    ) -> Result<Response<ReadChunkResponse>, Status> {
        let req = request.into_inner();
        let data = self
            .storage
            .read_chunk(&req.chunk_handle, req.offset, req.length, req.verify)?;
        let bytes_read = data.len() as u64;
        Ok(Response::new(ReadChunkResponse {
            success: true,
            message: String::new(),
            data,
            bytes_read,
        }))
    }

    async fn append_record(
        &self,
        request: Request<AppendRecordRequest>,
    ) -> Result<Response<AppendRecordResponse>, Status> {
        let req = request.into_inner();
        let (offset, bytes_written) =
            self.storage
                .append_record(&req.chunk_handle, &req.data, req.chunk_size)?;
        Ok(Response::new(AppendRecordResponse {
            success: offset >= 0,
            message: if offset >= 0 {
                String::new()
            } else {
                "chunk full".to_string()
            },
            offset,
            bytes_written,
        }))
    }

    async fn clone_chunk(
        &self,
        request: Request<CloneChunkRequest>,
    ) -> Result<Response<CloneChunkResponse>, Status> {
        let req = request.into_inner();
        let src_handle = if req.src_chunk_handle.is_empty() {
            req.chunk_handle.clone()
        } else {
            req.src_chunk_handle.clone()
        };

        let mut client = ChunkClient::connect(format!("http://{}", req.src_address))
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        let size = client
            .read_chunk(ReadChunkRequest {
                chunk_handle: src_handle,
                offset: 0,
                length: self.common.chunk_size,
                verify: true,
            })
            .await?
            .into_inner();

        self.storage.write_whole(&req.chunk_handle, &size.data)?;

        Ok(Response::new(CloneChunkResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn delete_chunk(
        &self,
        request: Request<DeleteChunkRequest>,
    ) -> Result<Response<DeleteChunkResponse>, Status> {
        let req = request.into_inner();
        self.storage.delete_chunk(&req.chunk_handle)?;
        Ok(Response::new(DeleteChunkResponse {
            success: true,
            message: String::new(),
        }))
    }
}
