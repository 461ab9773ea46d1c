//! gRPC surface for the Master (§6). Thin translation layer: every handler
//! locks nothing itself, delegates to `Master`, and converts `GfsError` into
//! `tonic::Status` via the shared `From` impl.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::master::Master;
use crate::proto::master::master_server::Master as MasterRpc;
use crate::proto::master::*;

pub struct MasterService {
    master: Arc<Master>,
}

impl MasterService {
    pub fn new(master: Arc<Master>) -> Self {
        Self { master }
    }
}

#[tonic::async_trait]
impl MasterRpc for MasterService {
    #[instrument(skip(self, request))]
    async fn register_chunk_server(
        &self,
        request: Request<RegisterChunkServerRequest>,
    ) -> Result<Response<RegisterChunkServerResponse>, Status> {
        let req = request.into_inner();
        self.master
            .register_chunkserver(&req.id, &req.address, &req.rack_id, req.chunks)
            .await?;
        Ok(Response::new(RegisterChunkServerResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        self.master.heartbeat(&req.id, req.chunks).await?;
        Ok(Response::new(HeartbeatResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn create_file(
        &self,
        request: Request<CreateFileRequest>,
    ) -> Result<Response<CreateFileResponse>, Status> {
        let req = request.into_inner();
        self.master.create_file(&req.path).await?;
        Ok(Response::new(CreateFileResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn get_file_info(
        &self,
        request: Request<GetFileInfoRequest>,
    ) -> Result<Response<GetFileInfoResponse>, Status> {
        let req = request.into_inner();
        let view = self.master.get_file_info(&req.path).await?;
        Ok(Response::new(GetFileInfoResponse {
            success: true,
            message: String::new(),
            path: view.path,
            chunk_handles: view
                .chunk_handles
                .into_iter()
                .map(|h| h.unwrap_or_default())
                .collect(),
            chunks_info: view.chunks_info.into_iter().map(chunk_view_to_proto).collect(),
        }))
    }

    async fn allocate_chunk(
        &self,
        request: Request<AllocateChunkRequest>,
    ) -> Result<Response<AllocateChunkResponse>, Status> {
        let req = request.into_inner();
        let (handle, replicas, primary_id) = self
            .master
            .allocate_chunk(&req.path, req.chunk_index as usize)
            .await?;
        Ok(Response::new(AllocateChunkResponse {
            success: true,
            message: String::new(),
            chunk_handle: handle,
            replicas: replicas.into_iter().map(location_to_proto).collect(),
            primary_id: primary_id.unwrap_or_default(),
        }))
    }

    async fn get_chunk_locations(
        &self,
        request: Request<GetChunkLocationsRequest>,
    ) -> Result<Response<GetChunkLocationsResponse>, Status> {
        let req = request.into_inner();
        let (replicas, primary_id, size, reference_count) =
            self.master.get_chunk_locations(&req.chunk_handle).await?;
        Ok(Response::new(GetChunkLocationsResponse {
            success: true,
            message: String::new(),
            replicas: replicas.into_iter().map(location_to_proto).collect(),
            primary_id: primary_id.unwrap_or_default(),
            size,
            reference_count,
        }))
    }

    async fn update_chunk_size(
        &self,
        request: Request<UpdateChunkSizeRequest>,
    ) -> Result<Response<UpdateChunkSizeResponse>, Status> {
        let req = request.into_inner();
        self.master
            .update_chunk_size(&req.chunk_handle, req.size)
            .await?;
        Ok(Response::new(UpdateChunkSizeResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn clone_shared_chunk(
        &self,
        request: Request<CloneSharedChunkRequest>,
    ) -> Result<Response<CloneSharedChunkResponse>, Status> {
        let req = request.into_inner();
        let (new_handle, src_replicas) = self
            .master
            .clone_shared_chunk(&req.path, req.chunk_index as usize, &req.old_chunk_handle)
            .await?;

        for loc in &src_replicas {
            let mut client =
                crate::proto::chunk::chunk_client::ChunkClient::connect(format!("http://{}", loc.address))
                    .await
                    .map_err(|e| Status::unavailable(e.to_string()))?;
            let resp = client
                .clone_chunk(crate::proto::chunk::CloneChunkRequest {
                    chunk_handle: new_handle.clone(),
                    src_address: loc.address.clone(),
                    src_chunk_handle: req.old_chunk_handle.clone(),
                })
                .await?
                .into_inner();
            if !resp.success {
                return Err(Status::internal(resp.message));
            }
        }

        Ok(Response::new(CloneSharedChunkResponse {
            success: true,
            message: String::new(),
            chunk_handle: new_handle,
        }))
    }

    async fn snapshot_file(
        &self,
        request: Request<SnapshotFileRequest>,
    ) -> Result<Response<SnapshotFileResponse>, Status> {
        let req = request.into_inner();
        self.master
            .snapshot_file(&req.source_path, &req.dest_path)
            .await?;
        Ok(Response::new(SnapshotFileResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn rename_file(
        &self,
        request: Request<RenameFileRequest>,
    ) -> Result<Response<RenameFileResponse>, Status> {
        let req = request.into_inner();
        self.master.rename_file(&req.old_path, &req.new_path).await?;
        Ok(Response::new(RenameFileResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn delete_file(
        &self,
        request: Request<DeleteFileRequest>,
    ) -> Result<Response<DeleteFileResponse>, Status> {
        let req = request.into_inner();
        self.master.delete_file(&req.path).await?;
        Ok(Response::new(DeleteFileResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn list_directory(
        &self,
        request: Request<ListDirectoryRequest>,
    ) -> Result<Response<ListDirectoryResponse>, Status> {
        let req = request.into_inner();
        let paths = self.master.list_directory(&req.prefix).await;
        Ok(Response::new(ListDirectoryResponse {
            success: true,
            message: String::new(),
            paths,
        }))
    }
}

fn location_to_proto(loc: crate::types::ChunkLocation) -> ChunkLocation {
    ChunkLocation {
        chunkserver_id: loc.chunkserver_id,
        address: loc.address,
    }
}

fn chunk_view_to_proto(view: crate::master::state::ChunkView) -> ChunkInfo {
    ChunkInfo {
        chunk_handle: view.handle,
        replicas: view.replicas.into_iter().map(location_to_proto).collect(),
        primary_id: view.primary_id.unwrap_or_default(),
        size: view.size,
        version: view.version,
        reference_count: view.reference_count,
    }
}
