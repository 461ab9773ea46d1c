//! Cooperative background tasks: failure detection + re-replication, garbage
//! collection, and periodic checkpointing (§4.3, §4.4, §9).
//!
//! The reference implementation runs these as polling threads over shared
//! state; here each is a `tokio::spawn`ed loop ticking on its own interval,
//! coordinating only through the Master's single mutex. No channels are
//! needed between them since none of the three depend on another's output
//! within a tick.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::master::Master;
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::{CloneChunkRequest, DeleteChunkRequest};

/// Spawns the three background loops, returning their task handles so a
/// caller can abort them (e.g. in tests that simulate killing the Master).
pub fn spawn_all(master: Arc<Master>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        spawn_failure_and_repair(master.clone()),
        spawn_garbage_collector(master.clone()),
        spawn_checkpointer(master),
    ]
}

fn spawn_failure_and_repair(master: Arc<Master>) -> tokio::task::JoinHandle<()> {
    let tick = Duration::from_secs(master.config.bg_tick_secs);
    let max_repairs = master.config.max_repairs_per_tick;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;

            let dead = master.detect_dead_chunkservers().await;
            for id in &dead {
                warn!(chunkserver = %id, "chunkserver missed heartbeat deadline, marked dead");
            }

            let needing = master.chunks_needing_replication().await;
            for handle in needing.into_iter().take(max_repairs) {
                let Some((_src_id, src_addr, target_id, target_addr)) =
                    master.select_source_and_target(&handle).await
                else {
                    continue;
                };
                match repair_one(&src_addr, &target_addr, &handle).await {
                    Ok(()) => {
                        let loc = crate::types::ChunkLocation {
                            chunkserver_id: target_id,
                            address: target_addr,
                        };
                        if let Err(e) = master.record_replica_added(&handle, loc).await {
                            warn!(%handle, error = %e, "failed to record repaired replica");
                        } else {
                            info!(%handle, "repaired under-replicated chunk");
                        }
                    }
                    Err(e) => warn!(%handle, error = %e, "replica repair attempt failed"),
                }
            }
        }
    })
}

async fn repair_one(src_addr: &str, target_addr: &str, handle: &str) -> Result<(), tonic::Status> {
    let mut client = ChunkClient::connect(format!("http://{target_addr}"))
        .await
        .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
    let request = CloneChunkRequest {
        chunk_handle: handle.to_string(),
        src_address: src_addr.to_string(),
        src_chunk_handle: String::new(),
    };
    let response = client.clone_chunk(request).await?.into_inner();
    if !response.success {
        return Err(tonic::Status::internal(response.message));
    }
    Ok(())
}

fn spawn_garbage_collector(master: Arc<Master>) -> tokio::task::JoinHandle<()> {
    let tick = Duration::from_secs(master.config.gc_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;

            match master.mark_garbage_pass().await {
                Ok(marked) if marked > 0 => info!(marked, "marked chunks as garbage"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "garbage mark pass failed"),
            }

            let deletable = master.collect_deletable_garbage().await;
            for (handle, replicas) in deletable {
                for loc in &replicas {
                    if let Err(e) = delete_on_chunkserver(&loc.address, &handle).await {
                        warn!(%handle, chunkserver = %loc.chunkserver_id, error = %e, "failed to delete replica");
                    }
                }
                if let Err(e) = master.physically_delete_chunk(&handle).await {
                    warn!(%handle, error = %e, "failed to remove garbage chunk from metadata");
                } else {
                    info!(%handle, "garbage-collected chunk past retention window");
                }
            }
        }
    })
}

async fn delete_on_chunkserver(address: &str, handle: &str) -> Result<(), tonic::Status> {
    let mut client = ChunkClient::connect(format!("http://{address}"))
        .await
        .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
    let response = client
        .delete_chunk(DeleteChunkRequest {
            chunk_handle: handle.to_string(),
        })
        .await?
        .into_inner();
    if !response.success {
        return Err(tonic::Status::internal(response.message));
    }
    Ok(())
}

fn spawn_checkpointer(master: Arc<Master>) -> tokio::task::JoinHandle<()> {
    let tick = Duration::from_secs(master.config.checkpoint_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            if let Err(e) = master.checkpoint().await {
                warn!(error = %e, "periodic checkpoint failed");
            }
        }
    })
}
