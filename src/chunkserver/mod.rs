//! The ChunkServer: chunk storage plus registration/heartbeat with the Master
//! (§4.5, §4.6).

pub mod service;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{ChunkServerConfig, CommonConfig};
use crate::error::GfsResult;
use crate::proto::master::master_client::MasterClient;
use crate::proto::master::{HeartbeatRequest, RegisterChunkServerRequest};
use storage::ChunkStorage;

pub struct ChunkServerRuntime {
    pub id: String,
    pub storage: Arc<ChunkStorage>,
    pub config: ChunkServerConfig,
    pub common: CommonConfig,
}

impl ChunkServerRuntime {
    pub fn new(mut config: ChunkServerConfig, common: CommonConfig) -> GfsResult<Arc<Self>> {
        if config.chunkserver_id.is_empty() {
            config.chunkserver_id = uuid::Uuid::new_v4().to_string();
        }
        let storage = Arc::new(ChunkStorage::new(&config.data_dir)?);
        let id = config.chunkserver_id.clone();
        Ok(Arc::new(Self {
            id,
            storage,
            config,
            common,
        }))
    }

    fn self_address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Registers once with the master, then heartbeats on
    /// `config.heartbeat_interval` forever, reporting the chunks actually
    /// present on local disk (the master reconciles its view from this, not
    /// the other way around). Returns the task handle so a caller can abort
    /// it to simulate this chunkserver going silent.
    pub fn spawn_registration_and_heartbeat(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let address = self.self_address();
            loop {
                match MasterClient::connect(format!("http://{}", self.config.master_address)).await {
                    Ok(mut client) => {
                        let chunks: Vec<String> = self
                            .storage
                            .list_local_chunks()
                            .unwrap_or_default()
                            .into_iter()
                            .collect();
                        let result = client
                            .register_chunk_server(RegisterChunkServerRequest {
                                id: self.id.clone(),
                                address: address.clone(),
                                rack_id: self.config.rack_id.clone(),
                                chunks,
                            })
                            .await;
                        match result {
                            Ok(_) => {
                                info!(chunkserver = %self.id, "registered with master");
                                break;
                            }
                            Err(e) => warn!(error = %e, "registration RPC failed, retrying"),
                        }
                    }
                    Err(e) => warn!(error = %e, "could not connect to master, retrying"),
                }
                tokio::time::sleep(Duration::from_secs(self.config.heartbeat_interval)).await;
            }

            let mut interval = tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval));
            loop {
                interval.tick().await;
                let Ok(mut client) = MasterClient::connect(format!("http://{}", self.config.master_address)).await
                else {
                    warn!("could not connect to master for heartbeat");
                    continue;
                };
                let chunks: Vec<String> = self
                    .storage
                    .list_local_chunks()
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                if let Err(e) = client
                    .heartbeat(HeartbeatRequest {
                        id: self.id.clone(),
                        chunks,
                    })
                    .await
                {
                    warn!(error = %e, "heartbeat RPC failed");
                }
            }
        })
    }
}
