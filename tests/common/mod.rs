use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use mini_gfs::chunkserver::service::ChunkService;
use mini_gfs::chunkserver::ChunkServerRuntime;
use mini_gfs::client::Client;
use mini_gfs::config::{ChunkServerConfig, ClientConfig, CommonConfig, MasterConfig};
use mini_gfs::master::service::MasterService;
use mini_gfs::master::{background, Master};
use mini_gfs::proto::chunk::chunk_server::ChunkServer;
use mini_gfs::proto::master::master_server::MasterServer;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

pub fn small_common_config() -> CommonConfig {
    CommonConfig {
        chunk_size: 1024,
        replication_factor: 2,
        heartbeat_timeout: 2,
        lease_duration: 60,
        log_level: "error".to_string(),
        log_output: "stdout".to_string(),
    }
}

async fn bind_any() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// A Master plus the tasks it's running, stoppable to simulate a crash.
pub struct TestMaster {
    pub master: Arc<Master>,
    server_task: JoinHandle<()>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl TestMaster {
    /// Aborts the gRPC server and all background loops, simulating the
    /// Master process being killed. The metadata directory on disk is left
    /// intact so a fresh `Master::open` against it can recover.
    pub fn stop(&self) {
        self.server_task.abort();
        for task in &self.background_tasks {
            task.abort();
        }
    }
}

async fn spawn_master_at(metadata_dir: &Path, common: CommonConfig) -> (TestMaster, String) {
    let config = MasterConfig {
        metadata_dir: metadata_dir.to_str().unwrap().to_string(),
        bg_tick_secs: 1,
        ..MasterConfig::default()
    };

    let master = Master::open(config, common).await.unwrap();
    let background_tasks = background::spawn_all(master.clone());

    let (listener, addr) = bind_any().await;
    let service = MasterService::new(master.clone());
    let server_task = tokio::spawn(async move {
        Server::builder()
            .add_service(MasterServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    (
        TestMaster {
            master,
            server_task,
            background_tasks,
        },
        addr.to_string(),
    )
}

pub async fn spawn_master(common: CommonConfig) -> (Arc<Master>, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    std::mem::forget(dir); // keep the tempdir alive for the life of the test process

    let (test_master, addr) = spawn_master_at(&path, common).await;
    (test_master.master, addr)
}

/// Like `spawn_master`, but at a caller-chosen metadata directory and
/// returning a `TestMaster` that can be `stop()`ped — used by tests that
/// restart the Master against the same directory.
pub async fn spawn_stoppable_master(metadata_dir: &Path, common: CommonConfig) -> (TestMaster, String) {
    spawn_master_at(metadata_dir, common).await
}

/// A ChunkServer plus the tasks it's running, stoppable to simulate it going
/// silent (crashed, partitioned) without tearing down its on-disk state.
pub struct TestChunkServer {
    pub runtime: Arc<ChunkServerRuntime>,
    server_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl TestChunkServer {
    pub fn stop(&self) {
        self.server_task.abort();
        self.heartbeat_task.abort();
    }
}

pub async fn spawn_chunkserver(
    master_address: &str,
    common: CommonConfig,
    rack_id: &str,
) -> TestChunkServer {
    let dir = tempfile::tempdir().unwrap();
    let (listener, addr) = bind_any().await;
    let config = ChunkServerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        master_address: master_address.to_string(),
        data_dir: dir.path().to_str().unwrap().to_string(),
        heartbeat_interval: 1,
        rack_id: rack_id.to_string(),
        ..ChunkServerConfig::default()
    };
    std::mem::forget(dir);

    let runtime = ChunkServerRuntime::new(config.clone(), common.clone()).unwrap();
    let heartbeat_task = runtime.clone().spawn_registration_and_heartbeat();

    let service = ChunkService::new(runtime.storage.clone(), config, common);
    let server_task = tokio::spawn(async move {
        Server::builder()
            .add_service(ChunkServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    // Give the chunkserver a moment to register before the caller uses it.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    TestChunkServer {
        runtime,
        server_task,
        heartbeat_task,
    }
}

pub fn client_for(master_address: &str, common: CommonConfig) -> Client {
    Client::new(
        ClientConfig {
            master_address: master_address.to_string(),
            log_level: "error".to_string(),
        },
        common,
    )
}
