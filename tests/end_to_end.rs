mod common;

use std::time::Duration;

use common::{client_for, small_common_config, spawn_chunkserver, spawn_master, spawn_stoppable_master};
use mini_gfs::proto::master::master_client::MasterClient;
use mini_gfs::proto::master::GetFileInfoRequest;

#[tokio::test]
async fn create_write_read_round_trip() {
    let common = small_common_config();
    let (_master, master_addr) = spawn_master(common.clone()).await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-a").await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-b").await;

    let client = client_for(&master_addr, common);
    client.create_file("/a").await.unwrap();
    client.write("/a", 0, b"Hello, World!").await.unwrap();

    let data = client.read("/a", 0, 13).await.unwrap();
    assert_eq!(data, b"Hello, World!");
}

#[tokio::test]
async fn write_spanning_chunk_boundary_allocates_two_chunks() {
    let mut common = small_common_config();
    common.chunk_size = 1024;
    let (_master, master_addr) = spawn_master(common.clone()).await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-a").await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-b").await;

    let client = client_for(&master_addr, common);
    client.create_file("/b").await.unwrap();
    let payload = vec![0x41u8; 100];
    client.write("/b", 1000, &payload).await.unwrap();

    let info = client.read("/b", 1000, 100).await.unwrap();
    assert_eq!(info, payload);
}

#[tokio::test]
async fn append_overflow_rolls_over_to_a_fresh_chunk() {
    let mut common = small_common_config();
    common.chunk_size = 16;
    let (_master, master_addr) = spawn_master(common.clone()).await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-a").await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-b").await;

    let client = client_for(&master_addr, common);
    client.create_file("/c").await.unwrap();

    let first = b"0123456789";
    let (first_chunk_index, first_offset) = client.append_record("/c", first).await.unwrap();
    // Fits entirely in the fresh chunk 0, landing at offset 0.
    assert_eq!((first_chunk_index, first_offset), (0, 0));

    let second = b"ABCDEFGHIJ";
    let (chunk_index, offset) = client.append_record("/c", second).await.unwrap();

    // The second record didn't fit in chunk 0 (6 bytes of room left: the
    // chunkserver fills bytes 10..15 and reports (10, 6), so the client
    // retries the full record on a fresh chunk), so it rolled over to chunk
    // 1 starting at offset 0.
    assert_eq!(chunk_index, 1);
    assert_eq!(offset, 0);
}

#[tokio::test]
async fn snapshot_is_copy_on_write() {
    let common = small_common_config();
    let (_master, master_addr) = spawn_master(common.clone()).await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-a").await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-b").await;

    let client = client_for(&master_addr, common);
    client.create_file("/x").await.unwrap();
    client.write("/x", 0, b"abc").await.unwrap();
    client.snapshot("/x", "/y").await.unwrap();

    client.write("/x", 0, b"Z").await.unwrap();

    assert_eq!(client.read("/y", 0, 3).await.unwrap(), b"abc");
    assert_eq!(client.read("/x", 0, 3).await.unwrap(), b"Zbc");
}

#[tokio::test]
async fn list_directory_returns_matching_prefixes() {
    let common = small_common_config();
    let (_master, master_addr) = spawn_master(common.clone()).await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-a").await;

    let client = client_for(&master_addr, common);
    client.create_file("/dir/one").await.unwrap();
    client.create_file("/dir/two").await.unwrap();
    client.create_file("/other").await.unwrap();

    let mut paths = client.list_directory("/dir/").await.unwrap();
    paths.sort();
    assert_eq!(paths, vec!["/dir/one".to_string(), "/dir/two".to_string()]);
}

#[tokio::test]
async fn replica_loss_triggers_repair_to_a_spare_chunkserver() {
    let mut common = small_common_config();
    common.replication_factor = 3;
    common.heartbeat_timeout = 2;
    let (_master, master_addr) = spawn_master(common.clone()).await;

    // Racks sort alphabetically, so placement fills rack-a/b/c first and
    // leaves rack-d spare, holding no replica of anything yet.
    let cs_a = spawn_chunkserver(&master_addr, common.clone(), "rack-a").await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-b").await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-c").await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-d").await;

    let client = client_for(&master_addr, common.clone());
    client.create_file("/d").await.unwrap();
    client.write("/d", 0, b"replicated-data").await.unwrap();

    let mut master_rpc = MasterClient::connect(format!("http://{master_addr}")).await.unwrap();
    let before = master_rpc
        .get_file_info(GetFileInfoRequest { path: "/d".to_string() })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(before.chunks_info[0].replicas.len(), 3);

    // Simulate cs_a crashing: stop its heartbeat loop and gRPC server.
    cs_a.stop();

    // Wait past heartbeat_timeout + 2*bg_tick_secs (bg_tick_secs is fixed at
    // 1 by the test harness), with margin for the failure-detector and
    // repair ticks to actually run.
    tokio::time::sleep(Duration::from_secs(common.heartbeat_timeout + 2 + 3)).await;

    let after = master_rpc
        .get_file_info(GetFileInfoRequest { path: "/d".to_string() })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(after.chunks_info[0].replicas.len(), 3);
    assert!(after
        .chunks_info[0]
        .replicas
        .iter()
        .all(|r| r.chunkserver_id != cs_a.runtime.id));

    let data = client.read("/d", 0, 16).await.unwrap();
    assert_eq!(data, b"replicated-data");
}

#[tokio::test]
async fn master_recovers_metadata_after_restart() {
    let common = small_common_config();
    let dir = tempfile::tempdir().unwrap();
    let metadata_dir = dir.path().to_path_buf();

    let (test_master, master_addr) = spawn_stoppable_master(&metadata_dir, common.clone()).await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-a").await;
    spawn_chunkserver(&master_addr, common.clone(), "rack-b").await;

    let client = client_for(&master_addr, common.clone());
    client.create_file("/e").await.unwrap();
    client.write("/e", 0, b"durable").await.unwrap();
    client.create_file("/f").await.unwrap();

    let mut master_rpc = MasterClient::connect(format!("http://{master_addr}")).await.unwrap();
    let before_e = master_rpc
        .get_file_info(GetFileInfoRequest { path: "/e".to_string() })
        .await
        .unwrap()
        .into_inner();
    let before_f = master_rpc
        .get_file_info(GetFileInfoRequest { path: "/f".to_string() })
        .await
        .unwrap()
        .into_inner();

    // Kill the Master: stop its gRPC server and background loops, leaving
    // the WAL and snapshot files on disk untouched.
    test_master.stop();

    let (_restarted, new_master_addr) = spawn_stoppable_master(&metadata_dir, common).await;
    let mut new_master_rpc = MasterClient::connect(format!("http://{new_master_addr}")).await.unwrap();
    let after_e = new_master_rpc
        .get_file_info(GetFileInfoRequest { path: "/e".to_string() })
        .await
        .unwrap()
        .into_inner();
    let after_f = new_master_rpc
        .get_file_info(GetFileInfoRequest { path: "/f".to_string() })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(before_e.chunk_handles, after_e.chunk_handles);
    assert_eq!(before_e.chunks_info.len(), after_e.chunks_info.len());
    for (b, a) in before_e.chunks_info.iter().zip(after_e.chunks_info.iter()) {
        assert_eq!(b.chunk_handle, a.chunk_handle);
        assert_eq!(b.size, a.size);
    }
    assert_eq!(before_f.chunk_handles, after_f.chunk_handles);
}
