//! Layered configuration for the three binaries (`master`, `chunkserver`, `client`).
//!
//! Configuration is loaded from a TOML file and merged with built-in defaults via
//! `#[serde(default)]`, so a deployment only needs to override the fields it cares
//! about. The CLI layer (out of scope for this crate) is expected to let an operator
//! point at a config path and optionally override `host`/`port` on the command line.

use serde::Deserialize;
use std::fs;
use std::time::Duration;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_metadata_dir() -> String {
    "data/master".to_string()
}

fn default_snapshot_file() -> String {
    "metadata_snapshot.json".to_string()
}

fn default_wal_file() -> String {
    "wal.log".to_string()
}

fn default_master_port() -> u16 {
    8000
}

fn default_chunk_size() -> u64 {
    64 * 1024 * 1024
}

fn default_replication_factor() -> usize {
    3
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_lease_duration() -> u64 {
    60
}

fn default_rack_id() -> String {
    "default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_retention_window_secs() -> u64 {
    3600
}

fn default_bg_tick_secs() -> u64 {
    5
}

fn default_gc_interval_secs() -> u64 {
    3600
}

fn default_checkpoint_interval_secs() -> u64 {
    60
}

fn default_max_repairs_per_tick() -> usize {
    2
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub metadata_dir: String,
    pub snapshot_file: String,
    pub wal_file: String,
    /// Interval of the failure-detector / re-replication tick.
    pub bg_tick_secs: u64,
    /// How often a full GC sweep (mark-garbage + physical delete) runs.
    pub gc_interval_secs: u64,
    /// How long a chunk may sit at reference_count == 0 before physical deletion.
    pub retention_window_secs: u64,
    /// How often a metadata snapshot is taken.
    pub checkpoint_interval_secs: u64,
    /// Max number of under-replicated chunks repaired per background tick.
    pub max_repairs_per_tick: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_master_port(),
            metadata_dir: default_metadata_dir(),
            snapshot_file: default_snapshot_file(),
            wal_file: default_wal_file(),
            bg_tick_secs: default_bg_tick_secs(),
            gc_interval_secs: default_gc_interval_secs(),
            retention_window_secs: default_retention_window_secs(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            max_repairs_per_tick: default_max_repairs_per_tick(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChunkServerConfig {
    /// Auto-generated (uuid) if left blank.
    pub chunkserver_id: String,
    pub host: String,
    pub port: u16,
    pub master_address: String,
    pub data_dir: String,
    pub heartbeat_interval: u64,
    pub rack_id: String,
}

impl Default for ChunkServerConfig {
    fn default() -> Self {
        Self {
            chunkserver_id: String::new(),
            host: default_host(),
            port: 0,
            master_address: format!("{}:{}", default_host(), default_master_port()),
            data_dir: "data/chunkserver".to_string(),
            heartbeat_interval: default_heartbeat_interval(),
            rack_id: default_rack_id(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub master_address: String,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            master_address: format!("{}:{}", default_host(), default_master_port()),
            log_level: default_log_level(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub chunk_size: u64,
    pub replication_factor: usize,
    pub heartbeat_timeout: u64,
    pub lease_duration: u64,
    pub log_level: String,
    pub log_output: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            replication_factor: default_replication_factor(),
            heartbeat_timeout: default_heartbeat_timeout(),
            lease_duration: default_lease_duration(),
            log_level: default_log_level(),
            log_output: default_log_output(),
        }
    }
}

impl CommonConfig {
    pub fn heartbeat_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }

    pub fn lease_duration_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration)
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub master: MasterConfig,
    pub chunkserver: ChunkServerConfig,
    pub client: ClientConfig,
    pub common: CommonConfig,
}

pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let config_content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&config_content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_populated_without_a_file() {
        let config = Config::default();
        assert_eq!(config.master.port, 8000);
        assert_eq!(config.common.replication_factor, 3);
        assert_eq!(config.common.chunk_size, 64 * 1024 * 1024);
    }

    #[test]
    fn partial_toml_fills_remaining_fields_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[master]\nport = 9001\n").unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.master.port, 9001);
        assert_eq!(config.master.host, "localhost");
    }
}
