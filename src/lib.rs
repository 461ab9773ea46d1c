//! A didactic Google-File-System-style distributed chunk storage system:
//! a Master holding namespace and chunk metadata, ChunkServers holding the
//! actual bytes, and a Client library coordinating reads, writes, and
//! appends across them.

pub mod client;
pub mod chunkserver;
pub mod config;
pub mod error;
pub mod master;
pub mod types;

pub mod proto {
    pub mod master {
        tonic::include_proto!("master");
    }
    pub mod chunk {
        tonic::include_proto!("chunk");
    }
}
