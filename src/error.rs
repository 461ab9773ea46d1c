//! The error taxonomy shared by the Master, the ChunkServer, and the Client.
//!
//! Every fallible operation in this crate returns `Result<T, GfsError>` instead of
//! the sentinel `None`/`-1` values the reference implementation uses. RPC handlers
//! convert a `GfsError` into a `tonic::Status` at the boundary via `From`.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("no capacity: {0}")]
    NoCapacity(String),

    #[error("chunk full")]
    ChunkFull,

    #[error("checksum mismatch: {0}")]
    ChecksumError(String),

    #[error("stale version: {0}")]
    Stale(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal failure: {0}")]
    Fatal(String),
}

pub type GfsResult<T> = Result<T, GfsError>;

impl From<GfsError> for tonic::Status {
    fn from(err: GfsError) -> Self {
        match err {
            GfsError::NotFound(msg) => tonic::Status::not_found(msg),
            GfsError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            GfsError::NoCapacity(msg) => tonic::Status::resource_exhausted(msg),
            GfsError::ChunkFull => tonic::Status::resource_exhausted("chunk full"),
            GfsError::ChecksumError(msg) => tonic::Status::data_loss(msg),
            GfsError::Stale(msg) => tonic::Status::failed_precondition(msg),
            GfsError::Transient(msg) => tonic::Status::unavailable(msg),
            GfsError::Fatal(msg) => tonic::Status::internal(msg),
        }
    }
}

impl From<std::io::Error> for GfsError {
    fn from(err: std::io::Error) -> Self {
        GfsError::Fatal(err.to_string())
    }
}

impl From<serde_json::Error> for GfsError {
    fn from(err: serde_json::Error) -> Self {
        GfsError::Fatal(err.to_string())
    }
}
