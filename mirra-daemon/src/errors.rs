//! Error types for the sync server

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Proto(#[from] mirra_proto::ProtoError),

    #[error("Sync error: {0}")]
    Sync(#[from] mirra_sync::SyncError),

    #[error("Index error: {0}")]
    Index(#[from] mirra_index::IndexError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
