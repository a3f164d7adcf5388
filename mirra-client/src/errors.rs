//! Error types for the sync client

use thiserror::Error;

use mirra_proto::WireError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Proto(#[from] mirra_proto::ProtoError),

    #[error("Index error: {0}")]
    Index(#[from] mirra_index::IndexError),

    #[error("Server error: {0}")]
    Server(WireError),

    #[error("Missing response field from server: {0}")]
    MissingField(&'static str),

    #[error("Digest mismatch for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Local file missing for upload: {0}")]
    MissingLocalFile(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
