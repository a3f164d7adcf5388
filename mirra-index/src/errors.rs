//! Error types for index operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Path escapes the sync root: {0}")]
    PathOutsideRoot(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;
