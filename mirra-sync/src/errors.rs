//! Error types for sync operations

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(#[from] mirra_index::IndexError),

    #[error("Reconciliation invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Shadow directory not empty after commit: {0}")]
    DirtyShadow(PathBuf),
}

pub type Result<T> = std::result::Result<T, SyncError>;
