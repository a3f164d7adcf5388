//! Synchronization core for mirra
//!
//! This crate provides:
//! - The reconciliation engine classifying files into action sets
//! - The staged-commit helper applying session results atomically
//! - Server-side session state and the session store

pub mod errors;
pub mod reconcile;
pub mod session;
pub mod staging;

pub use errors::{Result, SyncError};
pub use reconcile::{reconcile, Plan};
pub use session::{Session, SessionConfig, SessionStore};
pub use staging::Stager;
