//! Sync server for mirra
//!
//! Accepts framed-command connections and drives session state through
//! the index, reconciliation and staging components. One task owns each
//! connection; the session store is the only shared state.

pub mod errors;
pub mod handler;
pub mod resolver;
pub mod server;

pub use errors::{Result, ServerError};
pub use resolver::{RootResolver, StaticRoot};
pub use server::{ServerConfig, ServerHandle, SyncServer};
