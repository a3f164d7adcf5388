//! Sync client for mirra
//!
//! Drives one synchronization run end to end over a single framed
//! connection: open session, exchange file lists, transfer files named
//! in the action sets, finish, persist the local ledger.

pub mod client;
pub mod errors;
pub mod events;

pub use client::{ClientConfig, SyncClient, SyncReport};
pub use errors::{ClientError, Result};
pub use events::{EventSink, SyncEvent};
