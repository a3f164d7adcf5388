//! Sync index for mirra
//!
//! Maintains the per-root ledger mapping relative path to last-known
//! content digest, and reconciles it against the live filesystem on load.

pub mod digest;
pub mod errors;
pub mod index;

pub use digest::{hash_bytes, hash_file, Blake3Provider, DigestProvider, Digester};
pub use errors::{IndexError, Result};
pub use index::{
    from_wire_path, to_wire_path, IndexConfig, SyncIndex, INDEX_DIR_NAME, LEDGER_FILE_NAME,
};

// Wire types shared with the protocol crate.
pub use mirra_proto::{FileRecord, FileState};
