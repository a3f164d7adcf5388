//! Mirra integration crate and workspace root
//!
//! This crate serves as the root of the mirra workspace and contains
//! integration tests covering full client/server synchronization runs.

// Re-export major components for integration testing
pub use mirra_client as client;
pub use mirra_daemon as daemon;
pub use mirra_index as index;
pub use mirra_proto as proto;
pub use mirra_sync as sync;
