//! Mapping connecting clients to filesystem roots

use std::path::PathBuf;

/// Resolves an identified client to the root it synchronizes against.
///
/// The configuration store that backs this in a full deployment is an
/// external collaborator; the server only needs the lookup.
pub trait RootResolver: Send + Sync {
    /// Returns `(root_dir, display_name)` for the owner, or `None` if
    /// the client has no configured root.
    fn resolve_root(&self, owner: &str) -> Option<(PathBuf, String)>;
}

/// Serves a single configured directory to every client.
pub struct StaticRoot {
    root: PathBuf,
    name: String,
}

impl StaticRoot {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
        }
    }
}

impl RootResolver for StaticRoot {
    fn resolve_root(&self, _owner: &str) -> Option<(PathBuf, String)> {
        Some((self.root.clone(), self.name.clone()))
    }
}
