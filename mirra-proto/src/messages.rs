//! Shared message types for the sync protocol
//!
//! These are the structured documents carried inside frame payloads.
//! Both ends agree on the serializer (JSON today); nothing here depends
//! on the framing itself.

use serde::{Deserialize, Serialize};

/// Transient classification of a file relative to the persisted ledger.
///
/// Computed at index load time; a freshly loaded or rebuilt ledger entry
/// is always written back as `NotChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    NotChanged,
    New,
    Modified,
    Deleted,
}

/// One file in a sync index or file list. Identity is `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Root-relative path with `/` separators.
    pub path: String,
    /// Fixed-width hex content digest.
    pub digest: String,
    pub state: FileState,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, digest: impl Into<String>, state: FileState) -> Self {
        Self {
            path: path.into(),
            digest: digest.into(),
            state,
        }
    }
}

/// Classified result of one reconciliation call.
///
/// The four lists are disjoint: a record appears in exactly one of them
/// or in none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionSet {
    pub to_upload: Vec<FileRecord>,
    pub to_download: Vec<FileRecord>,
    pub to_remove: Vec<FileRecord>,
    pub conflicts: Vec<FileRecord>,
}

impl ActionSet {
    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty()
            && self.to_download.is_empty()
            && self.to_remove.is_empty()
            && self.conflicts.is_empty()
    }

    /// Total number of classified records.
    pub fn len(&self) -> usize {
        self.to_upload.len() + self.to_download.len() + self.to_remove.len() + self.conflicts.len()
    }
}

/// Error category reported inside a response payload.
///
/// Session errors leave the connection usable; protocol-level failures
/// (bad header, short read) never reach this type and close the
/// connection instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    /// Unknown or expired session id.
    Session,
    /// Malformed request (bad path, missing prerequisite).
    BadRequest,
    /// Filesystem failure while serving the request.
    Io,
    /// Digest mismatch after a file transfer.
    Integrity,
    /// Internal defect, e.g. a reconciliation invariant violation.
    Internal,
}

/// Error carried in a response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
}

impl WireError {
    pub fn session(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Session,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::BadRequest,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Io,
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Integrity,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionRequest {
    /// Identifies the connecting client to the server's root resolver.
    pub owner: String,
    /// Client protocol version; the server refuses a mismatch before
    /// opening a session.
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionResponse {
    pub session_id: Option<String>,
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSyncListRequest {
    pub session_id: String,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSyncListResponse {
    pub actions: Option<ActionSet>,
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFileRequest {
    pub session_id: String,
    pub path: String,
}

/// On success `size` announces the raw body that follows this frame,
/// trailed by a length-prefixed digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFileResponse {
    pub size: Option<u64>,
    pub error: Option<WireError>,
}

/// A raw body of `size` bytes plus digest trailer follows this frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendFileRequest {
    pub session_id: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendFileResponse {
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishSessionResponse {
    /// Conflicts recorded during the session; never auto-resolved.
    pub conflicts: Vec<FileRecord>,
    pub error: Option<WireError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_state_wire_names() {
        let json = serde_json::to_string(&FileState::NotChanged).unwrap();
        assert_eq!(json, "\"not_changed\"");
        let state: FileState = serde_json::from_str("\"modified\"").unwrap();
        assert_eq!(state, FileState::Modified);
    }

    #[test]
    fn test_action_set_empty() {
        let actions = ActionSet::default();
        assert!(actions.is_empty());
        assert_eq!(actions.len(), 0);
    }

    #[test]
    fn test_record_round_trip() {
        let record = FileRecord::new("a/b.txt", "ff".repeat(32), FileState::New);
        let json = serde_json::to_string(&record).unwrap();
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
