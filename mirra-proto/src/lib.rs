//! Wire protocol for mirra synchronization
//!
//! Frames single-byte commands and length-prefixed payloads over a byte
//! stream. The codec never interprets payload contents; payloads are
//! structured documents produced by the serializer shared by both ends.

pub mod codec;
pub mod errors;
pub mod messages;

pub use codec::{
    read_digest_trailer, read_header, read_payload, write_digest_trailer, write_frame,
    write_header, Command, Header, HEADER_LEN,
};
pub use errors::{ProtoError, Result};
pub use messages::{
    ActionSet, FileRecord, FileState, FinishSessionRequest, FinishSessionResponse,
    GetFileRequest, GetFileResponse, GetSessionRequest, GetSessionResponse, GetSyncListRequest,
    GetSyncListResponse, SendFileRequest, SendFileResponse, WireError, WireErrorKind,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: &str = "1.0.0";
