//! Error types for the wire protocol

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Unknown command byte: {0:#04x}")]
    UnknownCommand(u8),

    #[error("Unexpected command: expected {expected:?}, got {got:?}")]
    UnexpectedCommand {
        expected: crate::codec::Command,
        got: crate::codec::Command,
    },

    #[error("Invalid payload length: {0}")]
    InvalidLength(i32),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid digest trailer: {0}")]
    InvalidDigest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
