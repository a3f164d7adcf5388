//! Command framing over a byte stream
//!
//! Every frame starts with a fixed-size header: four reserved bytes
//! (zero unless the caller sets them), one command byte, and a 4-byte
//! little-endian signed payload length. The payload is an opaque
//! length-prefixed byte block; this module never looks inside it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::errors::{ProtoError, Result};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 9;

/// Upper bound for a single structured payload. File bodies are streamed
/// outside of frames and are not subject to this limit.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Maximum accepted digest trailer length (hex characters).
const MAX_DIGEST_LEN: u32 = 256;

/// Single-byte command opcodes.
///
/// Registration and discovery opcodes used by the pairing collaborator
/// live in a separate id range and are not part of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    GetSession = 1,
    GetSyncList = 2,
    GetFile = 3,
    SendFile = 4,
    FinishSession = 5,
    Disconnect = 6,
}

impl TryFrom<u8> for Command {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Command::GetSession),
            2 => Ok(Command::GetSyncList),
            3 => Ok(Command::GetFile),
            4 => Ok(Command::SendFile),
            5 => Ok(Command::FinishSession),
            6 => Ok(Command::Disconnect),
            other => Err(ProtoError::UnknownCommand(other)),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub reserved: [u8; 4],
    pub command: Command,
    pub payload_len: i32,
}

/// Write a frame header. `reserved` is caller-defined and zero by default.
pub async fn write_header<W>(writer: &mut W, command: Command, payload_len: i32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    buf[4] = command as u8;
    buf[5..9].copy_from_slice(&payload_len.to_le_bytes());
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read a frame header, suspending until all header bytes arrive.
///
/// A stream that closes before a full header was read yields
/// [`ProtoError::ConnectionClosed`], never a partial header.
pub async fn read_header<R>(reader: &mut R) -> Result<Header>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut buf).await?;

    let command = Command::try_from(buf[4])?;
    let payload_len = i32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
    trace!(?command, payload_len, "read frame header");

    Ok(Header {
        reserved: [buf[0], buf[1], buf[2], buf[3]],
        command,
        payload_len,
    })
}

/// Read the payload announced by a header.
pub async fn read_payload<R>(reader: &mut R, payload_len: i32) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if payload_len < 0 {
        return Err(ProtoError::InvalidLength(payload_len));
    }
    let len = payload_len as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtoError::PayloadTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    read_exact_or_closed(reader, &mut buf).await?;
    Ok(buf)
}

/// Serialize `body` and write it as a complete frame, flushing the stream.
pub async fn write_frame<W, T>(writer: &mut W, command: Command, body: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(body)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtoError::PayloadTooLarge(payload.len()));
    }
    let payload_len =
        i32::try_from(payload.len()).map_err(|_| ProtoError::PayloadTooLarge(payload.len()))?;

    write_header(writer, command, payload_len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a full frame and decode its payload, requiring `expected` as the
/// command byte.
pub async fn read_frame<R, T>(reader: &mut R, expected: Command) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let header = read_header(reader).await?;
    if header.command != expected {
        return Err(ProtoError::UnexpectedCommand {
            expected,
            got: header.command,
        });
    }
    let payload = read_payload(reader, header.payload_len).await?;
    decode(&payload)
}

/// Decode a payload previously read with [`read_payload`].
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Write the length-prefixed hex digest that trails a file body.
pub async fn write_digest_trailer<W>(writer: &mut W, digest: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = digest.as_bytes();
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the digest trailer following a file body.
pub async fn read_digest_trailer<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(reader, &mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_DIGEST_LEN {
        return Err(ProtoError::InvalidDigest(format!(
            "trailer length {} out of range",
            len
        )));
    }

    let mut buf = vec![0u8; len as usize];
    read_exact_or_closed(reader, &mut buf).await?;
    String::from_utf8(buf).map_err(|e| ProtoError::InvalidDigest(e.to_string()))
}

/// `read_exact` that reports a closed stream as [`ProtoError::ConnectionClosed`]
/// rather than a bare IO error. Callers must treat a short read as fatal.
async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtoError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}
