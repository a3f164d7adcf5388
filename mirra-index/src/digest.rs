//! Pluggable content digests
//!
//! The engine only needs a deterministic, streamable hash returning a
//! fixed-width hex digest; it is used both as a change fingerprint and
//! as a transfer integrity check. BLAKE3 is the default provider.

use std::path::Path;

use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::errors::Result;

/// Read buffer for streaming file hashes.
pub const HASH_BUF_SIZE: usize = 64 * 1024;

/// Incremental hash over a byte stream.
pub trait Digester: Send {
    fn update(&mut self, bytes: &[u8]);

    /// Consume the digester and return the fixed-width hex digest.
    fn finish(self: Box<Self>) -> String;
}

/// Factory for [`Digester`] instances. Implementations must be cheap to
/// clone behind an `Arc` and produce digests of a constant hex width.
pub trait DigestProvider: Send + Sync {
    fn start(&self) -> Box<dyn Digester>;

    /// Width of the hex digest in characters.
    fn hex_width(&self) -> usize;
}

/// Default provider backed by BLAKE3.
#[derive(Debug, Clone, Default)]
pub struct Blake3Provider;

struct Blake3Digester {
    hasher: blake3::Hasher,
}

impl Digester for Blake3Digester {
    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn finish(self: Box<Self>) -> String {
        hex::encode(self.hasher.finalize().as_bytes())
    }
}

impl DigestProvider for Blake3Provider {
    fn start(&self) -> Box<dyn Digester> {
        Box::new(Blake3Digester {
            hasher: blake3::Hasher::new(),
        })
    }

    fn hex_width(&self) -> usize {
        64
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(provider: &dyn DigestProvider, bytes: &[u8]) -> String {
    let mut digester = provider.start();
    digester.update(bytes);
    digester.finish()
}

/// Stream a file through the provider and return its digest.
pub async fn hash_file(provider: &dyn DigestProvider, path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut digester = provider.start();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
    }

    Ok(digester.finish())
}
