//! Streaming content hasher.
//!
//! Files are read in fixed-size chunks through SHA-256. After every chunk the
//! shared [`Liveness`] clock is advanced; that beat is what the stall watchdog
//! watches. The cancellation token is checked at each chunk boundary, so a
//! cancelled hash never yields a digest and the file handle is dropped on the
//! way out.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::errors::{BrsError, Result};
use crate::scanner::progress::{CancelToken, Liveness};

/// Default read size per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Produces a hex content digest for a file.
///
/// The engine only depends on this trait, so alternative digests (or test
/// doubles that stall on purpose) can be plugged in.
pub trait ContentHasher: Send + Sync {
    fn hash(&self, path: &Path, liveness: &Liveness, cancel: &CancelToken) -> Result<String>;
}

/// SHA-256 over the file bytes, hex encoded.
#[derive(Debug, Clone)]
pub struct Sha256Hasher {
    chunk_size: usize,
}

impl Sha256Hasher {
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ContentHasher for Sha256Hasher {
    fn hash(&self, path: &Path, liveness: &Liveness, cancel: &CancelToken) -> Result<String> {
        let mut file = File::open(path).map_err(|source| BrsError::io(path, source))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            if cancel.is_cancelled() {
                return Err(BrsError::Cancelled {
                    path: path.to_path_buf(),
                });
            }
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(source) => return Err(BrsError::io(path, source)),
            };
            hasher.update(&buf[..n]);
            liveness.beat();
        }

        if cancel.is_cancelled() {
            return Err(BrsError::Cancelled {
                path: path.to_path_buf(),
            });
        }
        Ok(hex_encode(&hasher.finalize()))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}
