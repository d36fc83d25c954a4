//! File checksums for the transfer headers.
//!
//! The headers carry 32-bit crc32 values: the sender's whole-file
//! checksum, the receiver's resume-claim prefix checksum, and the final
//! verification checksum.  Reads are chunked so checksumming a large file
//! never holds a buffer bigger than [`CHECKSUM_CHUNK`].

use std::path::Path;

// ---

use crc32fast::Hasher;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

// ---

use peerway_domain::Result;

// ---

const CHECKSUM_CHUNK: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// checksum_file / checksum_prefix
// ---------------------------------------------------------------------------

/// crc32 of the whole file at `path`.
pub async fn checksum_file(path: &Path) -> Result<u32> {
    // ---
    let len = tokio::fs::metadata(path).await?.len();
    checksum_prefix(path, len).await
}

// ---

/// crc32 of the first `len` bytes of the file at `path`.
///
/// Errors if the file is shorter than `len` — the caller decides whether
/// that means "claim cannot match" or "fail the transfer".
pub async fn checksum_prefix(path: &Path, len: u64) -> Result<u32> {
    // ---
    let mut file = File::open(path).await?;
    let mut hasher = Hasher::new();
    let mut remaining = len;
    let mut buf = vec![0u8; CHECKSUM_CHUNK];

    while remaining > 0 {
        let want = (remaining as usize).min(CHECKSUM_CHUNK);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file shorter than checksum range: {} bytes missing", remaining),
            )
            .into());
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }

    Ok(hasher.finalize())
}

// ---

/// crc32 of an in-memory slice.
pub fn checksum_bytes(data: &[u8]) -> u32 {
    // ---
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
