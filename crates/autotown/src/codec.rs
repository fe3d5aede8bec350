//! Gzip payload codec.
//!
//! Raw documents and queue payloads are gzip-compressed before they are
//! persisted. Decompression either yields the complete original bytes or an
//! [`Error::Codec`]; partial output is never handed back.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// Compress `data` with gzip at the default level.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the encoder fails.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::codec(format!("gzip write: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::codec(format!("gzip finish: {e}")))
}

/// Decompress a gzip stream produced by [`compress`].
///
/// # Errors
///
/// Returns [`Error::Codec`] if `data` is not a complete, valid gzip stream.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::codec(format!("gzip read: {e}")))?;
    Ok(out)
}
