// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payload compression for the remote object tier.
//!
//! Object payloads are serialized JSON and compress well, and the object
//! store is the tier that pays per byte over the network. Local tiers store
//! plain JSON.
//!
//! # Feature Flag
//!
//! Compression needs the `compression` feature (on by default). Without it,
//! [`compress`] refuses and [`decompress`] can still tell a caller that an
//! object was written compressed.
//!
//! # Example
//!
//! ```rust,ignore
//! use batch_vault::compression::{compress, decompress};
//!
//! let raw = br#"{"resumes": ["a.pdf", "b.pdf"]}"#;
//! let packed = compress(raw)?;
//! assert_eq!(decompress(&packed)?, raw);
//! ```

use crate::storage::traits::StorageError;

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
#[cfg(feature = "compression")]
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    #[error("payload is compressed but the `compression` feature is disabled")]
    Unsupported,
}

impl From<CompressionError> for StorageError {
    fn from(err: CompressionError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Whether this build can write compressed payloads.
#[must_use]
pub const fn is_available() -> bool {
    cfg!(feature = "compression")
}

#[cfg(feature = "compression")]
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    compress_with_level(data, DEFAULT_COMPRESSION_LEVEL)
}

/// Compress with a custom zstd level (1-22).
#[cfg(feature = "compression")]
pub fn compress_with_level(data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
    zstd::encode_all(data, level).map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

/// Decompress bytes. Data without the zstd header is returned unchanged.
#[cfg(feature = "compression")]
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if is_compressed(data) {
        zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(not(feature = "compression"))]
pub fn compress(_data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    Err(CompressionError::Unsupported)
}

#[cfg(not(feature = "compression"))]
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if is_compressed(data) {
        Err(CompressionError::Unsupported)
    } else {
        Ok(data.to_vec())
    }
}

/// Compression statistics for a single payload.
#[derive(Debug, Clone, Copy)]
pub struct CompressionStats {
    pub original_bytes: usize,
    pub compressed_bytes: usize,
    /// Space saved as a fraction (0.0 - 1.0)
    pub savings: f64,
}

impl CompressionStats {
    #[must_use]
    pub fn new(original_bytes: usize, compressed_bytes: usize) -> Self {
        let savings = if original_bytes > 0 {
            1.0 - (compressed_bytes as f64 / original_bytes as f64)
        } else {
            0.0
        };
        Self {
            original_bytes,
            compressed_bytes,
            savings,
        }
    }
}
