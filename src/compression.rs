// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Compression for backup snapshots.
//!
//! Uses zstd streaming compression with magic-bytes detection, so blobs
//! written without compression decode transparently.
//!
//! # Feature Flag
//!
//! The codec requires the `compression` feature (on by default). Without it
//! [`compress_bytes`] reports [`CompressionError::Unsupported`] and the
//! backup manager stores snapshots uncompressed instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use storage_resilience::compression::{compress_bytes, decompress_bytes};
//!
//! let compressed = compress_bytes(b"{\"orders\": []}")?;
//! assert_eq!(decompress_bytes(&compressed)?, b"{\"orders\": []}");
//! ```

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
#[cfg(feature = "compression")]
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Failed to compress data
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// Failed to decompress data
    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    /// Built without the `compression` feature
    #[error("compression support not available in this build")]
    Unsupported,
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Compress bytes with the default level.
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    #[cfg(feature = "compression")]
    {
        compress_bytes_with_level(data, DEFAULT_COMPRESSION_LEVEL)
    }
    #[cfg(not(feature = "compression"))]
    {
        let _ = data;
        Err(CompressionError::Unsupported)
    }
}

/// Compress bytes with a custom level (1-22).
///
/// - Level 1-3: Fast, good for frequent automatic backups
/// - Level 19-22: Maximum compression, slow
#[cfg(feature = "compression")]
pub fn compress_bytes_with_level(data: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
    zstd::stream::encode_all(data, level)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

/// Decompress bytes.
///
/// Returns the original bytes if they are not compressed.
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if !is_compressed(data) {
        return Ok(data.to_vec());
    }
    #[cfg(feature = "compression")]
    {
        zstd::stream::decode_all(data)
            .map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    }
    #[cfg(not(feature = "compression"))]
    {
        Err(CompressionError::Unsupported)
    }
}

/// Size accounting for one encoded snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CompressionStats {
    /// Original size in bytes
    pub original_bytes: usize,
    /// Compressed size in bytes
    pub compressed_bytes: usize,
    /// Compression ratio (original / compressed)
    pub ratio: f64,
    /// Space saved as percentage (0.0 - 1.0)
    pub savings: f64,
}

impl CompressionStats {
    /// Calculate stats from original and compressed sizes.
    #[must_use]
    pub fn new(original_bytes: usize, compressed_bytes: usize) -> Self {
        let ratio = if compressed_bytes > 0 {
            original_bytes as f64 / compressed_bytes as f64
        } else {
            0.0
        };
        let savings = if original_bytes > 0 {
            1.0 - (compressed_bytes as f64 / original_bytes as f64)
        } else {
            0.0
        };
        Self {
            original_bytes,
            compressed_bytes,
            ratio,
            savings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_compressed_rejects_plain_bytes() {
        assert!(!is_compressed(b"{\"test\": \"data\"}"));
        assert!(!is_compressed(b""));
        assert!(!is_compressed(b"abc"));
    }

    #[test]
    fn test_decompress_passes_plain_bytes_through() {
        let original = b"Plain snapshot data";
        let result = decompress_bytes(original).unwrap();
        assert_eq!(original.as_slice(), result.as_slice());
    }

    #[test]
    fn test_stats() {
        let stats = CompressionStats::new(1000, 250);
        assert!((stats.ratio - 4.0).abs() < f64::EPSILON);
        assert!((stats.savings - 0.75).abs() < f64::EPSILON);

        let empty = CompressionStats::new(0, 0);
        assert_eq!(empty.ratio, 0.0);
        assert_eq!(empty.savings, 0.0);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_compress_roundtrip() {
        let original = serde_json::to_vec(&serde_json::json!({
            "orders": (0..100).map(|i| serde_json::json!({"id": i, "total": 100})).collect::<Vec<_>>()
        }))
        .unwrap();

        let compressed = compress_bytes(&original).unwrap();
        assert!(is_compressed(&compressed));
        assert!(compressed.len() < original.len());
        assert_eq!(decompress_bytes(&compressed).unwrap(), original);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_compression_levels_all_decode() {
        let data = "x".repeat(1000).into_bytes();
        for level in [1, 10, 19] {
            let compressed = compress_bytes_with_level(&data, level).unwrap();
            assert_eq!(decompress_bytes(&compressed).unwrap(), data);
        }
    }

    #[cfg(not(feature = "compression"))]
    #[test]
    fn test_compress_unsupported_without_feature() {
        assert!(matches!(compress_bytes(b"data"), Err(CompressionError::Unsupported)));
    }
}
