//! Payload compression selected by the compression sub-range of the flags byte.
//!
//! Only zstd is implemented. Lz4 is a known algorithm id that is rejected
//! with `UnsupportedCompression` instead of being passed through as raw bytes.

use std::io::Read;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::wire_format::flags::compression as ids;
use crate::error::{Result, RpcError};

/// Compression algorithm id carried in the low nibble of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionFlags {
    /// Reserved default. Payload is passed through.
    None = ids::NONE,
    /// Explicitly uncompressed.
    #[default]
    Disabled = ids::DISABLED,
    /// zstandard.
    Zstd = ids::ZSTD,
    /// lz4. Recognized on the wire, never produced or accepted.
    Lz4 = ids::LZ4,
}

impl CompressionFlags {
    /// Raw id as written to the wire.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CompressionFlags {
    type Error = RpcError;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            ids::NONE => Ok(CompressionFlags::None),
            ids::DISABLED => Ok(CompressionFlags::Disabled),
            ids::ZSTD => Ok(CompressionFlags::Zstd),
            ids::LZ4 => Ok(CompressionFlags::Lz4),
            other => Err(RpcError::UnsupportedCompression(other)),
        }
    }
}

/// A payload compression algorithm.
pub trait Compressor: Send + Sync {
    /// Compress a payload.
    fn compress(&self, data: &[u8]) -> Result<Bytes>;

    /// Decompress a payload, refusing output larger than `limit` bytes.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Bytes>;
}

/// zstandard compressor.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Default compression level.
    pub const DEFAULT_LEVEL: i32 = 3;

    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Bytes> {
        zstd::encode_all(data, self.level)
            .map(Bytes::from)
            .map_err(|e| RpcError::Compression(format!("zstd compression failed: {e}")))
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Bytes> {
        let decoder = zstd::stream::read::Decoder::new(data)
            .map_err(|e| RpcError::Compression(format!("zstd decompression failed: {e}")))?;

        // Read one byte past the limit to detect oversize output.
        let mut out = Vec::new();
        decoder
            .take(limit as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| RpcError::Compression(format!("zstd decompression failed: {e}")))?;

        if out.len() > limit {
            return Err(RpcError::Compression(format!(
                "Decompressed payload exceeds maximum {limit}"
            )));
        }
        Ok(Bytes::from(out))
    }
}

/// Apply outbound compression for `algorithm`.
pub fn compress(algorithm: CompressionFlags, payload: Bytes) -> Result<Bytes> {
    match algorithm {
        CompressionFlags::None | CompressionFlags::Disabled => Ok(payload),
        CompressionFlags::Zstd => ZstdCompressor::default().compress(&payload),
        CompressionFlags::Lz4 => Err(RpcError::UnsupportedCompression(algorithm.id())),
    }
}

/// Undo compression for the raw algorithm id found on the wire.
pub fn decompress(id: u8, payload: Bytes, limit: usize) -> Result<Bytes> {
    match CompressionFlags::try_from(id)? {
        CompressionFlags::None | CompressionFlags::Disabled => Ok(payload),
        CompressionFlags::Zstd => ZstdCompressor::default().decompress(&payload, limit),
        CompressionFlags::Lz4 => Err(RpcError::UnsupportedCompression(id)),
    }
}
