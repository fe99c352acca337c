//! Wire format encoding and decoding.
//!
//! One frame per logical request or response:
//! ```text
//! ┌───────────┬────────────┬───────┬─────────────┬──────────────┬─────────┐
//! │ totalSize │ sessionId  │ Flags │ methodMeta  │ checksum     │ payload │
//! │ 4 bytes   │ 4 bytes    │ 1 byte│ 8 bytes     │ 4 bytes, iff │ N bytes │
//! │ uint32 BE │ uint32 BE  │       │ uint64 BE   │ CHECKSUM set │         │
//! └───────────┴────────────┴───────┴─────────────┴──────────────┴─────────┘
//! ```
//!
//! `totalSize` counts every byte after the size field itself.
//! All multi-byte integers are Big Endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{RpcError, Result};

/// Size of the leading `totalSize` field.
pub const SIZE_FIELD_LEN: usize = 4;

/// Fields always present after `totalSize`: session id, flags, method meta.
pub const FIXED_FIELDS_LEN: usize = 4 + 1 + 8;

/// Size of the optional checksum field.
pub const CHECKSUM_LEN: usize = 4;

/// Smallest possible encoded frame (empty payload, no checksum).
pub const MIN_FRAME_LEN: usize = SIZE_FIELD_LEN + FIXED_FIELDS_LEN;

/// Default maximum payload size (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Reserved session id: "no session". Used by one-way sends.
pub const NO_SESSION: u32 = 0;

/// Flag constants for the protocol.
///
/// The low nibble is the compression-algorithm sub-range: its values are
/// mutually exclusive. The remaining bits are orthogonal to it and to each
/// other, so e.g. `CHECKSUM | compression::ZSTD` is a valid combination.
pub mod flags {
    /// Compression algorithm sub-range (values, not bits).
    pub const COMPRESSION_MASK: u8 = 0b0000_1111;
    /// Checksum field present.
    pub const CHECKSUM: u8 = 0b0001_0000;
    /// Reserved bits mask (bits 5-7).
    pub const RESERVED_MASK: u8 = 0b1110_0000;

    /// Values of the compression sub-range.
    pub mod compression {
        /// No compression semantics (reserved default).
        pub const NONE: u8 = 0;
        /// Explicitly uncompressed.
        pub const DISABLED: u8 = 1;
        /// zstandard.
        pub const ZSTD: u8 = 2;
        /// lz4 (recognized, not implemented).
        pub const LZ4: u8 = 3;
    }

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Extract the compression algorithm id.
    #[inline]
    pub fn compression_id(flags: u8) -> u8 {
        flags & COMPRESSION_MASK
    }

    /// Replace the compression algorithm id, keeping every other bit.
    #[inline]
    pub fn with_compression(flags: u8, id: u8) -> u8 {
        (flags & !COMPRESSION_MASK) | (id & COMPRESSION_MASK)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Correlates a request with its response (0 = no session).
    pub session_id: u32,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Opaque method identifier.
    pub method_meta: u64,
    /// Checksum over the payload as transmitted. `Some` iff `flags::CHECKSUM` is set.
    pub checksum: Option<u32>,
}

impl Header {
    /// Create a new header. The checksum flag is derived from `checksum`.
    pub fn new(session_id: u32, flags: u8, method_meta: u64, checksum: Option<u32>) -> Self {
        let flags = match checksum {
            Some(_) => flags | flags::CHECKSUM,
            None => flags & !flags::CHECKSUM,
        };
        Self {
            session_id,
            flags,
            method_meta,
            checksum,
        }
    }

    /// Length of the header fields following `totalSize`.
    #[inline]
    pub fn fields_len(&self) -> usize {
        if self.has_checksum() {
            FIXED_FIELDS_LEN + CHECKSUM_LEN
        } else {
            FIXED_FIELDS_LEN
        }
    }

    /// Value of the `totalSize` field for a payload of `payload_len` bytes.
    #[inline]
    pub fn total_size(&self, payload_len: usize) -> usize {
        self.fields_len() + payload_len
    }

    /// Encode the size field and header fields into `buf` (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rpcmux::protocol::{flags, Header, MIN_FRAME_LEN};
    ///
    /// let header = Header::new(42, flags::compression::DISABLED, 7, None);
    /// let mut buf = BytesMut::new();
    /// header.encode_into(&mut buf, 0);
    /// assert_eq!(buf.len(), MIN_FRAME_LEN);
    /// ```
    pub fn encode_into(&self, buf: &mut BytesMut, payload_len: usize) {
        buf.reserve(SIZE_FIELD_LEN + self.fields_len());
        buf.put_u32(self.total_size(payload_len) as u32);
        buf.put_u32(self.session_id);
        buf.put_u8(self.flags);
        buf.put_u64(self.method_meta);
        if let Some(checksum) = self.checksum {
            buf.put_u32(checksum);
        }
    }

    /// Decode the header from a frame body (everything after `totalSize`).
    ///
    /// Returns the header and the offset at which the payload begins.
    ///
    /// # Example
    ///
    /// ```
    /// use rpcmux::protocol::Header;
    ///
    /// let body = [0, 0, 0, 42, 0x01, 0, 0, 0, 0, 0, 0, 0, 7];
    /// let (header, offset) = Header::decode(&body).unwrap();
    /// assert_eq!(header.session_id, 42);
    /// assert_eq!(header.method_meta, 7);
    /// assert_eq!(offset, 13);
    /// ```
    pub fn decode(body: &[u8]) -> Result<(Self, usize)> {
        if body.len() < FIXED_FIELDS_LEN {
            return Err(RpcError::Protocol(format!(
                "Frame body of {} bytes is shorter than the {} byte header",
                body.len(),
                FIXED_FIELDS_LEN
            )));
        }

        let mut cursor = body;
        let session_id = cursor.get_u32();
        let flags = cursor.get_u8();
        let method_meta = cursor.get_u64();

        let checksum = if flags::has_flag(flags, flags::CHECKSUM) {
            if cursor.remaining() < CHECKSUM_LEN {
                return Err(RpcError::Protocol(
                    "Checksum flag set but checksum field is truncated".to_string(),
                ));
            }
            Some(cursor.get_u32())
        } else {
            None
        };

        let header = Self {
            session_id,
            flags,
            method_meta,
            checksum,
        };
        let offset = header.fields_len();
        Ok((header, offset))
    }

    /// Peek the session id of a frame body, if it is long enough to carry one.
    #[inline]
    pub fn peek_session_id(body: &[u8]) -> Option<u32> {
        body.get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_be_bytes)
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks that the reserved flag bits are 0. The compression id is
    /// checked by the codec, which knows which algorithms are available.
    pub fn validate(&self) -> Result<()> {
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(RpcError::Protocol(format!(
                "Reserved flag bits must be 0 (flags = {:#04x})",
                self.flags
            )));
        }
        Ok(())
    }

    /// Check if the checksum field is present.
    #[inline]
    pub fn has_checksum(&self) -> bool {
        flags::has_flag(self.flags, flags::CHECKSUM)
    }

    /// Raw compression algorithm id.
    #[inline]
    pub fn compression_id(&self) -> u8 {
        flags::compression_id(self.flags)
    }

    /// Check if this frame carries no session.
    #[inline]
    pub fn is_sessionless(&self) -> bool {
        self.session_id == NO_SESSION
    }
}
