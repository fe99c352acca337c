//! Frame codec: the transform between `RpcRequest`/`Frame` and wire bytes.
//!
//! Encoding compresses the payload (if configured), checksums the payload
//! as transmitted, and prepends the header. Decoding is split in two
//! stages. `FrameBuffer` delimits frames across partial reads, and each
//! delimited body is then verified and decompressed lazily as the caller
//! pulls it from `DecodedFrames`.
//!
//! # Example
//!
//! ```
//! use rpcmux::protocol::{CompressionFlags, FrameCodec, RpcRequest};
//!
//! let codec = FrameCodec::new(CompressionFlags::Zstd, true);
//! let bytes = codec.encode(&RpcRequest::new(1, 42, &b"ping"[..])).unwrap();
//!
//! let mut decoder = codec.decoder();
//! let frames: Vec<_> = decoder.push(&bytes).unwrap().collect();
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].as_ref().unwrap().payload(), b"ping");
//! ```

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use super::compression::{self, CompressionFlags};
use super::frame::{Frame, RpcRequest};
use super::frame_buffer::FrameBuffer;
use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, NO_SESSION, SIZE_FIELD_LEN};
use crate::error::{FrameError, Result, RpcError};

/// Stateless encoder configuration, and factory for decoders.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    compression: CompressionFlags,
    checksum: bool,
    max_payload_size: u32,
}

impl FrameCodec {
    pub fn new(compression: CompressionFlags, checksum: bool) -> Self {
        Self {
            compression,
            checksum,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload(mut self, max_payload_size: u32) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn compression(&self) -> CompressionFlags {
        self.compression
    }

    pub fn checksum(&self) -> bool {
        self.checksum
    }

    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    /// Encode a request into one contiguous frame.
    pub fn encode(&self, request: &RpcRequest) -> Result<Bytes> {
        self.encode_parts(request.session_id, request.method_meta, request.body.clone())
    }

    /// Encode a frame from its parts. Used for both directions.
    pub fn encode_parts(&self, session_id: u32, method_meta: u64, body: Bytes) -> Result<Bytes> {
        let limit = self.max_payload_size as usize;
        if body.len() > limit {
            return Err(RpcError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                body.len(),
                limit
            )));
        }

        let payload = compression::compress(self.compression, body)?;
        if payload.len() > limit {
            return Err(RpcError::Protocol(format!(
                "Compressed payload size {} exceeds maximum {}",
                payload.len(),
                limit
            )));
        }

        let checksum = self.checksum.then(|| crc32fast::hash(&payload));
        let header = Header::new(session_id, self.compression.id(), method_meta, checksum);

        let mut buf =
            BytesMut::with_capacity(SIZE_FIELD_LEN + header.total_size(payload.len()));
        header.encode_into(&mut buf, payload.len());
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Create a resumable decoder sharing this codec's payload limit.
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.max_payload_size)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(CompressionFlags::Disabled, true)
    }
}

/// Resumable decoder for one connection's inbound byte stream.
///
/// Not restartable: once bytes are pushed, the stream position only moves forward.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: FrameBuffer,
    max_payload_size: u32,
}

impl FrameDecoder {
    pub fn new(max_payload_size: u32) -> Self {
        Self {
            buffer: FrameBuffer::with_max_payload(max_payload_size),
            max_payload_size,
        }
    }

    /// Push transport bytes and return the frames completed by them.
    ///
    /// # Errors
    ///
    /// Returns a connection-fatal `Protocol` error if the stream can no
    /// longer be delimited. Faults confined to one frame are yielded by
    /// the iterator instead.
    pub fn push(&mut self, data: &[u8]) -> Result<DecodedFrames> {
        let bodies = self.buffer.push(data)?;
        Ok(DecodedFrames {
            bodies: bodies.into(),
            max_payload_size: self.max_payload_size,
        })
    }

    /// Whether no partial frame is buffered.
    pub fn is_at_frame_boundary(&self) -> bool {
        self.buffer.is_at_frame_boundary()
    }
}

/// Lazily decoded frames produced by one `FrameDecoder::push`.
///
/// Verification and decompression run as each item is pulled.
#[derive(Debug)]
pub struct DecodedFrames {
    bodies: VecDeque<Bytes>,
    max_payload_size: u32,
}

impl DecodedFrames {
    /// Number of frames not yet pulled.
    pub fn remaining(&self) -> usize {
        self.bodies.len()
    }
}

impl Iterator for DecodedFrames {
    type Item = std::result::Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        let body = self.bodies.pop_front()?;
        Some(decode_body(body, self.max_payload_size as usize))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.bodies.len(), Some(self.bodies.len()))
    }
}

impl ExactSizeIterator for DecodedFrames {}

/// Decode one delimited frame body (everything after `totalSize`).
fn decode_body(body: Bytes, limit: usize) -> std::result::Result<Frame, FrameError> {
    let session_id = Header::peek_session_id(&body).unwrap_or(NO_SESSION);
    let fail = |error: RpcError| FrameError::new(session_id, error);

    let (header, offset) = Header::decode(&body).map_err(fail)?;
    header.validate().map_err(fail)?;

    let payload = body.slice(offset..);

    if let Some(expected) = header.checksum {
        let actual = crc32fast::hash(&payload);
        if actual != expected {
            return Err(fail(RpcError::Integrity { expected, actual }));
        }
    }

    let payload = compression::decompress(header.compression_id(), payload, limit).map_err(fail)?;
    Ok(Frame::new(header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{flags, CHECKSUM_LEN, FIXED_FIELDS_LEN};

    // Offset of the checksum field within an encoded frame.
    const CHECKSUM_OFFSET: usize = SIZE_FIELD_LEN + FIXED_FIELDS_LEN;

    const ALL_MODES: [CompressionFlags; 3] = [
        CompressionFlags::None,
        CompressionFlags::Disabled,
        CompressionFlags::Zstd,
    ];

    fn decode_all(codec: &FrameCodec, bytes: &[u8]) -> Vec<std::result::Result<Frame, FrameError>> {
        codec.decoder().push(bytes).unwrap().collect()
    }

    #[test]
    fn test_every_flag_combination_survives_transit() {
        let body = Bytes::from(b"payload ".repeat(64));
        for compression in ALL_MODES {
            for checksum in [false, true] {
                let codec = FrameCodec::new(compression, checksum);
                let bytes = codec.encode(&RpcRequest::new(77, 0xFEED, body.clone())).unwrap();

                let frames = decode_all(&codec, &bytes);
                assert_eq!(frames.len(), 1);
                let frame = frames[0].as_ref().unwrap();

                assert_eq!(frame.session_id(), 77);
                assert_eq!(frame.method_meta(), 0xFEED);
                assert_eq!(frame.payload, body);
                assert_eq!(flags::compression_id(frame.flags()), compression.id());
                assert_eq!(frame.header.has_checksum(), checksum);
            }
        }
    }

    #[test]
    fn test_total_size_matches_encoded_length() {
        let codec = FrameCodec::new(CompressionFlags::Disabled, true);
        let bytes = codec.encode(&RpcRequest::new(1, 1, &b"abc"[..])).unwrap();

        let total = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(total, bytes.len() - SIZE_FIELD_LEN);
        assert_eq!(total, 13 + CHECKSUM_LEN + 3);
    }

    #[test]
    fn test_split_at_every_byte_boundary() {
        let codec = FrameCodec::new(CompressionFlags::Zstd, true);
        let bytes = codec
            .encode(&RpcRequest::new(5, 9, Bytes::from(b"split me".repeat(10))))
            .unwrap();
        let whole = decode_all(&codec, &bytes);

        for split in 0..=bytes.len() {
            let mut decoder = codec.decoder();
            let mut frames: Vec<_> = decoder.push(&bytes[..split]).unwrap().collect();
            frames.extend(decoder.push(&bytes[split..]).unwrap());

            assert_eq!(frames.len(), 1, "split at {split}");
            assert_eq!(
                frames[0].as_ref().unwrap(),
                whole[0].as_ref().unwrap(),
                "split at {split}"
            );
            assert!(decoder.is_at_frame_boundary());
        }
    }

    #[test]
    fn test_any_payload_bit_flip_is_an_integrity_error() {
        let codec = FrameCodec::new(CompressionFlags::Disabled, true);
        let bytes = codec.encode(&RpcRequest::new(3, 1, &b"guarded"[..])).unwrap();
        let payload_start = CHECKSUM_OFFSET + CHECKSUM_LEN;

        for index in payload_start..bytes.len() {
            for bit in 0..8 {
                let mut tampered = bytes.to_vec();
                tampered[index] ^= 1 << bit;

                let frames = decode_all(&codec, &tampered);
                let err = frames[0].as_ref().unwrap_err();
                assert_eq!(err.session_id, 3);
                assert!(matches!(err.error, RpcError::Integrity { .. }));
            }
        }
    }

    #[test]
    fn test_compressed_bit_flip_is_caught_before_decompression() {
        let codec = FrameCodec::new(CompressionFlags::Zstd, true);
        let mut bytes = codec
            .encode(&RpcRequest::new(4, 1, Bytes::from(vec![7u8; 512])))
            .unwrap()
            .to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let frames = decode_all(&codec, &bytes);
        assert!(matches!(
            frames[0].as_ref().unwrap_err().error,
            RpcError::Integrity { .. }
        ));
    }

    #[test]
    fn test_unknown_compression_id_fails_only_that_frame() {
        let codec = FrameCodec::new(CompressionFlags::Disabled, false);
        let mut bad = codec.encode(&RpcRequest::new(8, 1, &b"x"[..])).unwrap().to_vec();
        bad[SIZE_FIELD_LEN + 4] = 0x07;
        let good = codec.encode(&RpcRequest::new(9, 1, &b"y"[..])).unwrap();

        let mut stream = bad;
        stream.extend_from_slice(&good);
        let frames = decode_all(&codec, &stream);

        assert_eq!(frames.len(), 2);
        let err = frames[0].as_ref().unwrap_err();
        assert_eq!(err.session_id, 8);
        assert!(matches!(err.error, RpcError::UnsupportedCompression(7)));
        assert_eq!(frames[1].as_ref().unwrap().payload(), b"y");
    }

    #[test]
    fn test_lz4_frame_is_rejected() {
        let codec = FrameCodec::new(CompressionFlags::Disabled, false);
        let mut bytes = codec.encode(&RpcRequest::new(2, 1, &b"z"[..])).unwrap().to_vec();
        bytes[SIZE_FIELD_LEN + 4] = flags::compression::LZ4;

        let frames = decode_all(&codec, &bytes);
        assert!(matches!(
            frames[0].as_ref().unwrap_err().error,
            RpcError::UnsupportedCompression(3)
        ));
    }

    #[test]
    fn test_reserved_bits_fail_the_frame() {
        let codec = FrameCodec::new(CompressionFlags::Disabled, false);
        let mut bytes = codec.encode(&RpcRequest::new(2, 1, &b"z"[..])).unwrap().to_vec();
        bytes[SIZE_FIELD_LEN + 4] |= 0x80;

        let frames = decode_all(&codec, &bytes);
        assert!(matches!(
            frames[0].as_ref().unwrap_err().error,
            RpcError::Protocol(_)
        ));
    }

    #[test]
    fn test_encoding_lz4_is_refused() {
        let codec = FrameCodec::new(CompressionFlags::Lz4, false);
        let err = codec.encode(&RpcRequest::new(1, 1, &b"a"[..])).unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedCompression(3)));
    }

    #[test]
    fn test_oversize_body_is_refused() {
        let codec = FrameCodec::new(CompressionFlags::Disabled, false).with_max_payload(4);
        let err = codec.encode(&RpcRequest::new(1, 1, &b"12345"[..])).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_decompression_bomb_is_refused() {
        let sender = FrameCodec::new(CompressionFlags::Zstd, false);
        let bytes = sender
            .encode(&RpcRequest::new(6, 1, Bytes::from(vec![0u8; 10_000])))
            .unwrap();

        let receiver = FrameCodec::new(CompressionFlags::Disabled, false).with_max_payload(1_000);
        let frames = decode_all(&receiver, &bytes);
        let err = frames[0].as_ref().unwrap_err();
        assert_eq!(err.session_id, 6);
        assert!(matches!(err.error, RpcError::Compression(_)));
    }

    #[test]
    fn test_decoded_frames_is_lazy_and_ordered() {
        let codec = FrameCodec::default();
        let mut stream = Vec::new();
        for id in 1..=3u32 {
            stream.extend_from_slice(&codec.encode(&RpcRequest::new(id, 0, Bytes::new())).unwrap());
        }

        let mut frames = codec.decoder().push(&stream).unwrap();
        assert_eq!(frames.remaining(), 3);
        assert_eq!(frames.next().unwrap().unwrap().session_id(), 1);
        assert_eq!(frames.len(), 2);
        let rest: Vec<u32> = frames.map(|f| f.unwrap().session_id()).collect();
        assert_eq!(rest, vec![2, 3]);
    }

    #[test]
    fn test_bad_size_is_fatal() {
        let mut decoder = FrameCodec::default().decoder();
        assert!(decoder.push(&[0, 0, 0, 1]).is_err());
    }
}
