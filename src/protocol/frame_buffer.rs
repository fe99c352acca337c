//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for delimiting frames:
//! - `WaitingForSize`: Need the 4-byte `totalSize` field
//! - `WaitingForBody`: Size parsed, need N more body bytes
//!
//! The buffer only delimits. It yields each frame body (every byte after
//! `totalSize`) untouched; header parsing, checksum verification and
//! decompression happen in the codec.
//!
//! # Example
//!
//! ```
//! use rpcmux::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from the socket
//! let bodies = buffer.push(&[0, 0, 0, 13]).unwrap();
//! assert!(bodies.is_empty());
//! let bodies = buffer.push(&[0u8; 13]).unwrap();
//! assert_eq!(bodies.len(), 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{CHECKSUM_LEN, DEFAULT_MAX_PAYLOAD_SIZE, FIXED_FIELDS_LEN, SIZE_FIELD_LEN};
use crate::error::{Result, RpcError};

/// State machine for frame delimiting.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the complete size field (need 4 bytes).
    WaitingForSize,
    /// Size parsed, waiting for the rest of the frame.
    WaitingForBody { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frame bodies.
///
/// An implausible `totalSize` (below the fixed header, or above the size
/// permitted by `max_payload_size`) leaves the stream unrecoverable, so it
/// is reported as a fatal `Protocol` error.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size, as transmitted.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 64MB.
    pub fn new() -> Self {
        Self::with_capacity_and_max_payload(64 * 1024, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self::with_capacity_and_max_payload(64 * 1024, max_payload_size)
    }

    /// Create a new frame buffer with custom capacity and max payload.
    pub fn with_capacity_and_max_payload(capacity: usize, max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForSize,
            max_payload_size,
        }
    }

    /// Largest acceptable `totalSize`.
    #[inline]
    fn max_total_size(&self) -> usize {
        FIXED_FIELDS_LEN + CHECKSUM_LEN + self.max_payload_size as usize
    }

    /// Push data into the buffer and extract all complete frame bodies.
    ///
    /// If data is fragmented, partial data is buffered internally for the
    /// next push. Bodies are returned in stream order.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if a `totalSize` field is out of range.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut bodies = Vec::new();
        while let Some(body) = self.try_extract_one()? {
            bodies.push(body);
        }

        Ok(bodies)
    }

    /// Try to extract a single frame body from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(body))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if protocol violation (size out of range)
    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForSize => {
                    if self.buffer.len() < SIZE_FIELD_LEN {
                        return Ok(None);
                    }

                    let size_field = self.buffer.split_to(SIZE_FIELD_LEN);
                    let total_size = u32::from_be_bytes([
                        size_field[0],
                        size_field[1],
                        size_field[2],
                        size_field[3],
                    ]) as usize;

                    if total_size < FIXED_FIELDS_LEN {
                        return Err(RpcError::Protocol(format!(
                            "Frame size {} is below the minimum {}",
                            total_size, FIXED_FIELDS_LEN
                        )));
                    }
                    if total_size > self.max_total_size() {
                        return Err(RpcError::Protocol(format!(
                            "Frame size {} exceeds maximum {}",
                            total_size,
                            self.max_total_size()
                        )));
                    }

                    self.state = State::WaitingForBody {
                        remaining: total_size,
                    };
                }

                State::WaitingForBody { remaining } => {
                    if self.buffer.len() < remaining {
                        self.buffer.reserve(remaining - self.buffer.len());
                        return Ok(None);
                    }

                    let body = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForSize;
                    return Ok(Some(body));
                }
            }
        }
    }

    /// Get the number of buffered bytes not yet returned.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether the buffer sits between two frames.
    pub fn is_at_frame_boundary(&self) -> bool {
        matches!(self.state, State::WaitingForSize) && self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForSize;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForSize => "WaitingForSize",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Header;

    /// Helper to create a valid, uncompressed frame as bytes.
    fn make_frame_bytes(session_id: u32, method_meta: u64, payload: &[u8]) -> Vec<u8> {
        let header = Header::new(session_id, 0, method_meta, None);
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf, payload.len());
        buf.extend_from_slice(payload);
        buf.to_vec()
    }

    fn session_of(body: &Bytes) -> u32 {
        Header::peek_session_id(body).unwrap()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(42, 1, b"hello");

        let bodies = buffer.push(&frame_bytes).unwrap();

        assert_eq!(bodies.len(), 1);
        assert_eq!(session_of(&bodies[0]), 42);
        assert_eq!(&bodies[0][FIXED_FIELDS_LEN..], b"hello");
        assert!(buffer.is_at_frame_boundary());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = Vec::new();
        combined.extend_from_slice(&make_frame_bytes(1, 0, b"first"));
        combined.extend_from_slice(&make_frame_bytes(2, 0, b"second"));
        combined.extend_from_slice(&make_frame_bytes(3, 0, b"third"));

        let bodies = buffer.push(&combined).unwrap();

        assert_eq!(bodies.len(), 3);
        assert_eq!(session_of(&bodies[0]), 1);
        assert_eq!(session_of(&bodies[1]), 2);
        assert_eq!(session_of(&bodies[2]), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_size_field() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(42, 1, b"test");

        let bodies = buffer.push(&frame_bytes[..2]).unwrap();
        assert!(bodies.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForSize");

        let bodies = buffer.push(&frame_bytes[2..]).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(session_of(&bodies[0]), 42);
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let payload = b"this is a longer payload that will be fragmented";
        let frame_bytes = make_frame_bytes(42, 1, payload);

        let partial_len = SIZE_FIELD_LEN + 10;
        let bodies = buffer.push(&frame_bytes[..partial_len]).unwrap();
        assert!(bodies.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForBody");

        let bodies = buffer.push(&frame_bytes[partial_len..]).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(&bodies[0][FIXED_FIELDS_LEN..], payload);
    }

    #[test]
    fn test_empty_payload() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(42, 1, b"");

        let bodies = buffer.push(&frame_bytes).unwrap();

        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].len(), FIXED_FIELDS_LEN);
    }

    #[test]
    fn test_size_below_minimum_is_fatal() {
        let mut buffer = FrameBuffer::new();
        let result = buffer.push(&[0, 0, 0, 12]);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("below the minimum"));
    }

    #[test]
    fn test_size_above_maximum_is_fatal() {
        let mut buffer = FrameBuffer::with_max_payload(100);

        // Exactly at the limit is accepted
        let at_limit = (FIXED_FIELDS_LEN + CHECKSUM_LEN + 100) as u32;
        assert!(buffer.push(&at_limit.to_be_bytes()).unwrap().is_empty());

        let mut buffer = FrameBuffer::with_max_payload(100);
        let result = buffer.push(&(at_limit + 1).to_be_bytes());

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let frame_bytes = make_frame_bytes(42, 1, b"test");

        buffer.push(&frame_bytes[..6]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForBody");
        assert!(!buffer.is_at_frame_boundary());

        buffer.clear();

        assert_eq!(buffer.state_name(), "WaitingForSize");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();

        let frame1 = make_frame_bytes(1, 0, b"first");
        let frame2 = make_frame_bytes(2, 0, b"second");

        let mut data = frame1.clone();
        data.extend_from_slice(&frame2[..5]);

        let bodies = buffer.push(&data).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(session_of(&bodies[0]), 1);
        assert_eq!(buffer.state_name(), "WaitingForBody");

        let bodies = buffer.push(&frame2[5..]).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(session_of(&bodies[0]), 2);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut stream = make_frame_bytes(1, 0, b"hi");
        stream.extend_from_slice(&make_frame_bytes(2, 0, b""));

        let mut all_bodies = Vec::new();
        for byte in &stream {
            all_bodies.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all_bodies.len(), 2);
        assert_eq!(session_of(&all_bodies[0]), 1);
        assert_eq!(&all_bodies[0][FIXED_FIELDS_LEN..], b"hi");
        assert_eq!(session_of(&all_bodies[1]), 2);
    }
}
