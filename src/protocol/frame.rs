//! Frame struct and the request/response views built on top of it.
//!
//! A `Frame` is what the decoder yields: the header as received (flags
//! preserved) and the payload after checksum verification and decompression.
//!
//! # Example
//!
//! ```
//! use rpcmux::protocol::{Frame, Header, flags};
//! use bytes::Bytes;
//!
//! let header = Header::new(42, flags::compression::DISABLED, 7, None);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.session_id(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, NO_SESSION};

/// A complete, decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes, decompressed.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn session_id(&self) -> u32 {
        self.header.session_id
    }

    #[inline]
    pub fn method_meta(&self) -> u64 {
        self.header.method_meta
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Convert into the response view handed to incoming filters.
    pub fn into_response(self) -> RpcResponse {
        RpcResponse {
            session_id: self.header.session_id,
            method_meta: self.header.method_meta,
            body: self.payload,
        }
    }
}

/// One logical outbound call, before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub session_id: u32,
    /// Opaque method identifier supplied by the caller.
    pub method_meta: u64,
    /// Uncompressed request body.
    pub body: Bytes,
}

impl RpcRequest {
    pub fn new(session_id: u32, method_meta: u64, body: impl Into<Bytes>) -> Self {
        Self {
            session_id,
            method_meta,
            body: body.into(),
        }
    }

    /// A request that expects no response.
    pub fn oneway(method_meta: u64, body: impl Into<Bytes>) -> Self {
        Self::new(NO_SESSION, method_meta, body)
    }

    #[inline]
    pub fn is_oneway(&self) -> bool {
        self.session_id == NO_SESSION
    }
}

/// One logical inbound response, after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub session_id: u32,
    pub method_meta: u64,
    pub body: Bytes,
}
