//! Error types for rpcmux.
//!
//! Every call registered with the client resolves exactly once, either with
//! a response payload or with one of these errors. Per-call errors reach a
//! single waiter; connection-scoped errors (`ConnectionLost`, `ClientClosing`)
//! are fanned out to every outstanding waiter, which is why `RpcError` is `Clone`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Main error type for all rpcmux operations.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Checksum carried by the frame does not match its payload.
    #[error("Integrity error: checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    Integrity { expected: u32, actual: u32 },

    /// Compression algorithm id is unknown or not implemented.
    #[error("Unsupported compression algorithm: {0}")]
    UnsupportedCompression(u8),

    /// Session id is already registered (allocator or lifecycle bug).
    #[error("Duplicate session id: {0}")]
    DuplicateSession(u32),

    /// Every session id in the configured space is outstanding.
    #[error("Session id space exhausted")]
    SessionSpaceExhausted,

    /// Transport failed while the call was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    /// Transport could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Call was cancelled by the caller.
    #[error("Call cancelled")]
    Cancelled,

    /// Client is shutting down.
    #[error("Client closing")]
    ClientClosing,

    /// No response arrived before the call deadline.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// Write queue is full.
    #[error("Write queue full")]
    Backpressure,

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Malformed frame or header.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Compression codec failed to process a payload.
    #[error("Compression error: {0}")]
    Compression(String),

    /// MsgPack serialization/deserialization error.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Request or response filter rejected a message.
    #[error("Filter error: {0}")]
    Filter(String),

    /// Latency histogram could not be created.
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl RpcError {
    /// Whether this error ends the connection rather than a single call.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectionLost | RpcError::ClientClosing | RpcError::Connection(_)
        )
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(Arc::new(e))
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}

impl From<prometheus::Error> for RpcError {
    fn from(e: prometheus::Error) -> Self {
        RpcError::Metrics(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}

/// A decode failure confined to one frame.
///
/// The frame was delimited correctly, so the stream stays in sync and only
/// the call tagged with `session_id` is affected.
#[derive(Debug, Clone, Error)]
#[error("session {session_id}: {error}")]
pub struct FrameError {
    pub session_id: u32,
    #[source]
    pub error: RpcError,
}

impl FrameError {
    pub fn new(session_id: u32, error: RpcError) -> Self {
        Self { session_id, error }
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
