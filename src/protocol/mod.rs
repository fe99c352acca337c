//! Protocol module - wire format, framing, compression and the frame codec.
//!
//! This module implements the binary protocol:
//! - Header encoding/decoding and the flags byte
//! - Frame buffer for accumulating partial reads
//! - Payload compression selected by flag value
//! - Codec tying the above into encode / resumable decode

mod codec;
mod compression;
mod frame;
mod frame_buffer;
mod wire_format;

pub use codec::{DecodedFrames, FrameCodec, FrameDecoder};
pub use compression::{CompressionFlags, Compressor, ZstdCompressor};
pub use frame::{Frame, RpcRequest, RpcResponse};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, Header, CHECKSUM_LEN, DEFAULT_MAX_PAYLOAD_SIZE, FIXED_FIELDS_LEN, MIN_FRAME_LEN,
    NO_SESSION, SIZE_FIELD_LEN,
};
