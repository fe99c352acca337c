//! Codec module - serialization of call payloads.
//!
//! The frame layer treats payloads as opaque bytes. [`MsgPackCodec`] backs
//! the typed `Client::call` helper; raw callers use `Client::execute`.

mod msgpack;

pub use msgpack::MsgPackCodec;
