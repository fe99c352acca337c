//! Transport module - establishing the byte stream the client runs over.
//!
//! The client itself is generic over any `AsyncRead + AsyncWrite` stream;
//! this module only provides the TCP collaborator behind `ClientBuilder::connect`.

mod tcp;

pub use tcp::connect;
