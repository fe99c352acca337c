//! # rpcmux
//!
//! Multiplexed RPC client over a single byte-stream connection.
//!
//! Every call is tagged with a session id. Responses may arrive in any
//! order; each one is routed back to the caller that owns its session.
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): length-prefixed binary frames with
//!   optional zstd compression and a CRC-32 checksum
//! - **Session ids** ([`SessionIdAllocator`]): wrapping allocation that
//!   never hands out an id that is still outstanding
//! - **Pending calls** ([`PendingCalls`]): one-shot completion slots keyed
//!   by session id
//! - **Dispatcher** ([`Dispatcher`]): routes decoded frames to their calls
//! - **Client** ([`Client`]): owns the connection, the writer task and the
//!   read loop
//!
//! ## Example
//!
//! ```ignore
//! use rpcmux::{Client, protocol::CompressionFlags};
//!
//! #[tokio::main]
//! async fn main() -> rpcmux::Result<()> {
//!     let client = Client::builder()
//!         .compression(CompressionFlags::Zstd)
//!         .connect("127.0.0.1", 7000)
//!         .await?;
//!
//!     let pong = client.execute(42, &b"ping"[..])?.await?;
//!     println!("{} bytes back", pong.len());
//!
//!     client.close().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod pending;
pub mod protocol;
pub mod session;
pub mod transport;

mod client;
mod writer;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use dispatcher::{DispatchStats, Dispatcher};
pub use error::{FrameError, Result, RpcError};
pub use metrics::{LatencyHistogram, LatencySummary};
pub use pending::{PendingCall, PendingCalls, ResponseFuture};
pub use session::SessionIdAllocator;
