//! TCP transport.
//!
//! # Example
//!
//! ```ignore
//! use rpcmux::transport::connect;
//! use std::time::Duration;
//!
//! let stream = connect("127.0.0.1", 7000, Duration::from_secs(5)).await?;
//! ```

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{Result, RpcError};

/// Open a TCP connection to `host:port`.
///
/// Nagle's algorithm is disabled, since frames are already batched by the
/// writer task. Failures, including running past `timeout`, are reported
/// as `RpcError::Connection`.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    debug!("Connecting to {}", addr);

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(RpcError::Connection(format!(
                "Failed to connect to {addr}: {e}"
            )))
        }
        Err(_) => {
            return Err(RpcError::Connection(format!(
                "Timed out connecting to {addr} after {timeout:?}"
            )))
        }
    };

    stream
        .set_nodelay(true)
        .map_err(|e| RpcError::Connection(format!("Failed to configure {addr}: {e}")))?;

    info!("Connected to {}", addr);
    Ok(stream)
}
