//! Ping - many concurrent calls over one connection.
//!
//! This example demonstrates:
//! - Starting a tiny in-process server that answers every frame
//! - Connecting a client with zstd compression and checksums
//! - Issuing concurrent calls from cloned client handles
//! - Raw `execute` alongside the typed MessagePack `call`
//!
//! # Running
//!
//! ```text
//! RUST_LOG=rpcmux=debug cargo run --example ping
//! ```

use bytes::Bytes;
use rpcmux::codec::MsgPackCodec;
use rpcmux::protocol::{CompressionFlags, Frame, FrameCodec};
use rpcmux::Client;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

const PING: u64 = 42;
const GREET: u64 = 43;

#[derive(Serialize, Deserialize, Debug)]
struct Greeting {
    name: String,
}

/// Answer PING with "pong" and GREET with a greeting.
fn respond(frame: &Frame) -> Option<Bytes> {
    match frame.method_meta() {
        PING => Some(Bytes::from_static(b"pong")),
        GREET => {
            let greeting: Greeting = MsgPackCodec::decode(frame.payload()).ok()?;
            MsgPackCodec::encode(&format!("hello, {}", greeting.name)).ok()
        }
        _ => None,
    }
}

async fn serve(mut socket: TcpStream, codec: FrameCodec) -> rpcmux::Result<()> {
    let mut decoder = codec.decoder();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for decoded in decoder.push(&buf[..n])? {
            let frame = decoded.map_err(|e| e.error)?;
            if let Some(body) = respond(&frame) {
                let reply = codec.encode_parts(frame.session_id(), frame.method_meta(), body)?;
                socket.write_all(&reply).await?;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let codec = FrameCodec::new(CompressionFlags::Zstd, true);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket, codec));
        }
    });

    let client = Client::builder()
        .compression(CompressionFlags::Zstd)
        .checksum(true)
        .connect("127.0.0.1", port)
        .await?;

    // Fire a batch of pings from separate tasks
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.execute(PING, &b"ping"[..])?.await })
        })
        .collect();
    for task in tasks {
        let pong = task.await??;
        assert_eq!(&pong[..], b"pong");
    }

    let greeting: String = client
        .call(
            GREET,
            &Greeting {
                name: "rpcmux".to_string(),
            },
        )
        .await?;
    println!("{greeting}");
    println!("{:?}", client.stats());

    client.close().await?;
    Ok(())
}
