//! Client builder and I/O loop.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the client.
//! The [`Client`] owns one connection:
//! 1. Split the transport; the write half goes to the writer task
//! 2. Run the I/O loop: read, decode, dispatch, expire overdue calls
//! 3. Accept `execute` calls from any task and hand back a `ResponseFuture`
//! 4. On `close()` or transport failure, fail every outstanding call
//!
//! # Example
//!
//! ```ignore
//! use rpcmux::{Client, protocol::CompressionFlags};
//!
//! #[tokio::main]
//! async fn main() -> rpcmux::Result<()> {
//!     let client = Client::builder()
//!         .compression(CompressionFlags::Zstd)
//!         .checksum(true)
//!         .connect("127.0.0.1", 7000)
//!         .await?;
//!
//!     let pong = client.execute(42, &b"ping"[..])?.await?;
//!     assert_eq!(&pong[..], b"pong");
//!
//!     client.close().await
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::codec::MsgPackCodec;
use crate::config::ClientConfig;
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{FrameError, Result, RpcError};
use crate::filter::{IncomingFilters, OutgoingFilters};
use crate::metrics::LatencyHistogram;
use crate::pending::{PendingCall, PendingCalls, ResponseFuture};
use crate::protocol::{
    CompressionFlags, DecodedFrames, FrameCodec, FrameDecoder, RpcRequest, RpcResponse,
};
use crate::session::SessionIdAllocator;
use crate::transport;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Builder for configuring and creating a client.
pub struct ClientBuilder {
    config: ClientConfig,
    outgoing: OutgoingFilters,
    incoming: IncomingFilters,
}

impl ClientBuilder {
    /// Create a new client builder with default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a builder from a complete configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            outgoing: OutgoingFilters::new(),
            incoming: IncomingFilters::new(),
        }
    }

    /// Compression applied to outbound payloads.
    ///
    /// Default: `Disabled`
    pub fn compression(mut self, compression: CompressionFlags) -> Self {
        self.config.compression = compression;
        self
    }

    /// Whether outbound frames carry a checksum.
    ///
    /// Default: true
    pub fn checksum(mut self, enabled: bool) -> Self {
        self.config.checksum = enabled;
        self
    }

    /// Default per-call timeout. `None` disables it.
    ///
    /// Default: 60 seconds
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// How often overdue calls are expired.
    ///
    /// Default: 50ms
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Size of the session id space.
    ///
    /// Default: `u32::MAX`
    pub fn max_sessions(mut self, max: u32) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Maximum payload size, on the wire and after decompression.
    ///
    /// Default: 64MB
    pub fn max_payload_size(mut self, max: u32) -> Self {
        self.config.max_payload_size = max;
        self
    }

    /// Bound of the write queue. A full queue fails submissions with
    /// `Backpressure`.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.max_pending_frames = limit;
        self
    }

    /// Tear the connection down after a corrupt frame.
    ///
    /// Default: false
    pub fn teardown_on_corrupt_frame(mut self, enabled: bool) -> Self {
        self.config.teardown_on_corrupt_frame = enabled;
        self
    }

    /// Size of each transport read.
    ///
    /// Default: 64KB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Time allowed for `connect`.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Record the latency of every successful call, readable through
    /// `Client::stats`.
    ///
    /// Default: false
    pub fn latency_histogram(mut self, enabled: bool) -> Self {
        self.config.latency_histogram = enabled;
        self
    }

    /// Append a filter run on every request before it is encoded.
    ///
    /// The filter may rewrite anything but the session id.
    pub fn outgoing_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(RpcRequest) -> Result<RpcRequest> + Send + Sync + 'static,
    {
        self.outgoing.push(filter);
        self
    }

    /// Append a filter run on every response before it completes its call.
    pub fn incoming_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(RpcResponse) -> Result<RpcResponse> + Send + Sync + 'static,
    {
        self.incoming.push(filter);
        self
    }

    /// Connect over TCP and start the client.
    pub async fn connect(self, host: &str, port: u16) -> Result<Client> {
        let stream = transport::connect(host, port, self.config.connect_timeout).await?;
        Ok(self.start(stream))
    }

    /// Start the client over an established stream.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start<S>(self, stream: S) -> Client
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Client::start(self.config, self.outgoing, self.incoming, stream)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    dispatcher: Dispatcher,
    allocator: SessionIdAllocator,
    codec: FrameCodec,
    writer: WriterHandle,
    outgoing: OutgoingFilters,
    request_timeout: Option<Duration>,
    closing: AtomicBool,
    shutdown: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// A running client bound to one connection.
///
/// Cheap to clone; clones share the connection. Dropping every clone
/// shuts the connection down.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

/// Settings the I/O loop needs.
struct IoSettings {
    read_buffer_size: usize,
    sweep_interval: Duration,
    teardown_on_corrupt_frame: bool,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn start<S>(
        config: ClientConfig,
        outgoing: OutgoingFilters,
        incoming: IncomingFilters,
        stream: S,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = config.codec();
        let (reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer_config());

        let calls = match config.latency_histogram.then(LatencyHistogram::new) {
            Some(Ok(histogram)) => PendingCalls::with_latency(histogram),
            Some(Err(e)) => {
                warn!("Latency histogram unavailable: {}", e);
                PendingCalls::new()
            }
            None => PendingCalls::new(),
        };
        let calls = Arc::new(calls);
        let dispatcher = Dispatcher::with_filters(calls, incoming);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let settings = IoSettings {
            read_buffer_size: config.read_buffer_size.max(1),
            sweep_interval: config.sweep_interval.max(Duration::from_millis(1)),
            teardown_on_corrupt_frame: config.teardown_on_corrupt_frame,
        };

        tokio::spawn(io_loop(
            reader,
            codec.decoder(),
            dispatcher.clone(),
            writer_task,
            shutdown_rx,
            done_tx,
            settings,
        ));

        Client {
            shared: Arc::new(Shared {
                dispatcher,
                allocator: SessionIdAllocator::with_max_sessions(config.max_sessions),
                codec,
                writer,
                outgoing,
                request_timeout: config.request_timeout,
                closing: AtomicBool::new(false),
                shutdown: shutdown_tx,
                done: done_rx,
            }),
        }
    }

    /// Submit a call with the default timeout.
    ///
    /// Returns as soon as the frame is queued. The session is registered
    /// before the frame reaches the writer, so the response can never
    /// arrive ahead of its entry.
    pub fn execute(&self, method_meta: u64, body: impl Into<Bytes>) -> Result<ResponseFuture> {
        self.execute_with_timeout(method_meta, body, self.shared.request_timeout)
    }

    /// Submit a call with an explicit timeout (`None` waits indefinitely).
    pub fn execute_with_timeout(
        &self,
        method_meta: u64,
        body: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<ResponseFuture> {
        let shared = &self.shared;
        if shared.closing.load(Ordering::Acquire) {
            return Err(RpcError::ClientClosing);
        }

        let (call, rx) = PendingCall::new(method_meta, timeout);
        let session_id = shared.dispatcher.assign_next(&shared.allocator, call)?;

        let request = RpcRequest::new(session_id, method_meta, body);
        if let Err(e) = self.send_request(request) {
            shared.dispatcher.calls().remove(session_id);
            return Err(e);
        }

        Ok(ResponseFuture::new(
            session_id,
            rx,
            shared.dispatcher.calls().clone(),
        ))
    }

    /// Send a request that expects no response.
    pub fn send_oneway(&self, method_meta: u64, body: impl Into<Bytes>) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(RpcError::ClientClosing);
        }
        if let Some(err) = self.shared.dispatcher.calls().closed_error() {
            return Err(err);
        }
        self.send_request(RpcRequest::oneway(method_meta, body))
    }

    /// Filter, encode and queue one request.
    fn send_request(&self, request: RpcRequest) -> Result<()> {
        let shared = &self.shared;
        let session_id = request.session_id;
        let request = shared.outgoing.apply(request)?;
        if request.session_id != session_id {
            return Err(RpcError::Filter(format!(
                "Outgoing filter changed session id {} to {}",
                session_id, request.session_id
            )));
        }
        let bytes = shared.codec.encode(&request)?;
        shared
            .writer
            .try_send(OutboundFrame::new(request.session_id, bytes))
    }

    /// Serialize `value` with MessagePack, call `method_meta`, and
    /// deserialize the response.
    pub async fn call<T, R>(&self, method_meta: u64, value: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = MsgPackCodec::encode(value)?;
        let response = self.execute(method_meta, payload)?.await?;
        MsgPackCodec::decode(&response)
    }

    /// Resolve an outstanding call with `Cancelled`.
    ///
    /// The request frame cannot be recalled; its response is dropped as unknown.
    pub fn cancel(&self, session_id: u32) -> bool {
        self.shared.dispatcher.cancel(session_id)
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.dispatcher.calls().len()
    }

    /// Number of frames queued for the writer.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }

    /// Whether the write queue is full.
    pub fn is_backpressure_active(&self) -> bool {
        self.shared.writer.is_backpressure_active()
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.dispatcher.stats()
    }

    /// The latency histogram, for registration with a metrics registry.
    /// `None` unless enabled with `ClientBuilder::latency_histogram`.
    pub fn latency_histogram(&self) -> Option<prometheus::Histogram> {
        self.shared
            .dispatcher
            .calls()
            .latency()
            .map(|latency| latency.histogram().clone())
    }

    /// Whether the connection has stopped, by `close()` or transport failure.
    pub fn is_closed(&self) -> bool {
        *self.shared.done.borrow()
    }

    /// Wait until the connection has stopped.
    pub async fn closed(&self) {
        let mut done = self.shared.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Shut the client down.
    ///
    /// Stops accepting calls, fails every outstanding call with
    /// `ClientClosing`, and returns once the transport is released.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if !shared.closing.swap(true, Ordering::AcqRel) {
            info!("Closing client");
            shared.dispatcher.fail_all(RpcError::ClientClosing);
            let _ = shared.shutdown.send(true);
        }
        self.closed().await;
        Ok(())
    }
}

/// Owns the read half: decodes, dispatches and sweeps until the
/// connection ends, then fails whatever is still outstanding.
async fn io_loop<R>(
    mut reader: R,
    mut decoder: FrameDecoder,
    dispatcher: Dispatcher,
    mut writer_task: JoinHandle<Result<()>>,
    mut shutdown: watch::Receiver<bool>,
    done: watch::Sender<bool>,
    settings: IoSettings,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; settings.read_buffer_size];
    let mut sweep = tokio::time::interval(settings.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        debug!("Transport closed by peer");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        error!("Transport read failed: {}", e);
                        break;
                    }
                };

                match decoder.push(&buf[..n]) {
                    Ok(frames) => {
                        if dispatch_frames(&dispatcher, frames, settings.teardown_on_corrupt_frame) {
                            warn!("Tearing down connection after corrupt frame");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Unrecoverable framing error: {}", e);
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                dispatcher.expire_overdue(Instant::now());
            }
            result = &mut writer_task => {
                match result {
                    Ok(Ok(())) => debug!("Writer task finished"),
                    Ok(Err(_)) => {}
                    Err(e) => error!("Writer task failed: {}", e),
                }
                break;
            }
            _ = shutdown.changed() => break,
        }
    }

    // After close() the table is already drained and closed with ClientClosing.
    dispatcher.connection_lost();
    writer_task.abort();
    drop(reader);

    info!("Connection closed");
    let _ = done.send(true);
}

/// Dispatch every frame. Returns `true` if the connection must be torn down.
fn dispatch_frames(
    dispatcher: &Dispatcher,
    frames: DecodedFrames,
    teardown_on_corrupt: bool,
) -> bool {
    for decoded in frames {
        let corrupt = matches!(
            &decoded,
            Err(FrameError {
                error: RpcError::Integrity { .. } | RpcError::UnsupportedCompression(_),
                ..
            })
        );
        dispatcher.dispatch(decoded);
        if corrupt && teardown_on_corrupt {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_builder_default() {
        let builder = ClientBuilder::default();
        assert_eq!(builder.config, ClientConfig::default());
        assert!(builder.outgoing.is_empty());
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder()
            .compression(CompressionFlags::Zstd)
            .checksum(false)
            .request_timeout(None)
            .sweep_interval(Duration::from_millis(5))
            .max_sessions(16)
            .max_payload_size(4096)
            .max_pending_frames(8)
            .teardown_on_corrupt_frame(true)
            .read_buffer_size(512)
            .connect_timeout(Duration::from_secs(1))
            .latency_histogram(true)
            .outgoing_filter(Ok)
            .incoming_filter(Ok);

        let c = &builder.config;
        assert_eq!(c.compression, CompressionFlags::Zstd);
        assert!(!c.checksum);
        assert_eq!(c.request_timeout, None);
        assert_eq!(c.sweep_interval, Duration::from_millis(5));
        assert_eq!(c.max_sessions, 16);
        assert_eq!(c.max_payload_size, 4096);
        assert_eq!(c.max_pending_frames, 8);
        assert!(c.teardown_on_corrupt_frame);
        assert_eq!(c.read_buffer_size, 512);
        assert_eq!(c.connect_timeout, Duration::from_secs(1));
        assert!(c.latency_histogram);
        assert_eq!(builder.outgoing.len(), 1);
        assert_eq!(builder.incoming.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_writes_one_frame() {
        let (client_end, mut server_end) = duplex(4096);
        let client = Client::builder().start(client_end);

        let fut = client.execute(42, &b"ping"[..]).unwrap();
        assert_eq!(fut.session_id(), 1);
        assert_eq!(client.pending_calls(), 1);

        let codec = FrameCodec::default();
        let mut decoder = codec.decoder();
        let mut buf = vec![0u8; 256];
        let frame = loop {
            let n = server_end.read(&mut buf).await.unwrap();
            if let Some(frame) = decoder.push(&buf[..n]).unwrap().next() {
                break frame.unwrap();
            }
        };
        assert_eq!(frame.session_id(), 1);
        assert_eq!(frame.method_meta(), 42);
        assert_eq!(frame.payload(), b"ping");

        let reply = codec.encode_parts(1, 42, Bytes::from_static(b"pong")).unwrap();
        server_end.write_all(&reply).await.unwrap();

        assert_eq!(fut.await.unwrap(), Bytes::from_static(b"pong"));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_pending() {
        let (client_end, _server_end) = duplex(4096);
        let client = Client::builder().start(client_end);

        let fut = client.execute(1, Bytes::new()).unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(matches!(fut.await, Err(RpcError::ClientClosing)));
        assert!(client.is_closed());
        assert!(matches!(
            client.execute(1, Bytes::new()),
            Err(RpcError::ClientClosing)
        ));
        assert!(matches!(
            client.send_oneway(1, Bytes::new()),
            Err(RpcError::ClientClosing)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_with_connection_lost() {
        let (client_end, server_end) = duplex(4096);
        let client = Client::builder().start(client_end);

        let fut = client.execute(1, Bytes::new()).unwrap();
        drop(server_end);

        assert!(matches!(fut.await, Err(RpcError::ConnectionLost)));
        client.closed().await;
        assert!(matches!(
            client.execute(1, Bytes::new()),
            Err(RpcError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_outgoing_filter_rejection_releases_session() {
        let (client_end, _server_end) = duplex(4096);
        let client = Client::builder()
            .outgoing_filter(|_| Err(RpcError::Filter("blocked".into())))
            .start(client_end);

        assert!(matches!(
            client.execute(1, Bytes::new()),
            Err(RpcError::Filter(_))
        ));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_outgoing_filter_cannot_change_session_id() {
        let (client_end, _server_end) = duplex(4096);
        let client = Client::builder()
            .request_timeout(None)
            .outgoing_filter(|mut request| {
                request.session_id = 999;
                Ok(request)
            })
            .start(client_end);

        assert!(matches!(
            client.execute(1, Bytes::new()),
            Err(RpcError::Filter(_))
        ));
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(client.pending_frames(), 0);
    }
}
