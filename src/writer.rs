//! Dedicated writer task, the single writer to the transport.
//!
//! Callers never touch the write half of the connection. Encoded frames go
//! through a bounded mpsc queue to one task that batches whatever is ready
//! into a single vectored write.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Transport
//! Caller N ─┘
//! ```
//!
//! A single queue keeps frames from one caller in submission order. The
//! queue is bounded and `try_send` never waits: a full queue is reported as
//! `RpcError::Backpressure`, a stopped writer as `RpcError::ConnectionLost`.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::error::{Result, RpcError};

/// Default maximum queued frames before submissions are refused.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded frame ready to be written to the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Session the frame belongs to (0 for one-way sends).
    pub session_id: u32,
    /// Complete encoded frame, size field included.
    pub bytes: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(session_id: u32, bytes: Bytes) -> Self {
        Self { session_id, bytes }
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum queued frames before submissions are refused.
    pub max_pending_frames: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
        }
    }
}

/// Handle for queueing frames to the writer task.
///
/// Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames queued or being written.
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, pending: Arc<AtomicUsize>, max_pending: usize) -> Self {
        Self {
            tx,
            pending,
            max_pending,
        }
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `Err(Backpressure)` immediately if at capacity, and
    /// `Err(ConnectionLost)` if the writer task has stopped.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(RpcError::Backpressure);
        }

        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => RpcError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => RpcError::ConnectionLost,
            }
        })
    }

    /// Check if the queue is at capacity.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current queued frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped receiving.
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for queueing frames.
///
/// The returned `JoinHandle` resolves when every handle is dropped (`Ok`)
/// or the first write fails (`Err`).
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let capacity = config.max_pending_frames.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(tx, pending.clone(), capacity);
    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the transport.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            error!(
                "Transport write failed ({} frames from session {}): {}",
                batch_size, batch[0].session_id, e
            );
            return Err(e);
        }

        pending.fetch_sub(batch_size, Ordering::Release);
    }

    // Channel closed, clean shutdown
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )
            .into());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut frame_start = 0;

    for frame in batch {
        let frame_end = frame_start + frame.size();
        if skip_bytes < frame_end && !frame.bytes.is_empty() {
            let offset = skip_bytes.saturating_sub(frame_start);
            slices.push(IoSlice::new(&frame.bytes[offset..]));
        }
        frame_start = frame_end;
    }

    slices
}
