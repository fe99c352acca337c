//! Pending-call table: session id → completion handle.
//!
//! This table is the single source of truth for which calls are
//! outstanding. Callers register from any thread; the I/O task completes,
//! expires and drains. Every mutation happens under one lock, and the
//! completion handle is always removed before it is resolved, so each call
//! resolves exactly once no matter which path reaches it first. Removing an
//! id that is not present is a silent no-op.
//!
//! Completion handles are tokio oneshot channels. The caller side is
//! `ResponseFuture`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::metrics::LatencyHistogram;
use crate::session::SessionIdAllocator;

type Responder = oneshot::Sender<Result<Bytes>>;

/// One outstanding call.
#[derive(Debug)]
pub struct PendingCall {
    /// Method the call was made to.
    pub method_meta: u64,
    /// When the call was registered.
    pub submitted_at: Instant,
    /// When the call times out, if it has a timeout.
    pub deadline: Option<Instant>,
    timeout: Option<Duration>,
    responder: Responder,
}

impl PendingCall {
    /// Create an entry and the receiver its result will be delivered to.
    pub fn new(
        method_meta: u64,
        timeout: Option<Duration>,
    ) -> (Self, oneshot::Receiver<Result<Bytes>>) {
        let (responder, rx) = oneshot::channel();
        let submitted_at = Instant::now();
        let call = Self {
            method_meta,
            submitted_at,
            deadline: timeout.map(|t| submitted_at + t),
            timeout,
            responder,
        };
        (call, rx)
    }

    /// Resolve the call. A waiter that already went away is ignored.
    fn resolve(self, result: Result<Bytes>) {
        let _ = self.responder.send(result);
    }

    fn is_overdue(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Outcome counters, updated as calls resolve.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) late: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn record_late(&self) {
        Self::bump(&self.late, 1);
    }
}

#[derive(Debug, Default)]
struct Inner {
    calls: HashMap<u32, PendingCall>,
    /// Set by `fail_all`. Later registrations fail with this error.
    closed: Option<RpcError>,
}

/// Table of outstanding calls, shared between callers and the I/O task.
#[derive(Debug, Default)]
pub struct PendingCalls {
    inner: Mutex<Inner>,
    counters: Counters,
    latency: Option<LatencyHistogram>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that records the latency of every successful call.
    pub fn with_latency(histogram: LatencyHistogram) -> Self {
        Self {
            latency: Some(histogram),
            ..Self::default()
        }
    }

    /// Register `call` under `id`.
    ///
    /// Fails with `DuplicateSession` if `id` is already outstanding, or with
    /// the closing error once the table has been drained by `fail_all`.
    pub fn register(&self, id: u32, call: PendingCall) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        if inner.calls.contains_key(&id) {
            return Err(RpcError::DuplicateSession(id));
        }
        inner.calls.insert(id, call);
        Ok(())
    }

    /// Allocate a free id and register `call` under it, atomically.
    pub fn allocate_and_register(
        &self,
        allocator: &SessionIdAllocator,
        call: PendingCall,
    ) -> Result<u32> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        let calls = &mut inner.calls;
        let id = allocator.next(calls.len(), |id| calls.contains_key(&id))?;
        calls.insert(id, call);
        Ok(id)
    }

    /// Remove and resolve `id` with `result`.
    ///
    /// Returns `false` if `id` was not outstanding (late or unknown response).
    pub fn complete(&self, id: u32, result: Result<Bytes>) -> bool {
        let Some(call) = self.inner.lock().calls.remove(&id) else {
            return false;
        };
        if result.is_ok() {
            Counters::bump(&self.counters.completed, 1);
            if let Some(histogram) = &self.latency {
                histogram.observe(call.submitted_at.elapsed());
            }
        } else {
            Counters::bump(&self.counters.failed, 1);
        }
        call.resolve(result);
        true
    }

    /// Remove and resolve `id` with a timeout error.
    pub fn expire(&self, id: u32) -> bool {
        let Some(call) = self.inner.lock().calls.remove(&id) else {
            return false;
        };
        let waited = call
            .timeout
            .unwrap_or_else(|| call.submitted_at.elapsed());
        Counters::bump(&self.counters.expired, 1);
        call.resolve(Err(RpcError::Timeout(waited)));
        true
    }

    /// Remove and resolve `id` with `Cancelled`.
    pub fn cancel(&self, id: u32) -> bool {
        let Some(call) = self.inner.lock().calls.remove(&id) else {
            return false;
        };
        Counters::bump(&self.counters.cancelled, 1);
        call.resolve(Err(RpcError::Cancelled));
        true
    }

    /// Remove `id` without resolving it. Used to roll back a registration
    /// whose frame never reached the writer.
    pub fn remove(&self, id: u32) -> Option<PendingCall> {
        self.inner.lock().calls.remove(&id)
    }

    /// Drain the table, failing every outstanding call with `error`, and
    /// close it so later registrations fail with the same error.
    ///
    /// Only the first close sets the error. Returns the number of calls failed.
    pub fn fail_all(&self, error: RpcError) -> usize {
        let drained: Vec<PendingCall> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(error.clone());
            }
            inner.calls.drain().map(|(_, call)| call).collect()
        };

        let count = drained.len();
        Counters::bump(&self.counters.failed, count as u64);
        for call in drained {
            call.resolve(Err(error.clone()));
        }
        count
    }

    /// Ids whose deadline has passed at `now`.
    pub fn overdue(&self, now: Instant) -> Vec<u32> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|(_, call)| call.is_overdue(now))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove `id` if nobody is waiting on it any more.
    fn discard_abandoned(&self, id: u32) {
        let mut inner = self.inner.lock();
        if inner
            .calls
            .get(&id)
            .is_some_and(|call| call.responder.is_closed())
        {
            inner.calls.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().calls.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.lock().calls.contains_key(&id)
    }

    /// The error the table was closed with, if any.
    pub fn closed_error(&self) -> Option<RpcError> {
        self.inner.lock().closed.clone()
    }

    /// The latency histogram, if latency is recorded.
    pub fn latency(&self) -> Option<&LatencyHistogram> {
        self.latency.as_ref()
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }
}

/// Caller-side handle to one call's result.
///
/// Resolves exactly once, with the response payload or a typed error.
/// Dropping it before it resolves releases the session id.
#[derive(Debug)]
pub struct ResponseFuture {
    session_id: u32,
    rx: oneshot::Receiver<Result<Bytes>>,
    calls: Arc<PendingCalls>,
    finished: bool,
}

impl ResponseFuture {
    pub(crate) fn new(
        session_id: u32,
        rx: oneshot::Receiver<Result<Bytes>>,
        calls: Arc<PendingCalls>,
    ) -> Self {
        Self {
            session_id,
            rx,
            calls,
            finished: false,
        }
    }

    /// Session id this call was sent with.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Resolve this call with `Cancelled`.
    ///
    /// Returns `false` if the call had already resolved. A response that
    /// arrives later is treated as unknown.
    pub fn cancel(&self) -> bool {
        self.calls.cancel(self.session_id)
    }
}

impl Future for ResponseFuture {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.finished = true;
                // A dropped responder means the entry vanished without resolution.
                Poll::Ready(result.unwrap_or(Err(RpcError::ConnectionLost)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.finished {
            self.rx.close();
            self.calls.discard_abandoned(self.session_id);
        }
    }
}
