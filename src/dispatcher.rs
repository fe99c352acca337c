//! Routes decoded inbound frames to the pending-call table.
//!
//! The dispatcher keeps no per-call state. Registration (`assign_callback`)
//! must take effect before the matching frame is handed to the writer, so
//! that a response decoded immediately after the write always finds its
//! entry. Everything else is a lookup by session id.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{FrameError, Result, RpcError};
use crate::filter::IncomingFilters;
use crate::metrics::LatencySummary;
use crate::pending::{PendingCall, PendingCalls};
use crate::protocol::Frame;
use crate::session::SessionIdAllocator;

/// Snapshot of dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Calls resolved with a response payload.
    pub completed: u64,
    /// Calls resolved with an error other than timeout or cancellation.
    pub failed: u64,
    /// Calls resolved by timeout.
    pub expired: u64,
    /// Calls resolved by cancellation.
    pub cancelled: u64,
    /// Inbound frames that matched no outstanding call.
    pub late: u64,
    /// Calls currently outstanding.
    pub outstanding: usize,
    /// Latency of completed calls, when latency is recorded.
    pub latency: Option<LatencySummary>,
}

/// Routing layer between the inbound decode stream and `PendingCalls`.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    calls: Arc<PendingCalls>,
    incoming: IncomingFilters,
}

impl Dispatcher {
    pub fn new(calls: Arc<PendingCalls>) -> Self {
        Self::with_filters(calls, IncomingFilters::new())
    }

    pub fn with_filters(calls: Arc<PendingCalls>, incoming: IncomingFilters) -> Self {
        Self { calls, incoming }
    }

    /// The table this dispatcher routes into.
    pub fn calls(&self) -> &Arc<PendingCalls> {
        &self.calls
    }

    /// Register `call` under a caller-chosen session id.
    pub fn assign_callback(&self, session_id: u32, call: PendingCall) -> Result<()> {
        self.calls.register(session_id, call)
    }

    /// Allocate a free session id and register `call` under it.
    pub fn assign_next(&self, allocator: &SessionIdAllocator, call: PendingCall) -> Result<u32> {
        self.calls.allocate_and_register(allocator, call)
    }

    /// Route one decoded frame (or per-frame decode failure) to its call.
    ///
    /// Returns `true` if an outstanding call was resolved. Frames for
    /// unknown sessions are dropped.
    pub fn dispatch(&self, decoded: std::result::Result<Frame, FrameError>) -> bool {
        let (session_id, result) = match decoded {
            Ok(frame) if frame.header.is_sessionless() => {
                self.calls.counters().record_late();
                debug!("Dropping frame tagged with no session");
                return false;
            }
            Ok(frame) => {
                let session_id = frame.session_id();
                let result = self
                    .incoming
                    .apply(frame.into_response())
                    .map(|response| response.body);
                (session_id, result)
            }
            Err(FrameError { session_id, error }) => {
                warn!("Failed to decode frame for session {}: {}", session_id, error);
                (session_id, Err(error))
            }
        };

        let delivered = self.calls.complete(session_id, result);
        if !delivered {
            self.calls.counters().record_late();
            debug!("Dropping frame for unknown session {}", session_id);
        }
        delivered
    }

    /// Fail every outstanding call with `ConnectionLost`.
    pub fn connection_lost(&self) -> usize {
        self.fail_all(RpcError::ConnectionLost)
    }

    /// Fail every outstanding call with `error` and refuse new registrations.
    pub fn fail_all(&self, error: RpcError) -> usize {
        debug_assert!(error.is_connection_scoped(), "{error} is not connection scoped");
        let count = self.calls.fail_all(error.clone());
        if count > 0 {
            debug!("Failed {} outstanding calls: {}", count, error);
        }
        count
    }

    /// Expire every call whose deadline has passed at `now`.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let mut expired = 0;
        for session_id in self.calls.overdue(now) {
            if self.calls.expire(session_id) {
                debug!("Call for session {} timed out", session_id);
                expired += 1;
            }
        }
        expired
    }

    /// Resolve one call with `Cancelled`.
    pub fn cancel(&self, session_id: u32) -> bool {
        let cancelled = self.calls.cancel(session_id);
        if cancelled {
            debug!("Call for session {} cancelled", session_id);
        }
        cancelled
    }

    pub fn stats(&self) -> DispatchStats {
        let c = self.calls.counters();
        DispatchStats {
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            late: c.late.load(Ordering::Relaxed),
            outstanding: self.calls.len(),
            latency: self.calls.latency().map(|histogram| histogram.summary()),
        }
    }
}
