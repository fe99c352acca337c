//! Session id allocation.
//!
//! Ids tag in-flight calls on one connection. They come from a wrapping
//! counter over `1..=max_sessions` (0 is reserved for "no session") and are
//! unique among outstanding calls only, so they are reused once a call
//! resolves.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, RpcError};
use crate::protocol::NO_SESSION;

/// Thread-safe generator of session ids.
#[derive(Debug)]
pub struct SessionIdAllocator {
    counter: AtomicU32,
    max_sessions: u32,
}

impl SessionIdAllocator {
    /// Allocator over the full 32-bit space (`1..=u32::MAX`).
    pub fn new() -> Self {
        Self::with_max_sessions(u32::MAX)
    }

    /// Allocator over `1..=max_sessions`. A zero bound is raised to 1.
    pub fn with_max_sessions(max_sessions: u32) -> Self {
        Self {
            counter: AtomicU32::new(0),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Size of the id space.
    pub fn capacity(&self) -> u32 {
        self.max_sessions
    }

    /// Next candidate id, without checking whether it is outstanding.
    #[inline]
    fn candidate(&self) -> u32 {
        let raw = self.counter.fetch_add(1, Ordering::Relaxed);
        raw % self.max_sessions + 1
    }

    /// Return an id for which `is_outstanding` is false.
    ///
    /// `outstanding` is the number of ids currently in use. When it covers
    /// the whole space the call fails at once with `SessionSpaceExhausted`;
    /// otherwise candidates are tried in order, skipping outstanding ones,
    /// for at most one full turn of the space.
    ///
    /// # Example
    ///
    /// ```
    /// use rpcmux::SessionIdAllocator;
    ///
    /// let allocator = SessionIdAllocator::with_max_sessions(3);
    /// let id = allocator.next(1, |id| id == 1).unwrap();
    /// assert_eq!(id, 2);
    /// ```
    pub fn next(&self, outstanding: usize, is_outstanding: impl Fn(u32) -> bool) -> Result<u32> {
        if outstanding >= self.max_sessions as usize {
            return Err(RpcError::SessionSpaceExhausted);
        }

        for _ in 0..self.max_sessions {
            let id = self.candidate();
            debug_assert_ne!(id, NO_SESSION);
            if !is_outstanding(id) {
                return Ok(id);
            }
        }

        Err(RpcError::SessionSpaceExhausted)
    }
}

impl Default for SessionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
