//! Ordered filter chains applied to requests before encoding and to
//! responses before they complete their call.
//!
//! A filter takes ownership of the message and returns it (possibly
//! rewritten) or an error. Any `Fn(M) -> Result<M>` closure is a filter.
//!
//! # Example
//!
//! ```
//! use rpcmux::filter::FilterChain;
//! use rpcmux::protocol::RpcRequest;
//! use rpcmux::RpcError;
//!
//! let mut chain = FilterChain::<RpcRequest>::new();
//! chain.push(|req: RpcRequest| {
//!     if req.body.is_empty() {
//!         Err(RpcError::Filter("empty body".into()))
//!     } else {
//!         Ok(req)
//!     }
//! });
//!
//! assert!(chain.apply(RpcRequest::new(1, 1, &b"x"[..])).is_ok());
//! assert!(chain.apply(RpcRequest::new(1, 1, &b""[..])).is_err());
//! ```

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{RpcRequest, RpcResponse};

/// Trait for message filters.
pub trait Filter<M>: Send + Sync + 'static {
    fn apply(&self, message: M) -> Result<M>;
}

impl<M, F> Filter<M> for F
where
    F: Fn(M) -> Result<M> + Send + Sync + 'static,
{
    fn apply(&self, message: M) -> Result<M> {
        self(message)
    }
}

/// Filters run in registration order. The first error stops the chain.
pub struct FilterChain<M> {
    filters: Vec<Arc<dyn Filter<M>>>,
}

/// Filters applied to outbound requests.
pub type OutgoingFilters = FilterChain<RpcRequest>;

/// Filters applied to inbound responses.
pub type IncomingFilters = FilterChain<RpcResponse>;

impl<M: 'static> FilterChain<M> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Append a closure to the end of the chain.
    pub fn push<F>(&mut self, filter: F)
    where
        F: Fn(M) -> Result<M> + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(filter));
    }

    /// Append a shared filter to the end of the chain.
    pub fn push_filter(&mut self, filter: Arc<dyn Filter<M>>) {
        self.filters.push(filter);
    }

    /// Run `message` through every filter.
    pub fn apply(&self, message: M) -> Result<M> {
        self.filters
            .iter()
            .try_fold(message, |message, filter| filter.apply(message))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl<M: 'static> Default for FilterChain<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: 'static> Clone for FilterChain<M> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
        }
    }
}

impl<M: 'static> fmt::Debug for FilterChain<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}
