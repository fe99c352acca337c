//! Opt-in call latency histogram.
//!
//! Latency is measured from registration to successful completion and
//! recorded in seconds into a `prometheus::Histogram`. The histogram is not
//! registered anywhere; callers that export metrics can register the
//! handle returned by [`LatencyHistogram::histogram`] with their own
//! registry.

use std::fmt;
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts};

use crate::error::Result;

/// Bucket upper bounds, in seconds.
const LATENCY_BUCKETS: [f64; 12] = [
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0,
];

/// Count and total of observed latencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    /// Number of calls measured.
    pub count: u64,
    /// Sum of their latencies.
    pub total: Duration,
}

impl LatencySummary {
    /// Mean latency, or `None` before the first observation.
    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let count = u32::try_from(self.count).unwrap_or(u32::MAX);
        Some(self.total / count)
    }
}

/// Per-client latency histogram. Cheap to clone; clones share samples.
#[derive(Clone)]
pub struct LatencyHistogram {
    histogram: Histogram,
}

impl LatencyHistogram {
    pub fn new() -> Result<Self> {
        let opts = HistogramOpts::new(
            "rpcmux_call_latency_seconds",
            "Time from call registration to response",
        )
        .buckets(LATENCY_BUCKETS.to_vec());
        Ok(Self {
            histogram: Histogram::with_opts(opts)?,
        })
    }

    pub fn observe(&self, latency: Duration) {
        self.histogram.observe(latency.as_secs_f64());
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.histogram.get_sample_count(),
            total: Duration::from_secs_f64(self.histogram.get_sample_sum().max(0.0)),
        }
    }

    /// The underlying histogram, for registration with a metrics registry.
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }
}

impl fmt::Debug for LatencyHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatencyHistogram")
            .field("count", &self.histogram.get_sample_count())
            .finish()
    }
}
