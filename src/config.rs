//! Client configuration.
//!
//! Every field has a default, so a partial document deserializes into a
//! complete config. Durations are written as whole milliseconds.
//!
//! ```
//! use rpcmux::{ClientConfig, protocol::CompressionFlags};
//!
//! let config: ClientConfig =
//!     serde_json::from_str(r#"{ "compression": "zstd", "request_timeout_ms": 500 }"#).unwrap();
//! assert_eq!(config.compression, CompressionFlags::Zstd);
//! assert!(config.checksum);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{CompressionFlags, FrameCodec, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{WriterConfig, DEFAULT_MAX_PENDING_FRAMES};

/// Default per-call timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between timeout sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Default time allowed to establish the connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default transport read chunk size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Compression applied to outbound payloads.
    pub compression: CompressionFlags,
    /// Whether outbound frames carry a checksum.
    pub checksum: bool,
    /// Default per-call timeout. `None` disables timeouts.
    #[serde(rename = "request_timeout_ms", with = "opt_millis")]
    pub request_timeout: Option<Duration>,
    /// How often overdue calls are expired.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
    /// Session ids are drawn from `1..=max_sessions`.
    pub max_sessions: u32,
    /// Upper bound for a payload, on the wire and after decompression.
    pub max_payload_size: u32,
    /// Bound of the write queue.
    pub max_pending_frames: usize,
    /// Tear the connection down when a frame fails its checksum or names
    /// an unsupported compression algorithm.
    pub teardown_on_corrupt_frame: bool,
    /// Size of each transport read.
    pub read_buffer_size: usize,
    /// Time allowed for `connect`.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Record the latency of every successful call.
    pub latency_histogram: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            compression: CompressionFlags::Disabled,
            checksum: true,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_sessions: u32::MAX,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            teardown_on_corrupt_frame: false,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            latency_histogram: false,
        }
    }
}

impl ClientConfig {
    pub(crate) fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.compression, self.checksum).with_max_payload(self.max_payload_size)
    }

    pub(crate) fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
