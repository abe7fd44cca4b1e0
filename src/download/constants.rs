//! Constants for the download module (timeouts, chunking, probing).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout per chunk request (5 minutes).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Largest byte range requested for a single range-addressed chunk.
pub const MAX_RANGE_CHUNK_BYTES: u64 = 2_000_000;

/// Maximum number of concurrent header-only probes when sizing segments.
pub const MAX_SIZE_PROBES: usize = 10;

/// Segment count above which per-segment sizes are estimated, not measured.
pub const SEGMENT_ESTIMATE_THRESHOLD: u64 = 50;

/// Number of probe attempts for segment count/size discovery.
pub const PROBE_ATTEMPTS: u32 = 5;

/// Fixed delay between probe attempts.
pub const PROBE_RETRY_DELAY: Duration = Duration::from_millis(500);
