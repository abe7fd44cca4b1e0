//! Download throughput for one item.

use std::time::{Duration, Instant};

const BYTES_PER_MB: f64 = 1_000_000.0;

/// Accumulates bytes and active time across (possibly several) sessions of
/// one item, and reports the average rate.
///
/// Start it on `dl-started`, feed it `chunk-fetched` sizes and stop it on the
/// terminal event. Time spent stopped (e.g. paused) does not count.
#[derive(Debug, Clone, Default)]
pub struct ThroughputMeter {
    bytes: u64,
    active: Duration,
    running_since: Option<Instant>,
}

impl ThroughputMeter {
    /// Creates a stopped meter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts measuring time. No-op if already running.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    /// Stops measuring time. No-op if not running.
    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    /// Adds committed bytes.
    pub fn record(&mut self, bytes: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    /// Total bytes recorded.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether the meter is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    /// Average rate in MB/s over the active time so far.
    #[must_use]
    pub fn mb_per_sec(&self) -> f64 {
        self.mb_per_sec_at(Instant::now())
    }

    fn start_at(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    fn stop_at(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.active += now.saturating_duration_since(since);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn mb_per_sec_at(&self, now: Instant) -> f64 {
        let active = self.active
            + self
                .running_since
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        let secs = active.as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        self.bytes as f64 / BYTES_PER_MB / secs
    }
}
