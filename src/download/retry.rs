//! Per-chunk retry budget.
//!
//! A stream retries each chunk with a fixed pause until its budget runs out.
//! Failures are sorted into three buckets by [`classify_error`]:
//!
//! - [`FailureType::Transient`]: network trouble and most non-2xx answers
//! - [`FailureType::Forbidden`]: 401/403/410, the usual sign of an expired locator
//! - [`FailureType::Permanent`]: local failures that another request cannot fix
//!
//! ```
//! use std::time::Duration;
//! use streamdl_core::download::{DownloadError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
//! let error = DownloadError::http_status("https://example.com/videoplayback", 503);
//!
//! assert_eq!(
//!     policy.should_retry(classify_error(&error), 1),
//!     RetryDecision::Retry { delay: Duration::from_millis(500), attempt: 2 },
//! );
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::DownloadError;

/// Default number of attempts per chunk, the first one included.
pub const DEFAULT_MAX_RETRIES: u32 = 25;

const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// How a failed chunk request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed if asked again.
    Transient,

    /// Access refused. Retried like [`Transient`](Self::Transient); the
    /// stream also renews its locator first when the locator has expired.
    Forbidden,

    /// Retrying cannot help.
    Permanent,
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then make attempt number `attempt`.
    Retry { delay: Duration, attempt: u32 },

    /// Give up on the chunk.
    DoNotRetry { reason: String },
}

/// Fixed-delay retry budget applied to every chunk of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_RETRIES, DEFAULT_DELAY)
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first request and is raised to at least one.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Decides what follows failed attempt number `attempt` (1-based).
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure: FailureType, attempt: u32) -> RetryDecision {
        if failure == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure".to_string(),
            };
        }
        if attempt >= self.max_attempts {
            debug!(attempt, "chunk retry budget spent");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }
        RetryDecision::Retry {
            delay: self.delay,
            attempt: attempt + 1,
        }
    }
}

/// Buckets a fetch error for [`RetryPolicy::should_retry`].
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus {
            status: 401 | 403 | 410,
            ..
        } => FailureType::Forbidden,
        DownloadError::HttpStatus { .. }
        | DownloadError::Timeout { .. }
        | DownloadError::Network { .. }
        | DownloadError::Probe { .. } => FailureType::Transient,
        DownloadError::Io { .. } | DownloadError::InvalidUrl { .. } => FailureType::Permanent,
    }
}
