//! Error types for the scheduler.

use thiserror::Error;

use super::{MAX_CONCURRENCY, MIN_CONCURRENCY};

/// Errors surfaced by the [`Scheduler`](super::Scheduler) handle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// The scheduler was shut down.
    #[error("scheduler is shut down")]
    ShutDown,

    /// A worker could not be started.
    #[error("failed to launch worker: {0}")]
    Launch(#[source] std::io::Error),
}

/// Errors returned by a [`LocatorProvider`](super::LocatorProvider).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The upstream producer answered with an error.
    #[error("locator provider failed for {item}: {message}")]
    Failed {
        /// Item that was queried.
        item: String,
        /// Upstream message.
        message: String,
    },

    /// The upstream producer is not reachable.
    #[error("locator provider unavailable")]
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_concurrency_message() {
        let msg = SchedulerError::InvalidConcurrency { value: 0 }.to_string();
        assert!(msg.contains("between 1 and 100"), "got: {msg}");
    }

    #[test]
    fn test_provider_error_names_item() {
        let err = ProviderError::Failed {
            item: "abc".into(),
            message: "timeout".into(),
        };
        assert_eq!(err.to_string(), "locator provider failed for abc: timeout");
    }
}
