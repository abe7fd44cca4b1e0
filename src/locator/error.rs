//! Error types for media locators.

use thiserror::Error;

use super::LocatorKind;
use crate::download::DownloadError;

/// Errors produced while classifying, sizing or renewing a media locator.
#[derive(Debug, Error)]
pub enum LocatorError {
    /// The URL lacks a query parameter required for chunk addressing.
    ///
    /// Fatal to the stream that owns the locator; never retried.
    #[error("unsupported locator format for {url}{}", missing_suffix(.param))]
    UnsupportedFormat {
        /// The offending URL.
        url: String,
        /// The missing or malformed parameter, when a single one is to blame.
        param: Option<&'static str>,
    },

    /// A renewal was attempted with a locator of the other kind.
    #[error("cannot renew a {expected} locator from a {found} locator")]
    KindMismatch {
        /// Kind of the locator being renewed.
        expected: LocatorKind,
        /// Kind of the freshly issued locator.
        found: LocatorKind,
    },

    /// Probing the stream (segment count or sizes) failed.
    #[error("failed to probe media stream: {0}")]
    Probe(#[from] DownloadError),
}

impl LocatorError {
    /// Creates an unsupported-format error blaming one parameter.
    pub fn missing(url: impl Into<String>, param: &'static str) -> Self {
        Self::UnsupportedFormat {
            url: url.into(),
            param: Some(param),
        }
    }

    /// Creates an unsupported-format error for a URL matching no locator kind.
    pub fn unsupported(url: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            url: url.into(),
            param: None,
        }
    }

    /// Whether this error means the locator itself is unusable (as opposed to
    /// a network failure while probing it).
    #[must_use]
    pub fn is_unsupported_format(&self) -> bool {
        matches!(self, Self::UnsupportedFormat { .. })
    }
}

fn missing_suffix(param: &Option<&'static str>) -> String {
    match param {
        Some(param) => format!(" (parameter `{param}` missing or malformed)"),
        None => String::new(),
    }
}
