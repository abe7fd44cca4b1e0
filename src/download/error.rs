//! Fetch-layer errors.
//!
//! Each variant names the URL or path it failed on, so a `dl-error` event
//! sent to the host can be acted on without extra context. There are no
//! `From` conversions for the same reason: use the constructors.

use std::path::PathBuf;

use thiserror::Error;

/// Failure while fetching a chunk or probing a stream.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Connection, DNS or TLS trouble, or a body that broke off mid-read.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// Any non-2xx answer.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    /// Local write of a fetched chunk failed.
    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// A probe answer lacked the header or marker it was sent for.
    #[error("probe of {url} returned no {what}")]
    Probe { url: String, what: &'static str },
}

impl DownloadError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn probe(url: impl Into<String>, what: &'static str) -> Self {
        Self::Probe {
            url: url.into(),
            what,
        }
    }

    /// Stable short name, sent as the `kind` of a `dl-error` event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::HttpStatus { .. } => "http_status",
            Self::Io { .. } => "io",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::Probe { .. } => "probe",
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
