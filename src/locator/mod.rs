//! Addressable media streams.
//!
//! A [`MediaLocator`] wraps one raw stream URL handed out by the upstream
//! producer. Every piece of addressing and auth state lives in the URL query,
//! so the kind of locator is decided purely by which parameters are present:
//!
//! | Kind | Required parameters | Chunk unit |
//! |------|---------------------|------------|
//! | [`LocatorKind::RangeAddressed`] | `clen`, `mime`, `expire`, `range` | byte window of at most 2,000,000 bytes |
//! | [`LocatorKind::SegmentAddressed`] | `sq`, `mime`, `expire` | one numbered segment |
//!
//! Locators expire (`expire` is an epoch in seconds). An expired locator is
//! renewed against a freshly issued one of the same kind; the position to
//! continue from is always rebuilt from the URL of the last chunk that was
//! committed, never from the stale locator.
//!
//! # Example
//!
//! ```
//! use streamdl_core::locator::{LocatorKind, MediaLocator};
//!
//! let raw = "https://r1.example.com/videoplayback?expire=1700000000&mime=audio%2Fwebm&clen=4000000&range=0-100";
//! let locator = MediaLocator::parse(raw).unwrap();
//! assert_eq!(locator.kind(), LocatorKind::RangeAddressed);
//! assert_eq!(locator.file_extension(), "webm");
//! ```

mod error;
mod params;
mod range;
mod segment;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::download::HttpClient;

pub use error::LocatorError;
pub use range::{RangeChunks, RangeLocator};
pub use segment::{SegmentChunks, SegmentLocator};

/// The two ways a media stream can be chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorKind {
    /// Declared length fetched in byte windows.
    RangeAddressed,
    /// Numbered segments of unknown individual size.
    SegmentAddressed,
}

impl fmt::Display for LocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RangeAddressed => f.write_str("range-addressed"),
            Self::SegmentAddressed => f.write_str("segment-addressed"),
        }
    }
}

/// Where a chunk sits in its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPosition {
    /// Inclusive byte window.
    Range {
        /// First byte.
        start: u64,
        /// Last byte (inclusive).
        end: u64,
    },
    /// Segment number.
    Segment {
        /// Zero-based segment index.
        index: u64,
    },
}

/// One discrete fetch unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Fully addressed URL for this chunk.
    pub url: String,
    /// Size the chunk is expected to have; the fetched size may drift.
    pub expected_len: u64,
    /// Position of the chunk in the stream.
    pub position: ChunkPosition,
}

/// Iterator over the remaining chunks of a locator.
#[derive(Debug, Clone)]
pub enum Chunks {
    /// Byte windows.
    Range(RangeChunks),
    /// Segments.
    Segment(SegmentChunks),
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        match self {
            Self::Range(chunks) => chunks.next(),
            Self::Segment(chunks) => chunks.next(),
        }
    }
}

/// One addressable media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaLocator {
    /// See [`RangeLocator`].
    Range(RangeLocator),
    /// See [`SegmentLocator`].
    Segment(SegmentLocator),
}

impl MediaLocator {
    /// Classifies a raw URL.
    ///
    /// The range-addressed form is tried first; a URL carrying both sets of
    /// parameters is therefore treated as range-addressed.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError::UnsupportedFormat`] when the URL matches no
    /// kind or a required parameter is malformed.
    pub fn parse(raw: &str) -> Result<Self, LocatorError> {
        let params = params::QueryParams::parse(raw)?;
        if params.contains_all(&range::REQUIRED_PARAMS) {
            return RangeLocator::parse(raw).map(Self::Range);
        }
        if params.contains_all(&segment::REQUIRED_PARAMS) {
            return SegmentLocator::parse(raw).map(Self::Segment);
        }
        Err(LocatorError::unsupported(raw))
    }

    /// Kind of this locator.
    #[must_use]
    pub fn kind(&self) -> LocatorKind {
        match self {
            Self::Range(_) => LocatorKind::RangeAddressed,
            Self::Segment(_) => LocatorKind::SegmentAddressed,
        }
    }

    /// The current raw URL (after any renewal).
    #[must_use]
    pub fn raw_url(&self) -> &str {
        match self {
            Self::Range(l) => l.url(),
            Self::Segment(l) => l.url(),
        }
    }

    /// MIME type declared by the URL.
    #[must_use]
    pub fn mime(&self) -> &str {
        match self {
            Self::Range(l) => l.mime(),
            Self::Segment(l) => l.mime(),
        }
    }

    /// Expiry epoch in seconds.
    #[must_use]
    pub fn expiry(&self) -> u64 {
        match self {
            Self::Range(l) => l.expiry(),
            Self::Segment(l) => l.expiry(),
        }
    }

    /// Whether the locator has expired at `now` (epoch seconds).
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expiry()
    }

    /// Whether the locator has expired according to the system clock.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }

    /// Whether the locator was positioned from a previous session's progress.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        match self {
            Self::Range(l) => l.is_resumed(),
            Self::Segment(l) => l.is_resumed(),
        }
    }

    /// Size if already known without a network round trip.
    #[must_use]
    pub fn known_size(&self) -> Option<u64> {
        match self {
            Self::Range(l) => Some(l.size()),
            Self::Segment(l) => l.known_size(),
        }
    }

    /// Total size of the stream, probing segment sizes on first call.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError::Probe`] when segment discovery fails.
    pub async fn size(&mut self, client: &HttpClient) -> Result<u64, LocatorError> {
        match self {
            Self::Range(l) => Ok(l.size()),
            Self::Segment(l) => l.size(client).await,
        }
    }

    /// File extension used for this stream's temporary file.
    #[must_use]
    pub fn file_extension(&self) -> &'static str {
        if self.mime() == "audio/webm" {
            "webm"
        } else {
            "mp4"
        }
    }

    /// Overrides the byte window ceiling (range-addressed only).
    pub fn set_chunk_ceiling(&mut self, ceiling: u64) {
        if let Self::Range(l) = self {
            l.set_chunk_ceiling(ceiling);
        }
    }

    /// Remaining chunks from the current cursor.
    ///
    /// Segment-addressed locators discover their segment count and sizes on
    /// the first call; later calls reuse the cached values.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError::Probe`] when segment discovery fails.
    pub async fn generate_chunks(&mut self, client: &HttpClient) -> Result<Chunks, LocatorError> {
        match self {
            Self::Range(l) => Ok(Chunks::Range(l.chunks())),
            Self::Segment(l) => {
                l.segment_sizes(client).await?;
                Ok(Chunks::Segment(l.chunks()))
            }
        }
    }

    /// Positions the cursor right after a chunk committed in an earlier session.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError::UnsupportedFormat`] if `last_chunk_url` lacks
    /// the positional parameter of this locator's kind.
    pub fn resume_after(&mut self, last_chunk_url: &str) -> Result<(), LocatorError> {
        match self {
            Self::Range(l) => l.resume_after(last_chunk_url),
            Self::Segment(l) => l.resume_after(last_chunk_url),
        }
    }

    /// Re-addresses this locator against a freshly issued one.
    ///
    /// URL and expiry come from `newer`; the position to continue from is
    /// rebuilt from `last_successful_url`, the URL of the last committed
    /// chunk. With no committed chunk the current cursor is kept. On error the
    /// locator is left untouched.
    ///
    /// # Errors
    ///
    /// - [`LocatorError::KindMismatch`] if `newer` is of the other kind
    /// - [`LocatorError::UnsupportedFormat`] if `last_successful_url` lacks
    ///   the positional parameter
    pub fn renew(
        &mut self,
        newer: &MediaLocator,
        last_successful_url: Option<&str>,
    ) -> Result<(), LocatorError> {
        match (self, newer) {
            (Self::Range(old), Self::Range(new)) => old.renew(new, last_successful_url)?,
            (Self::Segment(old), Self::Segment(new)) => old.renew(new, last_successful_url)?,
            (old, new) => {
                return Err(LocatorError::KindMismatch {
                    expected: old.kind(),
                    found: new.kind(),
                });
            }
        }
        debug!("locator renewed");
        Ok(())
    }
}

/// Current time in epoch seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
