//! Range-addressed locators: one URL, the byte window selected by `range=a-b`.

use super::params::{QueryParams, parse_range, with_range};
use super::{Chunk, ChunkPosition, LocatorError};
use crate::download::constants::MAX_RANGE_CHUNK_BYTES;

/// Query parameters that identify a range-addressed URL.
pub(crate) const REQUIRED_PARAMS: [&str; 4] = ["clen", "mime", "expire", "range"];

/// A stream whose declared length (`clen`) is fetched in byte windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeLocator {
    url: String,
    size: u64,
    mime: String,
    expiry: u64,
    next_start: u64,
    resumed: bool,
    chunk_ceiling: u64,
}

impl RangeLocator {
    pub(crate) fn parse(raw: &str) -> Result<Self, LocatorError> {
        let params = QueryParams::parse(raw)?;
        let size = params.number("clen")?;
        let mime = params.text("mime")?;
        let expiry = params.number("expire")?;
        if parse_range(raw).is_none() {
            return Err(LocatorError::missing(raw, "range"));
        }

        Ok(Self {
            url: raw.to_string(),
            size,
            mime,
            expiry,
            next_start: 0,
            resumed: false,
            chunk_ceiling: MAX_RANGE_CHUNK_BYTES,
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn mime(&self) -> &str {
        &self.mime
    }

    pub(crate) fn expiry(&self) -> u64 {
        self.expiry
    }

    pub(crate) fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// First byte not yet covered by a committed chunk.
    pub(crate) fn next_start(&self) -> u64 {
        self.next_start
    }

    pub(crate) fn set_chunk_ceiling(&mut self, ceiling: u64) {
        self.chunk_ceiling = ceiling.max(1);
    }

    pub(crate) fn chunks(&self) -> RangeChunks {
        RangeChunks {
            url: self.url.clone(),
            size: self.size,
            next: self.next_start,
            ceiling: self.chunk_ceiling,
        }
    }

    pub(crate) fn resume_after(&mut self, last_chunk_url: &str) -> Result<(), LocatorError> {
        self.next_start = next_start_after(last_chunk_url)?;
        self.resumed = true;
        Ok(())
    }

    pub(crate) fn renew(
        &mut self,
        newer: &RangeLocator,
        last_successful_url: Option<&str>,
    ) -> Result<(), LocatorError> {
        let next_start = match last_successful_url {
            Some(last) => next_start_after(last)?,
            None => self.next_start,
        };

        self.size = newer.size;
        self.expiry = newer.expiry;
        self.mime.clone_from(&newer.mime);
        self.next_start = next_start;
        self.url = if next_start < self.size {
            let end = window_end(next_start, self.size, self.chunk_ceiling);
            with_range(&newer.url, next_start, end)
        } else {
            newer.url.clone()
        };
        Ok(())
    }
}

fn next_start_after(chunk_url: &str) -> Result<u64, LocatorError> {
    let (_, end) = parse_range(chunk_url).ok_or_else(|| LocatorError::missing(chunk_url, "range"))?;
    Ok(end + 1)
}

fn window_end(start: u64, size: u64, ceiling: u64) -> u64 {
    start.saturating_add(ceiling - 1).min(size - 1)
}

/// Consecutive byte windows tiling `[next, size)`.
#[derive(Debug, Clone)]
pub struct RangeChunks {
    url: String,
    size: u64,
    next: u64,
    ceiling: u64,
}

impl Iterator for RangeChunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next >= self.size {
            return None;
        }
        let start = self.next;
        let end = window_end(start, self.size, self.ceiling);
        self.next = end + 1;

        Some(Chunk {
            url: with_range(&self.url, start, end),
            expected_len: end - start + 1,
            position: ChunkPosition::Range { start, end },
        })
    }
}
