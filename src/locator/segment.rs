//! Segment-addressed locators: the same URL fetched once per `sq=<index>`.
//!
//! Neither the segment count nor the segment sizes are part of the URL. The
//! count comes from one probe whose body carries `Segment-Count: <n>`; sizes
//! come from header-only probes, fanned out with a fixed bound.

use std::sync::LazyLock;

use futures_util::{StreamExt, stream};
use regex::Regex;
use tracing::{debug, instrument, warn};

use super::params::{QueryParams, parse_segment_index, with_segment_index};
use super::{Chunk, ChunkPosition, LocatorError};
use crate::download::constants::{
    MAX_SIZE_PROBES, PROBE_ATTEMPTS, PROBE_RETRY_DELAY, SEGMENT_ESTIMATE_THRESHOLD,
};
use crate::download::{DownloadError, FailureType, HttpClient, classify_error};

/// Query parameters that identify a segment-addressed URL.
pub(crate) const REQUIRED_PARAMS: [&str; 3] = ["sq", "mime", "expire"];

#[allow(clippy::expect_used)]
static SEGMENT_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Segment-Count: (\d+)").expect("segment count regex is valid") // Static pattern, safe to panic
});

/// A stream delivered as numbered segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocator {
    url: String,
    mime: String,
    expiry: u64,
    size: Option<u64>,
    segment_count: Option<u64>,
    segment_sizes: Option<Vec<u64>>,
    next_segment: u64,
    resumed: bool,
}

impl SegmentLocator {
    pub(crate) fn parse(raw: &str) -> Result<Self, LocatorError> {
        let params = QueryParams::parse(raw)?;
        let mime = params.text("mime")?;
        let expiry = params.number("expire")?;
        if parse_segment_index(raw).is_none() {
            return Err(LocatorError::missing(raw, "sq"));
        }

        Ok(Self {
            url: raw.to_string(),
            mime,
            expiry,
            size: None,
            segment_count: None,
            segment_sizes: None,
            next_segment: 0,
            resumed: false,
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
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

    pub(crate) fn known_size(&self) -> Option<u64> {
        self.size
    }

    #[cfg(test)]
    pub(crate) fn known_segment_count(&self) -> Option<u64> {
        self.segment_count
    }

    /// Index of the first segment not yet committed.
    #[cfg(test)]
    pub(crate) fn next_segment(&self) -> u64 {
        self.next_segment
    }

    /// Returns the cached segment count, probing for it on first use.
    #[instrument(level = "debug", skip(self, client), fields(mime = %self.mime))]
    pub(crate) async fn segment_count(&mut self, client: &HttpClient) -> Result<u64, LocatorError> {
        if let Some(count) = self.segment_count {
            return Ok(count);
        }

        let url = self.url.clone();
        let target = url.as_str();
        let body = with_probe_retries(|| client.fetch_text(target)).await?;
        let last_index: u64 = SEGMENT_COUNT
            .captures(&body)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| DownloadError::probe(&url, "Segment-Count"))?;

        let count = last_index + 1;
        debug!(count, "segment count discovered");
        self.segment_count = Some(count);
        Ok(count)
    }

    /// Returns the cached segment sizes, measuring them on first use.
    ///
    /// Streams with more than [`SEGMENT_ESTIMATE_THRESHOLD`] segments only
    /// have their first [`MAX_SIZE_PROBES`] segments measured; every segment
    /// is then assumed to have the mean of that sample.
    pub(crate) async fn segment_sizes(
        &mut self,
        client: &HttpClient,
    ) -> Result<&[u64], LocatorError> {
        if self.segment_sizes.is_none() {
            let count = self.segment_count(client).await?;
            let sizes = if count > SEGMENT_ESTIMATE_THRESHOLD {
                let sample = self.probe_sizes(client, count.min(MAX_SIZE_PROBES as u64)).await?;
                let mean = sample.iter().sum::<u64>() / sample.len().max(1) as u64;
                debug!(count, mean, "segment sizes estimated from sample");
                vec![mean; usize::try_from(count).unwrap_or(usize::MAX)]
            } else {
                self.probe_sizes(client, count).await?
            };
            self.size = Some(sizes.iter().sum());
            self.segment_sizes = Some(sizes);
        }
        Ok(self.segment_sizes.as_deref().unwrap_or_default())
    }

    /// Total size of the stream, measured lazily.
    pub(crate) async fn size(&mut self, client: &HttpClient) -> Result<u64, LocatorError> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        self.segment_sizes(client).await?;
        Ok(self.size.unwrap_or(0))
    }

    async fn probe_sizes(&self, client: &HttpClient, count: u64) -> Result<Vec<u64>, LocatorError> {
        let probes = (0..count).map(|index| {
            let url = with_segment_index(&self.url, index);
            async move {
                let target = url.as_str();
                let len = with_probe_retries(|| client.content_length(target)).await?;
                Ok::<_, DownloadError>((index, len))
            }
        });

        let results: Vec<Result<(u64, u64), DownloadError>> = stream::iter(probes)
            .buffer_unordered(MAX_SIZE_PROBES)
            .collect()
            .await;

        let mut sizes = vec![0; usize::try_from(count).unwrap_or(usize::MAX)];
        for result in results {
            let (index, len) = result?;
            if let Some(slot) = usize::try_from(index).ok().and_then(|i| sizes.get_mut(i)) {
                *slot = len;
            }
        }
        Ok(sizes)
    }

    /// Chunks from the cursor onwards. Sizes must have been measured.
    pub(crate) fn chunks(&self) -> SegmentChunks {
        SegmentChunks {
            url: self.url.clone(),
            next: self.next_segment,
            sizes: self.segment_sizes.clone().unwrap_or_default(),
        }
    }

    pub(crate) fn resume_after(&mut self, last_chunk_url: &str) -> Result<(), LocatorError> {
        self.next_segment = next_segment_after(last_chunk_url)?;
        self.resumed = true;
        Ok(())
    }

    pub(crate) fn renew(
        &mut self,
        newer: &SegmentLocator,
        last_successful_url: Option<&str>,
    ) -> Result<(), LocatorError> {
        let next_segment = match last_successful_url {
            Some(last) => next_segment_after(last)?,
            None => self.next_segment,
        };

        self.expiry = newer.expiry;
        self.mime.clone_from(&newer.mime);
        self.next_segment = next_segment;
        self.url = with_segment_index(&newer.url, next_segment);
        if self.segment_count.is_none() {
            self.segment_count = newer.segment_count;
        }
        Ok(())
    }
}

fn next_segment_after(chunk_url: &str) -> Result<u64, LocatorError> {
    parse_segment_index(chunk_url)
        .map(|index| index + 1)
        .ok_or_else(|| LocatorError::missing(chunk_url, "sq"))
}

async fn with_probe_retries<T, F, Fut>(mut probe: F) -> Result<T, DownloadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
{
    let mut attempt = 1;
    loop {
        match probe().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < PROBE_ATTEMPTS && classify_error(&e) != FailureType::Permanent => {
                warn!(attempt, error = %e, "probe failed, retrying");
                attempt += 1;
                tokio::time::sleep(PROBE_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Consecutive segments from the cursor to the last segment.
#[derive(Debug, Clone)]
pub struct SegmentChunks {
    url: String,
    next: u64,
    sizes: Vec<u64>,
}

impl Iterator for SegmentChunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let index = self.next;
        let expected_len = *self.sizes.get(usize::try_from(index).ok()?)?;
        self.next += 1;

        Some(Chunk {
            url: with_segment_index(&self.url, index),
            expected_len,
            position: ChunkPosition::Segment { index },
        })
    }
}
