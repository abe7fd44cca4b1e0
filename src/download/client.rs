//! One-request-per-chunk HTTP client.
//!
//! Locators carry their addressing and signature in the query string, so
//! requests go out without extra headers.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, ClientBuilder, Method, Response};
use tracing::{debug, instrument, trace};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;

/// Pooled client, built once per worker and cloned into every stream.
///
/// # Example
///
/// ```no_run
/// use streamdl_core::download::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let len = client.content_length("https://example.com/videoplayback?sq=3").await?;
/// println!("segment is {len} bytes");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Client with the stock connect and read timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// # Panics
    ///
    /// If reqwest cannot build a client from plain timeout settings, which
    /// only happens when the TLS backend fails to initialise.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let client = build_client(connect_timeout_secs, read_timeout_secs)
            .expect("HTTP client from static settings");
        Self { client }
    }

    /// Downloads one chunk in full.
    ///
    /// An empty body is not an error here; whether it means an expired
    /// locator is up to the stream.
    ///
    /// # Errors
    ///
    /// Invalid URL, failed request, non-2xx status, or a body that breaks off.
    #[instrument(level = "debug", skip(self), fields(url = %truncate_url(url)))]
    pub async fn fetch_chunk(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let response = self.send(Method::GET, url).await?;
        let hint = response
            .content_length()
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(0);
        let mut body = Vec::with_capacity(hint);

        let mut pieces = response.bytes_stream();
        while let Some(piece) = pieces.next().await {
            body.extend_from_slice(&piece.map_err(|e| request_error(url, e))?);
        }

        trace!(bytes = body.len(), "chunk body received");
        Ok(body)
    }

    /// Body of `url` as lossy UTF-8, for reading segment headers.
    ///
    /// # Errors
    ///
    /// As [`fetch_chunk`](Self::fetch_chunk).
    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let body = self.fetch_chunk(url).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// `Content-Length` of `url` from a HEAD request.
    ///
    /// # Errors
    ///
    /// [`DownloadError::Probe`] when the header is absent or not a number.
    #[instrument(level = "trace", skip(self), fields(url = %truncate_url(url)))]
    pub async fn content_length(&self, url: &str) -> Result<u64, DownloadError> {
        let response = self.send(Method::HEAD, url).await?;
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| DownloadError::probe(url, "Content-Length"))
    }

    async fn send(&self, method: Method, url: &str) -> Result<Response, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let response = self
            .client
            .request(method, parsed)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "non-success response");
            return Err(DownloadError::http_status(url, status.as_u16()));
        }
        Ok(response)
    }
}

fn request_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

fn build_client(
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
) -> Result<Client, reqwest::Error> {
    ClientBuilder::new()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .timeout(Duration::from_secs(read_timeout_secs))
        .gzip(true)
        .build()
}

/// Shortens a locator URL for log fields; the query strings are very long.
pub(crate) fn truncate_url(url: &str) -> &str {
    const MAX: usize = 120;
    if url.len() <= MAX {
        return url;
    }
    let mut end = MAX;
    while !url.is_char_boundary(end) {
        end -= 1;
    }
    &url[..end]
}
