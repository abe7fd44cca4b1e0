//! HTTP fetch layer for chunked media transfers.
//!
//! This module provides the primitives the transfer engine and the media
//! locators build on: a pooled HTTP client that fetches one chunk (or probes
//! one segment) at a time, the retry policy applied per chunk, and the error
//! taxonomy used to decide whether a failure is worth retrying.
//!
//! # Example
//!
//! ```no_run
//! use streamdl_core::download::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let body = client.fetch_chunk("https://example.com/videoplayback?range=0-1999").await?;
//! println!("fetched {} bytes", body.len());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod retry;

pub use client::HttpClient;
pub(crate) use client::truncate_url;
pub use error::DownloadError;
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
