//! One stream's fetch loop.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::ExitGate;
use crate::download::{
    DownloadError, FailureType, HttpClient, RetryDecision, RetryPolicy, classify_error,
    truncate_url,
};
use crate::locator::{Chunk, LocatorError, MediaLocator};
use crate::protocol::{EventSink, Message, ProtocolError, RenewOutcome};

/// How one stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamOutcome {
    Completed,
    FetchFailed,
    PermissionDenied,
    Inconsistent,
    Terminated,
}

enum Fetched {
    Body(Vec<u8>),
    Expired,
    Exhausted,
}

enum Renewed {
    Continue,
    Stop(StreamOutcome),
}

/// Fetches one stream into its file.
pub(crate) struct StreamFetcher {
    pub(crate) index: usize,
    pub(crate) locator: MediaLocator,
    pub(crate) path: PathBuf,
    pub(crate) last_successful_url: Option<String>,
    pub(crate) client: HttpClient,
    pub(crate) policy: RetryPolicy,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) gate: ExitGate,
}

impl StreamFetcher {
    #[instrument(skip(self), fields(index = self.index, kind = %self.locator.kind()))]
    pub(crate) async fn run(mut self) -> StreamOutcome {
        self.events.notify(Message::DlStarted {
            index: self.index,
            path: self.path.clone(),
        });
        let outcome = self.fetch_all().await;
        info!(?outcome, "stream ended");
        self.events.notify(Message::DlFinished { index: self.index });
        outcome
    }

    async fn fetch_all(&mut self) -> StreamOutcome {
        let mut file = match self.open_file().await {
            Ok(file) => file,
            Err(e) => {
                self.report_error(&e);
                return StreamOutcome::FetchFailed;
            }
        };

        // Renewals without a committed chunk in between.
        let mut renewals_in_a_row = 0;
        'chunks: loop {
            let chunks = match self.locator.generate_chunks(&self.client).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    self.report(e.to_string(), locator_error_kind(&e));
                    return StreamOutcome::FetchFailed;
                }
            };

            for chunk in chunks {
                let body = match self.fetch_with_retry(&chunk).await {
                    Fetched::Body(body) => body,
                    Fetched::Exhausted => return StreamOutcome::FetchFailed,
                    Fetched::Expired => {
                        renewals_in_a_row += 1;
                        if renewals_in_a_row > self.policy.max_attempts() {
                            warn!(renewals_in_a_row, "locator keeps expiring");
                            return StreamOutcome::FetchFailed;
                        }
                        match self.renew().await {
                            Renewed::Continue => continue 'chunks,
                            Renewed::Stop(outcome) => return outcome,
                        }
                    }
                };
                renewals_in_a_row = 0;

                match self.events.can_proceed(self.index).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("permission denied, stopping stream");
                        return StreamOutcome::PermissionDenied;
                    }
                    Err(ProtocolError::Timeout { .. }) => {
                        warn!("host did not answer permission request, stopping stream");
                        return StreamOutcome::PermissionDenied;
                    }
                    Err(e) => return self.rpc_failed(&e),
                }

                let Some(_commit) = self.gate.enter() else {
                    return StreamOutcome::Terminated;
                };
                if let Err(source) = commit(&mut file, &body).await {
                    self.report_error(&DownloadError::io(&self.path, source));
                    return StreamOutcome::FetchFailed;
                }
                self.last_successful_url = Some(chunk.url.clone());
                self.events.notify(Message::ChunkFetched {
                    index: self.index,
                    expected: chunk.expected_len,
                    actual: body.len() as u64,
                    url: chunk.url,
                });
            }
            return StreamOutcome::Completed;
        }
    }

    async fn open_file(&self) -> Result<File, DownloadError> {
        let mut options = OpenOptions::new();
        options.create(true);
        if self.locator.is_resumed() {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        options
            .open(&self.path)
            .await
            .map_err(|source| DownloadError::io(&self.path, source))
    }

    async fn fetch_with_retry(&self, chunk: &Chunk) -> Fetched {
        let mut attempt = 1;
        loop {
            let error = match self.client.fetch_chunk(&chunk.url).await {
                Ok(body) if !body.is_empty() => return Fetched::Body(body),
                Ok(_) if self.locator.is_expired() => {
                    debug!("empty body from expired locator");
                    return Fetched::Expired;
                }
                Ok(_) => {
                    self.report("empty response body".to_string(), "empty_body");
                    None
                }
                Err(e) if classify_error(&e) == FailureType::Forbidden && self.locator.is_expired() => {
                    debug!(status = ?e.status(), "forbidden from expired locator");
                    return Fetched::Expired;
                }
                Err(e) => {
                    self.report_error(&e);
                    Some(e)
                }
            };

            let failure = error
                .as_ref()
                .map_or(FailureType::Transient, classify_error);
            match self.policy.should_retry(failure, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    debug!(attempt, delay_ms = delay.as_millis(), "retrying chunk");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(attempt, reason = %reason, url = %truncate_url(&chunk.url), "chunk failed");
                    return Fetched::Exhausted;
                }
            }
        }
    }

    async fn renew(&mut self) -> Renewed {
        info!("locator expired, requesting renewal");
        let reply = self
            .events
            .renew_link(
                self.index,
                self.locator.raw_url(),
                self.last_successful_url.as_deref(),
            )
            .await;

        match reply {
            Ok(RenewOutcome::Renewed {
                consistent: false, ..
            }) => {
                warn!("item locators changed kind, aborting stream");
                Renewed::Stop(StreamOutcome::Inconsistent)
            }
            Ok(RenewOutcome::Renewed { locator, .. }) => {
                let applied = MediaLocator::parse(&locator).and_then(|fresh| {
                    self.locator
                        .renew(&fresh, self.last_successful_url.as_deref())
                });
                match applied {
                    Ok(()) => {
                        debug!(expiry = self.locator.expiry(), "locator renewed");
                        Renewed::Continue
                    }
                    Err(e) => {
                        self.report(e.to_string(), locator_error_kind(&e));
                        if matches!(e, LocatorError::KindMismatch { .. }) {
                            Renewed::Stop(StreamOutcome::Inconsistent)
                        } else {
                            Renewed::Stop(StreamOutcome::FetchFailed)
                        }
                    }
                }
            }
            Ok(RenewOutcome::Failed { reason }) => {
                self.report(reason, "renew_failed");
                Renewed::Stop(StreamOutcome::FetchFailed)
            }
            Err(e) => Renewed::Stop(self.rpc_failed(&e)),
        }
    }

    fn rpc_failed(&self, error: &ProtocolError) -> StreamOutcome {
        if matches!(error, ProtocolError::Terminated) {
            return StreamOutcome::Terminated;
        }
        self.report(error.to_string(), "protocol");
        StreamOutcome::FetchFailed
    }

    fn report_error(&self, error: &DownloadError) {
        self.report(error.to_string(), error.kind());
    }

    fn report(&self, message: String, kind: &str) {
        self.events.notify(Message::DlError {
            index: self.index,
            kind: kind.to_string(),
            message,
        });
    }
}

async fn commit(file: &mut File, body: &[u8]) -> std::io::Result<()> {
    file.write_all(body).await?;
    file.flush().await
}

pub(crate) fn locator_error_kind(error: &LocatorError) -> &'static str {
    match error {
        LocatorError::UnsupportedFormat { .. } => "unsupported_format",
        LocatorError::KindMismatch { .. } => "kind_mismatch",
        LocatorError::Probe(e) => e.kind(),
    }
}
