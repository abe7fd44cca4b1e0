//! Per-task transfer engine.
//!
//! The [`TransferEngine`] runs inside a worker process and drives one task
//! end to end:
//!
//! 1. classify every raw URL into a [`MediaLocator`] (resumed ones are
//!    positioned after their last committed chunk)
//! 2. prepare the working directory and stream files
//! 3. fetch every stream concurrently, chunk by chunk, asking the host for
//!    permission before each commit and for a fresh locator when the current
//!    one expires mid-transfer
//! 4. merge the streams into the destination with an external program
//!
//! Everything the host needs to know is reported through an [`EventSink`].
//! Retries are hidden; only exhaustion surfaces as a terminal outcome.

mod exit_gate;
mod merge;
mod stream;
mod workdir;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::download::constants::{CONNECT_TIMEOUT_SECS, MAX_RANGE_CHUNK_BYTES, READ_TIMEOUT_SECS};
use crate::download::{DEFAULT_MAX_RETRIES, HttpClient, RetryPolicy};
use crate::locator::MediaLocator;
use crate::protocol::{EventSink, Message};
use crate::task::TaskSpec;

pub use exit_gate::{CommitGuard, ExitGate};
pub use merge::{MergeCommand, MergeReport, run_merge};
pub use workdir::{Workspace, dir_name};

use stream::{StreamFetcher, StreamOutcome, locator_error_kind};

/// Default delay between chunk attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Terminal outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    /// Every stream completed and the merge succeeded.
    Success,
    /// A stream could not be fetched (retries exhausted or unusable locator).
    FetchFailed,
    /// The merge program failed; stream files are kept for another try.
    MergeFailed,
    /// A permission check was denied (the task was paused).
    PermissionDenied,
    /// The item's locators changed kind during renewal; restart from scratch.
    InconsistentRenew,
}

impl TaskOutcome {
    /// Whether the task completed.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Engine tuning, carried to the worker inside the task snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per chunk, including the first.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay_ms: u64,
    /// Root under which working directories are created.
    pub temp_root: PathBuf,
    /// Remove stream files after a successful merge and discard partial
    /// output after an inconsistent renewal.
    pub cleanup: bool,
    /// Largest byte window requested from a range-addressed stream.
    pub chunk_ceiling: u64,
    /// Merge program invocation.
    pub merge: MergeCommand,
    /// Connect timeout for chunk requests.
    pub connect_timeout_secs: u64,
    /// Read timeout for chunk requests.
    pub read_timeout_secs: u64,
    /// Limit on how long an RPC waits for the host. `None` waits forever.
    pub rpc_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            temp_root: std::env::temp_dir().join("streamdl"),
            cleanup: true,
            chunk_ceiling: MAX_RANGE_CHUNK_BYTES,
            merge: MergeCommand::default(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            rpc_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    /// Retry policy for chunk fetches: fixed delay, no jitter.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }

    /// RPC timeout as a duration.
    #[must_use]
    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout_ms.map(Duration::from_millis)
    }
}

/// Errors raised while setting a task up or merging it.
///
/// Stream-level failures are not errors; they become [`TaskOutcome`]s.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The working directory could not be created.
    #[error("failed to prepare working directory {path}: {source}")]
    Workspace {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The merge program could not be started.
    #[error("failed to start merge program {program}: {source}")]
    MergeSpawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Short machine-readable kind, as reported in `dl-error`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Workspace { .. } => "io",
            Self::MergeSpawn { .. } => "merge_spawn",
        }
    }
}

/// Drives one task to a [`TaskOutcome`].
pub struct TransferEngine {
    spec: TaskSpec,
    events: Arc<dyn EventSink>,
    gate: ExitGate,
    cancel: CancellationToken,
    client: HttpClient,
}

impl TransferEngine {
    /// Creates an engine for `spec`, reporting through `events`.
    #[must_use]
    pub fn new(spec: TaskSpec, events: Arc<dyn EventSink>) -> Self {
        let client = HttpClient::new_with_timeouts(
            spec.config.connect_timeout_secs,
            spec.config.read_timeout_secs,
        );
        Self {
            spec,
            events,
            gate: ExitGate::new(),
            cancel: CancellationToken::new(),
            client,
        }
    }

    /// Gate bracketing every disk commit; close it before exiting.
    #[must_use]
    pub fn exit_gate(&self) -> ExitGate {
        self.gate.clone()
    }

    /// Token that kills a running merge when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the task and reports its terminal event.
    #[instrument(skip(self), fields(item = %self.spec.item, streams = self.spec.locators.len()))]
    pub async fn run(self) -> TaskOutcome {
        let outcome = self.execute().await;
        match outcome {
            TaskOutcome::PermissionDenied => self.events.notify(Message::ProcessStopped),
            outcome => self.events.notify(Message::ProcessFinished { outcome }),
        }
        info!(?outcome, "task finished");
        outcome
    }

    async fn execute(&self) -> TaskOutcome {
        let config = &self.spec.config;
        let plan = self.spec.resume.as_ref();

        let mut locators = Vec::with_capacity(self.spec.locators.len());
        for (index, raw) in self.spec.locators.iter().enumerate() {
            match self.build_locator(index, raw) {
                Ok(locator) => locators.push(locator),
                Err((kind, message)) => {
                    warn!(index, %message, "failed to initialise stream");
                    self.events.notify(Message::DlError {
                        index,
                        kind: kind.to_string(),
                        message,
                    });
                    return TaskOutcome::FetchFailed;
                }
            }
        }

        let extensions: Vec<&str> = locators.iter().map(MediaLocator::file_extension).collect();
        let workspace =
            match workdir::prepare(&config.temp_root, &self.spec.item, &extensions, plan).await {
                Ok(workspace) => workspace,
                Err(e) => {
                    warn!(error = %e, "failed to prepare workspace");
                    for index in 0..locators.len() {
                        self.events.notify(Message::DlError {
                            index,
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        });
                    }
                    return TaskOutcome::FetchFailed;
                }
            };
        self.events.notify(Message::ProcessStarted {
            working_dir: workspace.dir.clone(),
        });

        if plan.is_some_and(|p| !p.should_resume) {
            info!("every stream already complete, skipping to merge");
        } else {
            let outcomes = self.fetch_streams(locators, &workspace).await;
            if let Some(outcome) = decide(&outcomes) {
                if outcome == TaskOutcome::InconsistentRenew && config.cleanup {
                    workdir::discard(&workspace).await;
                }
                return outcome;
            }
        }

        self.merge(&workspace).await
    }

    fn build_locator(&self, index: usize, raw: &str) -> Result<MediaLocator, (&'static str, String)> {
        let mut locator = MediaLocator::parse(raw).map_err(|e| (locator_error_kind(&e), e.to_string()))?;
        locator.set_chunk_ceiling(self.spec.config.chunk_ceiling);
        if let Some(last) = self
            .spec
            .resume
            .as_ref()
            .and_then(|p| p.last_successful_url(index))
        {
            locator
                .resume_after(last)
                .map_err(|e| (locator_error_kind(&e), e.to_string()))?;
        }
        Ok(locator)
    }

    async fn fetch_streams(
        &self,
        locators: Vec<MediaLocator>,
        workspace: &Workspace,
    ) -> Vec<StreamOutcome> {
        let plan = self.spec.resume.as_ref();
        // Dropping the set aborts every stream, so an aborted engine leaves
        // no fetcher running behind it.
        let mut streams = JoinSet::new();
        let count = locators.len();
        for (index, (locator, path)) in locators
            .into_iter()
            .zip(workspace.files.iter().cloned())
            .enumerate()
        {
            let fetcher = StreamFetcher {
                index,
                last_successful_url: plan
                    .and_then(|p| p.last_successful_url(index))
                    .map(str::to_string),
                locator,
                path,
                client: self.client.clone(),
                policy: self.spec.config.retry_policy(),
                events: Arc::clone(&self.events),
                gate: self.gate.clone(),
            };
            streams.spawn(async move { (index, fetcher.run().await) });
        }

        let mut outcomes = vec![StreamOutcome::FetchFailed; count];
        while let Some(joined) = streams.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = outcome,
                Err(e) => warn!(error = %e, "stream task panicked"),
            }
        }
        outcomes
    }

    async fn merge(&self, workspace: &Workspace) -> TaskOutcome {
        let config = &self.spec.config;
        self.events.notify(Message::MergeStarted);
        let report = match run_merge(
            &config.merge,
            &workspace.files,
            &self.spec.destination,
            &self.cancel,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => MergeReport {
                status: None,
                diagnostics: e.to_string(),
            },
        };
        self.events.notify(Message::MergeFinished {
            status: report.status,
            diagnostics: report.diagnostics.clone(),
        });

        if !report.succeeded() {
            return TaskOutcome::MergeFailed;
        }
        if config.cleanup {
            workdir::discard(workspace).await;
        }
        TaskOutcome::Success
    }
}

/// Folds per-stream outcomes; `None` means every stream completed.
///
/// Precedence: inconsistent renewal, then permission denial, then fetch
/// failure. A terminated stream counts as a denial (no merge).
fn decide(outcomes: &[StreamOutcome]) -> Option<TaskOutcome> {
    let any = |wanted: &[StreamOutcome]| outcomes.iter().any(|o| wanted.contains(o));
    if any(&[StreamOutcome::Inconsistent]) {
        Some(TaskOutcome::InconsistentRenew)
    } else if any(&[StreamOutcome::PermissionDenied, StreamOutcome::Terminated]) {
        Some(TaskOutcome::PermissionDenied)
    } else if any(&[StreamOutcome::FetchFailed]) {
        Some(TaskOutcome::FetchFailed)
    } else {
        None
    }
}
