//! Typed control protocol between the host and a worker process.
//!
//! # Wire format
//!
//! Newline-delimited JSON over a duplex byte channel (the worker's
//! stdin/stdout). Each line is one [`Message`], tagged by `code` with its
//! fields under `payload`:
//!
//! ```text
//! {"code":"can-proceed-dl","payload":{"request_id":7,"index":1}}
//! {"code":"dl-permission","payload":{"request_id":7,"allowed":true}}
//! {"code":"terminate"}
//! ```
//!
//! Worker to host traffic is mostly fire-and-forget events. Two calls are
//! synchronous RPCs (`can-proceed-dl` and `renew-link`): the caller suspends
//! until a reply carrying the same `request_id` arrives. Unknown codes and
//! malformed lines are protocol violations.

mod client;
mod codec;
mod error;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::TaskOutcome;
use crate::task::TaskSpec;

pub use client::{ControlClient, Delivery, EventSink, RenewOutcome};
pub use codec::{MessageReader, Outbox, WriterHandle, decode, encode, spawn_writer};
pub use error::ProtocolError;

/// Correlation id of an RPC.
pub type RequestId = u64;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    // host -> worker
    /// First message on every channel.
    Start(Box<TaskSpec>),
    /// Reply to [`Message::CanProceedDl`].
    DlPermission {
        /// Echoed correlation id.
        request_id: RequestId,
        /// Whether the stream may continue.
        allowed: bool,
    },
    /// Successful reply to [`Message::RenewLink`].
    LinkRenewed {
        /// Echoed correlation id.
        request_id: RequestId,
        /// Re-addressed locator URL.
        locator: String,
        /// `false` once the item saw a locator kind change.
        consistent: bool,
    },
    /// Failed reply to [`Message::RenewLink`].
    RenewFailed {
        /// Echoed correlation id.
        request_id: RequestId,
        /// Why no locator could be produced.
        reason: String,
    },

    // worker -> host events
    /// Working directory is ready.
    ProcessStarted {
        /// The directory holding the stream files.
        working_dir: PathBuf,
    },
    /// A stream started.
    DlStarted {
        /// Stream index.
        index: usize,
        /// Stream file.
        path: PathBuf,
    },
    /// A chunk was committed to disk.
    ChunkFetched {
        /// Stream index.
        index: usize,
        /// Size the locator announced.
        expected: u64,
        /// Size actually written.
        actual: u64,
        /// Chunk URL, recorded for resuming.
        url: String,
    },
    /// A stream ended.
    DlFinished {
        /// Stream index.
        index: usize,
    },
    /// A fetch attempt failed.
    DlError {
        /// Stream index.
        index: usize,
        /// Short machine-readable error kind.
        kind: String,
        /// Human-readable message.
        message: String,
    },
    /// The merge subprocess started.
    MergeStarted,
    /// The merge subprocess exited.
    MergeFinished {
        /// Exit code, `None` if killed by a signal.
        status: Option<i32>,
        /// Captured stderr.
        diagnostics: String,
    },
    /// The task reached a terminal outcome.
    ProcessFinished {
        /// The outcome.
        outcome: TaskOutcome,
    },
    /// The task stopped after a denied permission check.
    ProcessStopped,

    // worker -> host RPCs
    /// May stream `index` commit its next chunk?
    CanProceedDl {
        /// Correlation id.
        request_id: RequestId,
        /// Stream index.
        index: usize,
    },
    /// Stream `index` found its locator expired.
    RenewLink {
        /// Correlation id.
        request_id: RequestId,
        /// Stream index.
        index: usize,
        /// Current (expired) locator URL.
        locator: String,
        /// URL of the last chunk the stream committed.
        last_successful_url: Option<String>,
    },

    // both directions
    /// Stop now. Preempts every queued message.
    Terminate,
}

impl Message {
    /// Wire code of this message.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::DlPermission { .. } => "dl-permission",
            Self::LinkRenewed { .. } => "link-renewed",
            Self::RenewFailed { .. } => "renew-failed",
            Self::ProcessStarted { .. } => "process-started",
            Self::DlStarted { .. } => "dl-started",
            Self::ChunkFetched { .. } => "chunk-fetched",
            Self::DlFinished { .. } => "dl-finished",
            Self::DlError { .. } => "dl-error",
            Self::MergeStarted => "merge-started",
            Self::MergeFinished { .. } => "merge-finished",
            Self::ProcessFinished { .. } => "process-finished",
            Self::ProcessStopped => "process-stopped",
            Self::CanProceedDl { .. } => "can-proceed-dl",
            Self::RenewLink { .. } => "renew-link",
            Self::Terminate => "terminate",
        }
    }

    /// Whether this message ends the worker's task.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ProcessFinished { .. } | Self::ProcessStopped)
    }
}
