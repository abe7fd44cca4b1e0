//! Streamdl Core Library
//!
//! Resumable, chunked media downloads driven by an admission-controlled pool
//! of worker processes.
//!
//! # Architecture
//!
//! The library is organized into the following modules, leaf to root:
//! - [`download`] - HTTP client, retry policy and error taxonomy
//! - [`locator`] - Range- and segment-addressed media locators
//! - [`engine`] - Per-task transfer engine (stream fetch, renewal, merge)
//! - [`protocol`] - Typed host/worker control protocol over a duplex channel
//! - [`consistency`] - Per-item renewal coalescing and consistency tracking
//! - [`scheduler`] - Host-side admission control and message routing
//!
//! Supporting modules: [`task`] (task model, resume and status capabilities),
//! [`worker`] (worker process entry point) and [`meter`] (throughput).

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod consistency;
pub mod download;
pub mod engine;
pub mod locator;
pub mod meter;
pub mod protocol;
pub mod scheduler;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use consistency::{ConsistencyCoordinator, RenewalReply, RenewalRequest};
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, FailureType, HttpClient, RetryDecision, RetryPolicy,
    classify_error,
};
pub use engine::{EngineConfig, EngineError, MergeCommand, TaskOutcome, TransferEngine};
pub use locator::{Chunk, ChunkPosition, LocatorError, LocatorKind, MediaLocator};
pub use meter::ThroughputMeter;
pub use protocol::{EventSink, Message, ProtocolError, RenewOutcome};
pub use scheduler::{
    DEFAULT_CONCURRENCY, InProcessLauncher, LocatorProvider, ProcessLauncher, ProviderError,
    Scheduler, SchedulerConfig, SchedulerError, StaticProvider, WorkerLauncher,
};
pub use task::{
    ItemKey, ResumePlan, ResumeSnapshot, Resumer, StatusSink, StoredTask, Task, TaskId, TaskSpec,
};
