//! Task model shared by the host and the worker.
//!
//! A [`Task`] is what callers hand to the scheduler: destination, item key,
//! raw stream URLs and the two host-side capabilities ([`StatusSink`] and an
//! optional [`Resumer`]). Neither capability crosses the process boundary;
//! the worker only ever sees the serializable [`TaskSpec`], with the resumer
//! frozen into a [`ResumePlan`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::{EngineConfig, TaskOutcome};

/// Scheduler-assigned task identifier.
pub type TaskId = u64;

/// Key of the logical item a task downloads (e.g. the page a set of streams
/// belongs to). Renewals and consistency are tracked per item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    /// Creates an item key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ItemKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Host-side receiver of one task's lifecycle events.
///
/// Methods are called from the scheduler's dispatch task and must not block.
/// Every method has a no-op default so sinks only implement what they need.
#[allow(unused_variables)]
pub trait StatusSink: Send + Sync {
    /// Worker prepared its working directory.
    fn on_process_started(&self, working_dir: &Path) {}

    /// Stream `index` started writing to `path`.
    fn on_dl_started(&self, index: usize, path: &Path) {}

    /// A chunk was committed. `expected` and `actual` may differ.
    fn on_chunk_fetched(&self, index: usize, expected: u64, actual: u64, url: &str) {}

    /// Stream `index` ended (whatever the outcome).
    fn on_dl_finished(&self, index: usize) {}

    /// A fetch attempt failed.
    fn on_dl_error(&self, index: usize, kind: &str, message: &str) {}

    /// The merge subprocess was started.
    fn on_merge_started(&self) {}

    /// The merge subprocess exited.
    fn on_merge_finished(&self, status: Option<i32>, diagnostics: &str) {}

    /// The task reached a terminal outcome.
    fn on_process_finished(&self, outcome: TaskOutcome) {}

    /// The task stopped after a denied permission check (paused).
    fn on_process_stopped(&self) {}

    /// The worker went away without reporting a terminal event.
    fn on_worker_lost(&self) {}

    /// Whether stream `index` may commit its next chunk.
    fn can_proceed(&self, index: usize) -> bool {
        true
    }
}

/// Resume bookkeeping supplied by the caller's persistence layer.
///
/// Consulted once on the host when the task is admitted.
pub trait Resumer: Send + Sync {
    /// Whether a fresh working directory must be created.
    fn should_create_working_dir(&self) -> bool;

    /// Working directory of the previous session.
    fn working_dir_path(&self) -> Option<PathBuf>;

    /// Whether fresh per-stream output files must be created.
    fn should_create_output_files(&self) -> bool;

    /// Per-stream output files of the previous session.
    fn output_file_paths(&self) -> Vec<PathBuf>;

    /// `false` once every stream's completed size equals its expected size.
    fn should_resume(&self) -> bool;

    /// Whether stream `index` made progress in a previous session.
    fn is_resumed(&self, index: usize) -> bool;

    /// URL of the last chunk stream `index` committed.
    fn last_successful_url(&self, index: usize) -> Option<String>;
}

/// Resume state for one stream, as frozen into a [`ResumePlan`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResume {
    /// Whether the stream continues a previous session.
    pub resumed: bool,
    /// URL of the last chunk committed in the previous session.
    pub last_successful_url: Option<String>,
}

/// A [`Resumer`] frozen into plain data so it can travel to the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePlan {
    /// Directory to reuse; `None` creates a fresh one.
    pub working_dir: Option<PathBuf>,
    /// Per-stream files to reuse; `None` derives fresh names.
    pub output_files: Option<Vec<PathBuf>>,
    /// Whether any stream still has bytes to fetch.
    pub should_resume: bool,
    /// Per-stream resume state.
    pub streams: Vec<StreamResume>,
}

impl ResumePlan {
    /// Freezes `resumer` for a task with `stream_count` streams.
    pub fn from_resumer(resumer: &dyn Resumer, stream_count: usize) -> Self {
        let working_dir = if resumer.should_create_working_dir() {
            None
        } else {
            resumer.working_dir_path()
        };
        let output_files = if resumer.should_create_output_files() {
            None
        } else {
            Some(resumer.output_file_paths()).filter(|paths| paths.len() == stream_count)
        };
        let streams = (0..stream_count)
            .map(|index| StreamResume {
                resumed: resumer.is_resumed(index),
                last_successful_url: resumer.last_successful_url(index),
            })
            .collect();

        Self {
            working_dir,
            output_files,
            should_resume: resumer.should_resume(),
            streams,
        }
    }

    /// Whether stream `index` continues a previous session.
    #[must_use]
    pub fn is_resumed(&self, index: usize) -> bool {
        self.streams.get(index).is_some_and(|s| s.resumed)
    }

    /// URL of the last chunk stream `index` committed, if it was resumed.
    #[must_use]
    pub fn last_successful_url(&self, index: usize) -> Option<&str> {
        self.streams
            .get(index)
            .filter(|s| s.resumed)
            .and_then(|s| s.last_successful_url.as_deref())
    }
}

/// Recorded progress of one stream, see [`ResumeSnapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProgress {
    /// Output file, if one was created.
    pub path: Option<PathBuf>,
    /// Declared or measured stream size.
    pub expected_size: u64,
    /// Bytes committed so far.
    pub completed_size: u64,
    /// URL of the last committed chunk.
    pub last_chunk_url: Option<String>,
}

/// Plain-data [`Resumer`] for callers without their own persistence.
///
/// Feed it from `dl-started` / `chunk-fetched` events and hand it back to
/// the scheduler to continue a paused task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    /// Working directory of the paused session.
    pub working_dir: Option<PathBuf>,
    /// Per-stream progress.
    pub streams: Vec<StreamProgress>,
}

impl ResumeSnapshot {
    /// Records a committed chunk for stream `index`.
    pub fn record_chunk(&mut self, index: usize, bytes: u64, url: &str) {
        if self.streams.len() <= index {
            self.streams.resize_with(index + 1, StreamProgress::default);
        }
        let stream = &mut self.streams[index];
        stream.completed_size += bytes;
        stream.last_chunk_url = Some(url.to_string());
    }
}

impl Resumer for ResumeSnapshot {
    fn should_create_working_dir(&self) -> bool {
        self.working_dir.is_none()
    }

    fn working_dir_path(&self) -> Option<PathBuf> {
        self.working_dir.clone()
    }

    fn should_create_output_files(&self) -> bool {
        self.streams.is_empty() || self.streams.iter().any(|s| s.path.is_none())
    }

    fn output_file_paths(&self) -> Vec<PathBuf> {
        self.streams.iter().filter_map(|s| s.path.clone()).collect()
    }

    fn should_resume(&self) -> bool {
        self.streams.is_empty()
            || self
                .streams
                .iter()
                .any(|s| s.expected_size == 0 || s.completed_size < s.expected_size)
    }

    fn is_resumed(&self, index: usize) -> bool {
        self.streams
            .get(index)
            .is_some_and(|s| s.last_chunk_url.is_some())
    }

    fn last_successful_url(&self, index: usize) -> Option<String> {
        self.streams.get(index).and_then(|s| s.last_chunk_url.clone())
    }
}

/// A download request as handed to the scheduler.
#[derive(Clone)]
pub struct Task {
    /// Final merged output path.
    pub destination: PathBuf,
    /// Logical item this task downloads.
    pub item: ItemKey,
    /// Raw stream URLs, typically audio and video.
    pub locators: Vec<String>,
    sink: Arc<dyn StatusSink>,
    resumer: Option<Arc<dyn Resumer>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("destination", &self.destination)
            .field("item", &self.item)
            .field("streams", &self.locators.len())
            .field("resumed", &self.is_resumed())
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Creates a fresh (non-resumed) task.
    pub fn new(
        item: impl Into<ItemKey>,
        destination: impl Into<PathBuf>,
        locators: Vec<String>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            destination: destination.into(),
            item: item.into(),
            locators,
            sink,
            resumer: None,
        }
    }

    /// Attaches resume bookkeeping from a previous session.
    #[must_use]
    pub fn with_resumer(mut self, resumer: Arc<dyn Resumer>) -> Self {
        self.resumer = Some(resumer);
        self
    }

    /// The task's status sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn StatusSink> {
        &self.sink
    }

    /// Whether this task continues a previous session.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resumer.is_some()
    }

    /// Snapshot handed to the worker process.
    #[must_use]
    pub fn to_spec(&self, config: &EngineConfig) -> TaskSpec {
        TaskSpec {
            item: self.item.clone(),
            destination: self.destination.clone(),
            locators: self.locators.clone(),
            config: config.clone(),
            resume: self
                .resumer
                .as_deref()
                .map(|r| ResumePlan::from_resumer(r, self.locators.len())),
        }
    }
}

/// Serializable task snapshot sent to the worker in the `start` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Logical item.
    pub item: ItemKey,
    /// Final merged output path.
    pub destination: PathBuf,
    /// Raw stream URLs.
    pub locators: Vec<String>,
    /// Engine tuning.
    pub config: EngineConfig,
    /// Resume state, present only for resumed tasks.
    pub resume: Option<ResumePlan>,
}

/// A [`Task`] owned by the scheduler, identified by its id only.
#[derive(Debug)]
pub struct StoredTask {
    /// Scheduler-assigned id.
    pub id: TaskId,
    /// The task.
    pub task: Task,
    /// Streams that reported `dl-finished`.
    pub finished_streams: usize,
    /// Set by `pause()`; the next permission check is denied.
    pub pause_requested: bool,
}

impl StoredTask {
    /// Wraps a task under `id`.
    #[must_use]
    pub fn new(id: TaskId, task: Task) -> Self {
        Self {
            id,
            task,
            finished_streams: 0,
            pause_requested: false,
        }
    }
}

impl PartialEq for StoredTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for StoredTask {}

impl Hash for StoredTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
