//! Host-side admission control and message routing.
//!
//! The [`Scheduler`] is a handle to one dispatch task that owns all mutable
//! state: the FIFO queue, the running workers and their channels, and the
//! [`ConsistencyCoordinator`]. Every public call and every inbound worker
//! message becomes a command on that task's channel, so no state is shared.
//!
//! # Lifecycle of a task
//!
//! ```text
//! schedule ─► queued ─(admission: running < cap)─► running ─► process-finished ─► reaped
//!                │                                   │
//!             pause: consumed                     pause: next permission denied
//!             without starting                    ─► process-stopped ─► reaped
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamdl_core::scheduler::{ProcessLauncher, Scheduler, SchedulerConfig, StaticProvider};
//! use streamdl_core::task::{StatusSink, Task};
//!
//! struct Quiet;
//! impl StatusSink for Quiet {}
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     Arc::new(ProcessLauncher::current_exe()?),
//!     Arc::new(StaticProvider::new()),
//! )?;
//! let id = scheduler.schedule(Task::new("item", "/tmp/out.mp4", vec![], Arc::new(Quiet)))?;
//! scheduler.pause(id).await?;
//! scheduler.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod launcher;
mod provider;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::consistency::{ConsistencyCoordinator, RenewalRequest};
use crate::engine::EngineConfig;
use crate::protocol::{Message, MessageReader, Outbox, ProtocolError, WriterHandle, spawn_writer};
use crate::task::{ItemKey, StoredTask, Task, TaskId};

pub use error::{ProviderError, SchedulerError};
pub use launcher::{InProcessLauncher, ProcessLauncher, WorkerHandle, WorkerLauncher, WorkerProcess};
pub use provider::{LocatorProvider, StaticProvider};

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default time workers get to exit after `terminate`.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of running workers.
    pub concurrency: usize,
    /// Grace period between `terminate` and a forced kill on shutdown.
    pub shutdown_grace_ms: u64,
    /// Engine configuration handed to every worker.
    pub engine: EngineConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            engine: EngineConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Checks the concurrency cap.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConcurrency`] outside `1..=100`.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidConcurrency {
                value: self.concurrency,
            })
        }
    }
}

/// Point-in-time counts, mostly for tests and progress displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    /// Tasks waiting for admission.
    pub queued: usize,
    /// Tasks with a live worker.
    pub running: usize,
}

enum Command {
    Schedule(StoredTask),
    Pause {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<SchedulerStatus>,
    },
    Inbound {
        id: TaskId,
        message: Message,
    },
    Closed {
        id: TaskId,
        error: Option<ProtocolError>,
    },
    LocatorsFetched {
        item: ItemKey,
        result: Result<Vec<String>, ProviderError>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the dispatch task. Cheap to share behind an `Arc`.
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    dispatch: JoinHandle<()>,
}

impl Scheduler {
    /// Starts the dispatch task. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConcurrency`] for an out-of-range cap.
    pub fn new(
        config: SchedulerConfig,
        launcher: Arc<dyn WorkerLauncher>,
        provider: Arc<dyn LocatorProvider>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            config,
            launcher,
            provider,
            commands: tx.downgrade(),
            queue: VecDeque::new(),
            paused_queued: HashSet::new(),
            running: HashMap::new(),
            coordinator: ConsistencyCoordinator::new(),
        };
        let dispatch = tokio::spawn(dispatcher.run(rx));
        Ok(Self {
            commands: tx,
            next_id: AtomicU64::new(1),
            dispatch,
        })
    }

    /// Enqueues `task` and returns its id. Never blocks.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] after [`Scheduler::shutdown`].
    pub fn schedule(&self, task: Task) -> Result<TaskId, SchedulerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(Command::Schedule(StoredTask::new(id, task)))?;
        Ok(id)
    }

    /// Pauses task `id`; returns whether it was running.
    ///
    /// A queued task is dropped at admission without ever starting. A running
    /// task is denied its next permission check and reports
    /// `process-stopped`. Unknown and finished ids return `false`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] after [`Scheduler::shutdown`].
    pub async fn pause(&self, id: TaskId) -> Result<bool, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Pause { id, reply })?;
        rx.await.map_err(|_| SchedulerError::ShutDown)
    }

    /// Current queue and running counts.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] after [`Scheduler::shutdown`].
    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| SchedulerError::ShutDown)
    }

    /// Terminates every worker and drops queued tasks.
    ///
    /// Workers get the configured grace period to exit before they (and
    /// their process groups) are killed.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] if already shut down.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| SchedulerError::ShutDown)
    }

    /// Whether the dispatch task has stopped.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.dispatch.is_finished()
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::ShutDown)
    }
}

struct RunningWorker {
    stored: StoredTask,
    outbox: Outbox,
    writer: WriterHandle,
    process: WorkerProcess,
}

/// What to do after routing an inbound message.
enum Followup {
    None,
    Retire,
    QueryUpstream(ItemKey),
}

struct Dispatcher {
    config: SchedulerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    provider: Arc<dyn LocatorProvider>,
    commands: mpsc::WeakUnboundedSender<Command>,
    queue: VecDeque<StoredTask>,
    paused_queued: HashSet<TaskId>,
    running: HashMap<TaskId, RunningWorker>,
    coordinator: ConsistencyCoordinator,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(concurrency = self.config.concurrency, "scheduler started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Schedule(stored) => self.enqueue(stored),
                Command::Pause { id, reply } => {
                    reply.send(self.pause(id)).ok();
                }
                Command::Status { reply } => {
                    reply
                        .send(SchedulerStatus {
                            queued: self.queue.len(),
                            running: self.running.len(),
                        })
                        .ok();
                }
                Command::Inbound { id, message } => self.route(id, message),
                Command::Closed { id, error } => self.closed(id, error),
                Command::LocatorsFetched { item, result } => self.locators_fetched(&item, result),
                Command::Shutdown { reply } => {
                    self.shutdown().await;
                    reply.send(()).ok();
                    break;
                }
            }
        }
        info!("scheduler stopped");
    }

    fn enqueue(&mut self, stored: StoredTask) {
        debug!(task_id = stored.id, item = %stored.task.item, "task scheduled");
        self.queue.push_back(stored);
        self.admit();
    }

    fn admit(&mut self) {
        while self.running.len() < self.config.concurrency {
            let Some(stored) = self.queue.pop_front() else {
                break;
            };
            if self.paused_queued.remove(&stored.id) {
                debug!(task_id = stored.id, "skipping task paused before start");
                continue;
            }
            self.start(stored);
        }
    }

    #[instrument(skip(self, stored), fields(task_id = stored.id, item = %stored.task.item))]
    fn start(&mut self, stored: StoredTask) {
        let id = stored.id;
        let item = &stored.task.item;
        // A fresh start of an item gets fresh consistency, unless another
        // worker for it is still alive and may have renewals queued.
        if !stored.task.is_resumed() && !self.running.values().any(|w| w.stored.task.item == *item) {
            self.coordinator.reset(item);
        }
        let handle = match self.launcher.launch(id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "worker launch failed");
                stored.task.sink().on_worker_lost();
                return;
            }
        };
        let (outbox, writer) = spawn_writer(handle.writer);
        let spec = stored.task.to_spec(&self.config.engine);
        if outbox.send(Message::Start(Box::new(spec))).is_err() {
            warn!("worker channel closed before start");
        }
        if let Some(commands) = self.commands.upgrade() {
            tokio::spawn(read_worker(id, MessageReader::new(handle.reader), commands));
        }
        info!(running = self.running.len() + 1, "worker started");
        self.running.insert(
            id,
            RunningWorker {
                stored,
                outbox,
                writer,
                process: handle.process,
            },
        );
    }

    fn pause(&mut self, id: TaskId) -> bool {
        if let Some(worker) = self.running.get_mut(&id) {
            info!(task_id = id, "pause requested");
            worker.stored.pause_requested = true;
            return true;
        }
        if self.queue.iter().any(|stored| stored.id == id) {
            info!(task_id = id, "queued task paused");
            self.paused_queued.insert(id);
        }
        false
    }

    fn route(&mut self, id: TaskId, message: Message) {
        let Some(worker) = self.running.get_mut(&id) else {
            debug!(task_id = id, code = message.code(), "message from retired worker");
            return;
        };
        let sink = Arc::clone(worker.stored.task.sink());
        let item = &worker.stored.task.item;

        let followup = match message {
            Message::ProcessStarted { working_dir } => {
                sink.on_process_started(&working_dir);
                Followup::None
            }
            Message::DlStarted { index, path } => {
                sink.on_dl_started(index, &path);
                Followup::None
            }
            Message::ChunkFetched {
                index,
                expected,
                actual,
                url,
            } => {
                sink.on_chunk_fetched(index, expected, actual, &url);
                Followup::None
            }
            Message::DlFinished { index } => {
                worker.stored.finished_streams += 1;
                sink.on_dl_finished(index);
                Followup::None
            }
            Message::DlError {
                index,
                kind,
                message,
            } => {
                sink.on_dl_error(index, &kind, &message);
                Followup::None
            }
            Message::MergeStarted => {
                sink.on_merge_started();
                Followup::None
            }
            Message::MergeFinished {
                status,
                diagnostics,
            } => {
                sink.on_merge_finished(status, &diagnostics);
                Followup::None
            }
            Message::ProcessFinished { outcome } => {
                info!(task_id = id, ?outcome, "task finished");
                sink.on_process_finished(outcome);
                Followup::Retire
            }
            Message::ProcessStopped => {
                info!(task_id = id, "task stopped");
                sink.on_process_stopped();
                Followup::Retire
            }
            Message::CanProceedDl { request_id, index } => {
                let allowed = !worker.stored.pause_requested
                    && self.coordinator.is_consistent(item)
                    && sink.can_proceed(index);
                if worker
                    .outbox
                    .send(Message::DlPermission {
                        request_id,
                        allowed,
                    })
                    .is_err()
                {
                    debug!(task_id = id, "permission reply dropped");
                }
                Followup::None
            }
            Message::RenewLink {
                request_id,
                index,
                locator,
                last_successful_url,
            } => {
                let request = RenewalRequest {
                    task_id: id,
                    request_id,
                    index,
                    locator,
                    last_successful_url,
                };
                if self.coordinator.query_renewal(item, request) {
                    Followup::QueryUpstream(item.clone())
                } else {
                    Followup::None
                }
            }
            Message::Terminate => {
                warn!(task_id = id, "worker gave up on the channel");
                Followup::None
            }
            other @ (Message::Start(_)
            | Message::DlPermission { .. }
            | Message::LinkRenewed { .. }
            | Message::RenewFailed { .. }) => {
                warn!(task_id = id, code = other.code(), "protocol violation from worker");
                worker.outbox.terminate();
                Followup::None
            }
        };

        match followup {
            Followup::None => {}
            Followup::Retire => self.retire(id),
            Followup::QueryUpstream(item) => self.query_upstream(item),
        }
    }

    fn closed(&mut self, id: TaskId, error: Option<ProtocolError>) {
        let Some(worker) = self.running.get(&id) else {
            return;
        };
        match &error {
            Some(e) => warn!(task_id = id, error = %e, "worker channel failed"),
            None => warn!(task_id = id, "worker exited without a terminal event"),
        }
        worker.stored.task.sink().on_worker_lost();
        self.retire(id);
    }

    fn retire(&mut self, id: TaskId) {
        let Some(mut worker) = self.running.remove(&id) else {
            return;
        };
        debug!(
            task_id = id,
            finished_streams = worker.stored.finished_streams,
            "reaping worker"
        );
        drop(worker.outbox);
        tokio::spawn(async move {
            worker.process.wait_for_exit().await;
            worker.writer.await.ok();
        });
        self.admit();
    }

    fn query_upstream(&self, item: ItemKey) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let provider = Arc::clone(&self.provider);
        tokio::spawn(async move {
            let result = provider.fetch_locators(&item).await;
            commands.send(Command::LocatorsFetched { item, result }).ok();
        });
    }

    fn locators_fetched(&mut self, item: &ItemKey, result: Result<Vec<String>, ProviderError>) {
        let replies = match result {
            Ok(urls) => self.coordinator.on_locators_fetched(item, &urls),
            Err(e) => self.coordinator.on_fetch_failed(item, &e.to_string()),
        };
        for reply in replies {
            match self.running.get(&reply.task_id) {
                Some(worker) => {
                    if worker.outbox.send(reply.message).is_err() {
                        debug!(task_id = reply.task_id, "renewal reply dropped");
                    }
                }
                None => debug!(task_id = reply.task_id, "renewal reply for retired worker"),
            }
        }
    }

    async fn shutdown(&mut self) {
        info!(
            running = self.running.len(),
            dropped = self.queue.len(),
            "shutting down"
        );
        self.queue.clear();
        self.paused_queued.clear();

        let mut workers: Vec<(TaskId, RunningWorker)> = self.running.drain().collect();
        for (_, worker) in &workers {
            worker.outbox.terminate();
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_grace_ms);
        for (id, worker) in &mut workers {
            if tokio::time::timeout_at(deadline, worker.process.wait_for_exit())
                .await
                .is_err()
            {
                warn!(task_id = *id, "worker ignored terminate, killing");
                worker.process.force_kill().await;
            }
        }
    }
}

async fn read_worker<R>(
    id: TaskId,
    mut reader: MessageReader<R>,
    commands: mpsc::UnboundedSender<Command>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let error = loop {
        match reader.next().await {
            Ok(Some(message)) => {
                if commands.send(Command::Inbound { id, message }).is_err() {
                    return;
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e),
        }
    };
    commands.send(Command::Closed { id, error }).ok();
}
