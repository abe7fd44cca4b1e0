//! Starting and stopping worker processes.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::SchedulerError;
use crate::task::TaskId;
use crate::worker::run_worker;

/// A started worker: its duplex channel plus a handle to stop it.
pub struct WorkerHandle {
    /// Worker to host half.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Host to worker half.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// The running worker.
    pub process: WorkerProcess,
}

/// What runs the worker.
#[derive(Debug)]
pub enum WorkerProcess {
    /// A child process.
    Child(Child),
    /// A task in this process (tests, embedding).
    Task(JoinHandle<()>),
}

impl WorkerProcess {
    /// Waits until the worker has exited.
    pub async fn wait_for_exit(&mut self) {
        match self {
            Self::Child(child) => {
                if let Err(e) = child.wait().await {
                    warn!(error = %e, "failed to wait for worker");
                }
            }
            Self::Task(handle) => {
                handle.await.ok();
            }
        }
    }

    /// Kills the worker and everything it started.
    pub async fn force_kill(&mut self) {
        match self {
            Self::Child(child) => {
                #[cfg(unix)]
                if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
                    // SAFETY: plain syscall; the worker leads its own process group.
                    let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
                    if rc != 0 {
                        debug!(pid, "killpg failed, falling back to kill");
                    }
                }
                child.kill().await.ok();
            }
            Self::Task(handle) => handle.abort(),
        }
    }
}

/// Starts workers for admitted tasks.
pub trait WorkerLauncher: Send + Sync {
    /// Starts the worker for task `id`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Launch`] if the worker cannot be started.
    fn launch(&self, id: TaskId) -> Result<WorkerHandle, SchedulerError>;
}

/// Re-executes a binary with the `worker` subcommand; stdin/stdout carry
/// the control channel and the child leads its own process group.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Launches `program worker`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
        }
    }

    /// Launches the running binary.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Launch`] if the executable path is unknown.
    pub fn current_exe() -> Result<Self, SchedulerError> {
        std::env::current_exe()
            .map(Self::new)
            .map_err(SchedulerError::Launch)
    }

    /// Replaces the arguments passed to the program.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, id: TaskId) -> Result<WorkerHandle, SchedulerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(SchedulerError::Launch)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SchedulerError::Launch(std::io::Error::other(
                "worker stdio not captured",
            )));
        };
        debug!(task_id = id, pid = child.id(), "worker process started");

        Ok(WorkerHandle {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: WorkerProcess::Child(child),
        })
    }
}

/// Runs workers as tasks in this process over an in-memory duplex channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessLauncher;

/// Buffer size of the in-memory channel.
const DUPLEX_BUFFER: usize = 64 * 1024;

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, id: TaskId) -> Result<WorkerHandle, SchedulerError> {
        let (host, worker) = tokio::io::duplex(DUPLEX_BUFFER);
        let (host_read, host_write) = tokio::io::split(host);
        let (worker_read, worker_write) = tokio::io::split(worker);

        let task = tokio::spawn(async move {
            match run_worker(worker_read, worker_write).await {
                Ok(exit) => debug!(task_id = id, ?exit, "in-process worker exited"),
                Err(e) => warn!(task_id = id, error = %e, "in-process worker failed"),
            }
        });

        Ok(WorkerHandle {
            reader: Box::new(host_read),
            writer: Box::new(host_write),
            process: WorkerProcess::Task(task),
        })
    }
}
