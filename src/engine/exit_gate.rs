//! Defers termination while a chunk is being committed to disk.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    closing: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<GateState>,
    idle: Notify,
}

/// Counts in-flight disk commits.
///
/// Each commit holds a [`CommitGuard`]. [`ExitGate::close`] waits until no
/// guard is alive and refuses new ones from then on, so a terminating worker
/// never leaves a half-written chunk behind.
#[derive(Debug, Clone, Default)]
pub struct ExitGate {
    inner: Arc<Inner>,
}

impl ExitGate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a commit. Returns `None` once the gate is closing.
    #[must_use]
    pub fn enter(&self) -> Option<CommitGuard> {
        let mut state = self.lock();
        if state.closing {
            return None;
        }
        state.active += 1;
        Some(CommitGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Whether [`ExitGate::close`] has been called.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.lock().closing
    }

    /// Closes the gate and waits for in-flight commits to finish.
    pub async fn close(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                state.closing = true;
                if state.active == 0 {
                    return;
                }
                debug!(active = state.active, "waiting for in-flight commits");
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks one commit as in flight until dropped.
#[derive(Debug)]
pub struct CommitGuard {
    inner: Arc<Inner>,
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}
