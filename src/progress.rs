//! Status sink for `streamdl run`: spinner plus structured logs.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use streamdl_core::meter::ThroughputMeter;
use streamdl_core::task::StatusSink;
use streamdl_core::TaskOutcome;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a run ended, as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunEnd {
    Finished(TaskOutcome),
    Stopped,
    WorkerLost,
}

pub(crate) struct ProgressSink {
    spinner: ProgressBar,
    bytes: AtomicU64,
    meter: Mutex<ThroughputMeter>,
    end: watch::Sender<Option<RunEnd>>,
}

impl ProgressSink {
    pub(crate) fn new(show_spinner: bool) -> (Self, watch::Receiver<Option<RunEnd>>) {
        let spinner = if show_spinner {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        } else {
            ProgressBar::hidden()
        };
        let (end, rx) = watch::channel(None);
        let sink = Self {
            spinner,
            bytes: AtomicU64::new(0),
            meter: Mutex::new(ThroughputMeter::new()),
            end,
        };
        (sink, rx)
    }

    fn finish(&self, end: RunEnd) {
        self.with_meter(ThroughputMeter::stop);
        let rate = self.meter.lock().unwrap_or_else(PoisonError::into_inner).mb_per_sec();
        info!(
            ?end,
            bytes = self.bytes.load(Ordering::Relaxed),
            mb_per_sec = format!("{rate:.2}"),
            "run ended"
        );
        self.spinner.finish_and_clear();
        self.end.send_replace(Some(end));
    }

    fn with_meter(&self, f: impl FnOnce(&mut ThroughputMeter)) {
        f(&mut self.meter.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl StatusSink for ProgressSink {
    fn on_process_started(&self, working_dir: &Path) {
        debug!(dir = %working_dir.display(), "worker started");
    }

    fn on_dl_started(&self, index: usize, path: &Path) {
        self.with_meter(ThroughputMeter::start);
        info!(index, path = %path.display(), "stream started");
    }

    fn on_chunk_fetched(&self, index: usize, expected: u64, actual: u64, _url: &str) {
        if expected != actual {
            debug!(index, expected, actual, "chunk size differs from announced size");
        }
        let total = self.bytes.fetch_add(actual, Ordering::Relaxed) + actual;
        self.with_meter(|meter| meter.record(actual));
        let rate = self.meter.lock().unwrap_or_else(PoisonError::into_inner).mb_per_sec();
        #[allow(clippy::cast_precision_loss)]
        let mb = total as f64 / 1_000_000.0;
        self.spinner
            .set_message(format!("{mb:.1} MB fetched ({rate:.2} MB/s)"));
    }

    fn on_dl_finished(&self, index: usize) {
        info!(index, "stream finished");
    }

    fn on_dl_error(&self, index: usize, kind: &str, message: &str) {
        warn!(index, kind, message, "fetch attempt failed");
    }

    fn on_merge_started(&self) {
        self.spinner.set_message("merging streams");
    }

    fn on_merge_finished(&self, status: Option<i32>, diagnostics: &str) {
        if status == Some(0) {
            info!("merge finished");
        } else {
            warn!(?status, diagnostics, "merge failed");
        }
    }

    fn on_process_finished(&self, outcome: TaskOutcome) {
        self.finish(RunEnd::Finished(outcome));
    }

    fn on_process_stopped(&self) {
        self.finish(RunEnd::Stopped);
    }

    fn on_worker_lost(&self) {
        self.finish(RunEnd::WorkerLost);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_event_publishes_end() {
        let (sink, rx) = ProgressSink::new(false);
        assert_eq!(*rx.borrow(), None);
        sink.on_chunk_fetched(0, 10, 10, "https://h/v?range=0-9");
        sink.on_process_finished(TaskOutcome::Success);
        assert_eq!(*rx.borrow(), Some(RunEnd::Finished(TaskOutcome::Success)));
        assert_eq!(sink.bytes.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_worker_lost_publishes_end() {
        let (sink, rx) = ProgressSink::new(false);
        sink.on_worker_lost();
        assert_eq!(*rx.borrow(), Some(RunEnd::WorkerLost));
    }
}
