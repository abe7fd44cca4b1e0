//! External merge step (ffmpeg by default).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::EngineError;

/// How to invoke the merge program.
///
/// The command line is
/// `<program> <leading_args…> [<input_flag>] <input> … <trailing_args…> <output>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeCommand {
    /// Program to run.
    pub program: String,
    /// Arguments before the inputs.
    pub leading_args: Vec<String>,
    /// Flag repeated before every input, if any.
    pub input_flag: Option<String>,
    /// Arguments between the inputs and the output path.
    pub trailing_args: Vec<String>,
}

impl Default for MergeCommand {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            leading_args: vec!["-y".to_string()],
            input_flag: Some("-i".to_string()),
            trailing_args: ["-c", "copy", "-strict", "experimental"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl MergeCommand {
    /// Full argument vector for `inputs` merged into `output`.
    #[must_use]
    pub fn args(&self, inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = self.leading_args.clone();
        for input in inputs {
            if let Some(flag) = &self.input_flag {
                args.push(flag.clone());
            }
            args.push(input.display().to_string());
        }
        args.extend(self.trailing_args.iter().cloned());
        args.push(output.display().to_string());
        args
    }
}

/// Exit status and captured stderr of a merge run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Exit code; `None` when killed by a signal or cancelled.
    pub status: Option<i32>,
    /// Captured stderr.
    pub diagnostics: String,
}

impl MergeReport {
    /// Whether the merge exited with status 0.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs the merge, killing the child if `cancel` fires first.
///
/// stdin is closed so the program can never wait for confirmation.
///
/// # Errors
///
/// [`EngineError::MergeSpawn`] if the program cannot be started.
#[instrument(skip(command, inputs, cancel), fields(program = %command.program, output = %output.display()))]
pub async fn run_merge(
    command: &MergeCommand,
    inputs: &[PathBuf],
    output: &Path,
    cancel: &CancellationToken,
) -> Result<MergeReport, EngineError> {
    let args = command.args(inputs, output);
    debug!(?args, "spawning merge");

    let mut child = Command::new(&command.program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| EngineError::MergeSpawn {
            program: command.program.clone(),
            source,
        })?;

    let stderr = child.stderr.take();
    let collector = tokio::spawn(async move {
        let mut diagnostics = String::new();
        if let Some(mut stderr) = stderr {
            let mut raw = Vec::new();
            stderr.read_to_end(&mut raw).await.ok();
            diagnostics = String::from_utf8_lossy(&raw).into_owned();
        }
        diagnostics
    });

    let status = tokio::select! {
        () = cancel.cancelled() => {
            warn!("merge cancelled, killing child");
            child.kill().await.ok();
            None
        }
        waited = child.wait() => match waited {
            Ok(exit) => exit.code(),
            Err(e) => {
                warn!(error = %e, "failed to wait for merge");
                None
            }
        },
    };

    let diagnostics = collector.await.unwrap_or_default();
    if status == Some(0) {
        info!("merge finished");
    } else {
        warn!(?status, "merge failed");
    }
    Ok(MergeReport {
        status,
        diagnostics,
    })
}
