//! End-to-end CLI tests for the streamdl binary.

use std::io::{BufRead, BufReader, Write};
use std::process::Stdio;

use assert_cmd::Command;
use predicates::prelude::*;
use streamdl_core::protocol::{decode, encode};
use streamdl_core::{EngineConfig, ItemKey, Message, TaskOutcome, TaskSpec};
use tempfile::TempDir;

fn streamdl() -> Command {
    Command::cargo_bin("streamdl").unwrap()
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    streamdl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Resumable chunked media downloads"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("worker").not());
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    streamdl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("streamdl"));
}

#[test]
fn test_run_help_lists_options() {
    streamdl()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--output"))
        .stdout(predicate::str::contains("--max-retries"))
        .stdout(predicate::str::contains("--rpc-timeout"));
}

/// Test that invalid flags cause non-zero exit.
#[test]
fn test_binary_invalid_flag_returns_error() {
    streamdl()
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_run_out_of_range_concurrency_rejected() {
    streamdl()
        .args(["run", "-o", "out.mp4", "-c", "0", "https://example.com/v"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("0"));
}

/// The whole pipeline with a real worker process: an unclassifiable URL
/// fails the task and the exit code reports it.
#[test]
fn test_run_with_unsupported_locator_fails() {
    let temp = TempDir::new().unwrap();
    streamdl()
        .args(["-q", "run", "--temp-dir"])
        .arg(temp.path())
        .arg("-o")
        .arg(temp.path().join("out.mp4"))
        .arg("https://example.com/plain.mp4")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("FetchFailed"));
}

fn start_line(locators: Vec<String>, temp: &TempDir) -> String {
    let spec = TaskSpec {
        item: ItemKey::new("cli-item"),
        destination: temp.path().join("out.mp4"),
        locators,
        config: EngineConfig {
            temp_root: temp.path().to_path_buf(),
            ..EngineConfig::default()
        },
        resume: None,
    };
    encode(&Message::Start(Box::new(spec))).unwrap()
}

/// Drives `streamdl worker` over real pipes, keeping stdin open until the
/// terminal event so the worker does not mistake EOF for a shutdown.
#[test]
fn test_worker_reports_failure_over_stdout() {
    let temp = TempDir::new().unwrap();
    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("streamdl"))
        .args(["-q", "worker"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    let line = start_line(vec!["https://example.com/plain.mp4".to_string()], &temp);
    stdin.write_all(line.as_bytes()).unwrap();
    stdin.flush().unwrap();

    let stdout = BufReader::new(child.stdout.take().unwrap());
    let mut messages = Vec::new();
    for line in stdout.lines() {
        let message = decode(&line.unwrap()).unwrap();
        let terminal = message.is_terminal();
        messages.push(message);
        if terminal {
            break;
        }
    }
    drop(stdin);
    assert!(child.wait().unwrap().success());

    assert!(matches!(&messages[0], Message::DlError { index: 0, .. }));
    assert_eq!(
        messages.last(),
        Some(&Message::ProcessFinished {
            outcome: TaskOutcome::FetchFailed
        })
    );
}

#[test]
fn test_worker_rejects_message_other_than_start() {
    let input = encode(&Message::MergeStarted).unwrap();
    streamdl()
        .args(["-q", "worker"])
        .write_stdin(input)
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .stdout(predicate::str::contains("terminate"));
}

#[test]
fn test_worker_exits_cleanly_on_closed_stdin() {
    streamdl()
        .args(["-q", "worker"])
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}
