//! CLI entry point for the stream downloader.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use streamdl_core::engine::MergeCommand;
use streamdl_core::scheduler::{ProcessLauncher, StaticProvider};
use streamdl_core::worker::{WorkerExit, run_worker};
use streamdl_core::{EngineConfig, Scheduler, SchedulerConfig, Task};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

mod cli;
mod progress;

use cli::{Args, Command, RunArgs};
use progress::{ProgressSink, RunEnd};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // stdout is the control channel in worker mode; logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    match args.command {
        Command::Worker => {
            // The stdin reader is a blocking thread that would keep the
            // runtime alive after the session; leave without waiting for it.
            let code = match worker().await {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "worker failed");
                    1
                }
            };
            std::process::exit(code);
        }
        Command::Run(run_args) => run(run_args, args.quiet).await,
    }
}

async fn worker() -> Result<()> {
    let exit = run_worker(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("worker control channel failed")?;
    match exit {
        WorkerExit::Finished(outcome) => debug!(?outcome, "worker done"),
        WorkerExit::Terminated => debug!("worker terminated by host"),
    }
    Ok(())
}

fn scheduler_config(args: &RunArgs) -> SchedulerConfig {
    let mut engine = EngineConfig {
        max_retries: args.max_retries,
        retry_delay_ms: args.retry_delay,
        cleanup: !args.keep_temp,
        merge: MergeCommand {
            program: args.ffmpeg.clone(),
            ..MergeCommand::default()
        },
        rpc_timeout_ms: args.rpc_timeout,
        ..EngineConfig::default()
    };
    if let Some(temp_dir) = &args.temp_dir {
        engine.temp_root.clone_from(temp_dir);
    }
    SchedulerConfig {
        concurrency: usize::from(args.concurrency),
        shutdown_grace_ms: args.shutdown_grace,
        engine,
    }
}

async fn wait_end(ended: &mut watch::Receiver<Option<RunEnd>>) -> Option<RunEnd> {
    ended.wait_for(Option::is_some).await.ok().and_then(|end| *end)
}

async fn run(args: RunArgs, quiet: bool) -> Result<()> {
    info!(streams = args.urls.len(), output = %args.output.display(), "Streamdl starting");

    let item = args
        .item
        .clone()
        .unwrap_or_else(|| args.output.display().to_string());
    let provider = StaticProvider::new().with_item(item.as_str(), args.urls.clone());
    let launcher = ProcessLauncher::current_exe().context("cannot locate own executable")?;
    let scheduler = Scheduler::new(scheduler_config(&args), Arc::new(launcher), Arc::new(provider))?;

    let show_spinner = !quiet && std::io::stderr().is_terminal();
    let (sink, mut ended) = ProgressSink::new(show_spinner);
    let task = Task::new(item, &args.output, args.urls, Arc::new(sink));
    let id = scheduler.schedule(task)?;

    let end = tokio::select! {
        end = wait_end(&mut ended) => end,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, pausing download");
            scheduler.pause(id).await.ok();
            // Give the worker a moment to acknowledge before the hard stop.
            tokio::time::timeout(Duration::from_secs(2), wait_end(&mut ended))
                .await
                .ok()
                .flatten()
        }
    };

    scheduler.shutdown().await.ok();

    match end {
        Some(RunEnd::Finished(outcome)) if outcome.is_success() => {
            info!(output = %args.output.display(), "Download complete");
            Ok(())
        }
        Some(RunEnd::Finished(outcome)) => bail!("download failed: {outcome:?}"),
        Some(RunEnd::Stopped) | None => bail!("download stopped before completion"),
        Some(RunEnd::WorkerLost) => bail!("worker exited unexpectedly"),
    }
}
