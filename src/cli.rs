//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use streamdl_core::scheduler::DEFAULT_SHUTDOWN_GRACE_MS;
use streamdl_core::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES};

/// Resumable chunked media downloads.
///
/// Fetches every stream of an item in a worker process, renewing expired
/// stream URLs mid-transfer, then merges the streams with ffmpeg.
#[derive(Parser, Debug)]
#[command(name = "streamdl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one item from its raw stream URLs
    Run(RunArgs),

    /// Worker process entry point (control protocol on stdin/stdout)
    #[command(hide = true)]
    Worker,
}

/// Arguments of `streamdl run`.
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Raw stream URLs, typically one audio and one video stream
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Merged output file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Item key used for renewal bookkeeping (defaults to the output path)
    #[arg(long)]
    pub item: Option<String>,

    /// Maximum concurrent workers (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Attempts per chunk before the stream fails (1-100)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub max_retries: u32,

    /// Delay between chunk attempts in milliseconds (max 60000)
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub retry_delay: u64,

    /// Directory under which working directories are created
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Keep stream files after a successful merge
    #[arg(long)]
    pub keep_temp: bool,

    /// Merge program
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Give up on an unanswered host call after this many milliseconds
    #[arg(long)]
    pub rpc_timeout: Option<u64>,

    /// Milliseconds workers get to exit on shutdown before being killed
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE_MS)]
    pub shutdown_grace: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["streamdl", "run", "-o", "out.mp4", "https://a/v?x=1"];
        argv.extend_from_slice(extra);
        match Args::try_parse_from(argv).unwrap().command {
            Command::Run(args) => args,
            Command::Worker => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_run_defaults() {
        let args = run(&[]);
        assert_eq!(args.urls, ["https://a/v?x=1"]);
        assert_eq!(args.output, PathBuf::from("out.mp4"));
        assert_eq!(args.concurrency, 10);
        assert_eq!(args.max_retries, 25);
        assert_eq!(args.retry_delay, 500);
        assert_eq!(args.ffmpeg, "ffmpeg");
        assert_eq!(args.rpc_timeout, None);
        assert_eq!(args.shutdown_grace, 5_000);
        assert!(!args.keep_temp);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["streamdl", "-v", "worker"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["streamdl", "worker", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["streamdl", "--quiet", "worker"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_worker_subcommand() {
        let args = Args::try_parse_from(["streamdl", "worker"]).unwrap();
        assert!(matches!(args.command, Command::Worker));
    }

    #[test]
    fn test_cli_run_requires_urls_and_output() {
        let result = Args::try_parse_from(["streamdl", "run", "-o", "out.mp4"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
        let result = Args::try_parse_from(["streamdl", "run", "https://a"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn test_cli_missing_subcommand_is_error() {
        assert!(Args::try_parse_from(["streamdl"]).is_err());
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["streamdl", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let err = Args::try_parse_from(["streamdl", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_cli_concurrency_bounds() {
        assert_eq!(run(&["-c", "1"]).concurrency, 1);
        assert_eq!(run(&["-c", "100"]).concurrency, 100);
        for bad in ["0", "101"] {
            let err = Args::try_parse_from(["streamdl", "run", "-o", "o", "u", "-c", bad]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn test_cli_max_retries_zero_rejected() {
        let err = Args::try_parse_from(["streamdl", "run", "-o", "o", "u", "-r", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_run_tuning_flags() {
        let args = run(&[
            "--retry-delay",
            "50",
            "--keep-temp",
            "--ffmpeg",
            "/opt/ffmpeg",
            "--rpc-timeout",
            "30000",
            "--item",
            "watch?v=abc",
        ]);
        assert_eq!(args.retry_delay, 50);
        assert!(args.keep_temp);
        assert_eq!(args.ffmpeg, "/opt/ffmpeg");
        assert_eq!(args.rpc_timeout, Some(30_000));
        assert_eq!(args.item.as_deref(), Some("watch?v=abc"));
    }
}
