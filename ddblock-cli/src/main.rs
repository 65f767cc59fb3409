// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Run a command while holding a DynamoDB-backed distributed lock.
//!
//! ```text
//! ddblock ddb://locks/nightly-batch -- /usr/local/bin/nightly-batch.sh
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use env_logger::Builder;
use tokio_util::sync::CancellationToken;

use ddblock::{Error, ErrorKind, Locker, LockerOptionsBuilder};

/// The command ran and the lock was released cleanly.
const EXIT_OK: u8 = 0;
/// The command could not run or exited without a usable code.
const EXIT_CHILD_FAILED: u8 = 1;
/// The lock was held elsewhere in non-blocking mode.
const EXIT_NOT_ACQUIRED: u8 = 2;
/// The identifier or an option did not validate.
const EXIT_CONFIGURATION: u8 = 3;
/// The store failed.
const EXIT_STORE: u8 = 4;

/// Run a command while holding a DynamoDB-backed distributed lock.
#[derive(Debug, Parser)]
#[command(name = "ddblock", version)]
struct Cli {
    /// Lock identifier, e.g. ddb://locks/nightly-batch
    url: String,

    /// Command to run once the lock is granted, with its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Record errors instead of panicking
    #[arg(short = 'n', long)]
    no_panic: bool,

    /// Give up at once when the lock is held elsewhere, instead of waiting
    /// for the holder's lease to lapse
    #[arg(short = 'X', long)]
    no_delay: bool,

    /// Verbose diagnostics
    #[arg(short = 'd', long)]
    debug: bool,

    /// DynamoDB endpoint override, e.g. http://localhost:8000
    #[arg(long)]
    endpoint: Option<String>,

    /// Lease duration, e.g. 10s or 750ms
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    lease_duration: Duration,

    /// AWS region override
    #[arg(long)]
    region: Option<String>,
}

fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}

fn exit_for(error: &Error) -> u8 {
    match error.kind() {
        ErrorKind::InvalidIdentifier(_) | ErrorKind::InvalidConfiguration(_) => EXIT_CONFIGURATION,
        _ => EXIT_STORE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = if error.use_stderr() {
                EXIT_CONFIGURATION
            } else {
                EXIT_OK
            };
            let _ = error.print();
            return ExitCode::from(code);
        }
    };
    Builder::new()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp(None)
        .init();
    ExitCode::from(run(cli).await)
}

async fn run(cli: Cli) -> u8 {
    let mut builder = LockerOptionsBuilder::default();
    builder
        .lease_duration(cli.lease_duration)
        .delay(!cli.no_delay)
        .no_panic(cli.no_panic);
    if let Some(endpoint) = cli.endpoint {
        builder.endpoint(endpoint);
    }
    if let Some(region) = cli.region {
        builder.region(region);
    }
    let options = match builder.build() {
        Ok(options) => options,
        Err(error) => {
            log::error!("invalid configuration: {error}");
            return EXIT_CONFIGURATION;
        }
    };

    let locker = match Locker::new(&cli.url, options).await {
        Ok(locker) => locker,
        Err(error) => {
            log::error!("{error}");
            return exit_for(&error);
        }
    };

    let cancel = CancellationToken::new();
    match locker.lock_with_cancellation(&cancel).await {
        Ok(true) => log::debug!("lock {} granted", cli.url),
        Ok(false) => {
            log::warn!("lock {} is held elsewhere", cli.url);
            return EXIT_NOT_ACQUIRED;
        }
        Err(error) => {
            log::error!("could not acquire {}: {error}", cli.url);
            return exit_for(&error);
        }
    }

    let code = run_command(&cli.command).await;

    if let Err(error) = locker.unlock_with_cancellation(&cancel).await {
        log::error!("could not release {}: {error}", cli.url);
        if code == EXIT_OK {
            return exit_for(&error);
        }
    }
    code
}

/// Run the guarded command with inherited stdio, forwarding its exit code.
async fn run_command(command: &[String]) -> u8 {
    let (program, args) = command
        .split_first()
        .expect("clap requires at least one command element");
    match tokio::process::Command::new(program).args(args).status().await {
        Ok(status) if status.success() => EXIT_OK,
        Ok(status) => {
            log::warn!("command exited with {status}");
            status
                .code()
                .and_then(|code| u8::try_from(code).ok())
                .unwrap_or(EXIT_CHILD_FAILED)
        }
        Err(error) => {
            log::error!("could not run {program}: {error}");
            EXIT_CHILD_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::Cli;

    #[test]
    fn parses_url_and_command() {
        let cli = Cli::try_parse_from(["ddblock", "ddb://locks/batch", "echo", "done"]).unwrap();
        assert_eq!(cli.url, "ddb://locks/batch");
        assert_eq!(cli.command, vec!["echo", "done"]);
        assert_eq!(cli.lease_duration, Duration::from_secs(10));
        assert!(!cli.no_delay);
        assert!(!cli.no_panic);
        assert!(!cli.debug);
    }

    #[test]
    fn command_may_carry_its_own_flags() {
        let cli =
            Cli::try_parse_from(["ddblock", "-X", "ddb://locks/batch", "ls", "-la", "/tmp"])
                .unwrap();
        assert!(cli.no_delay);
        assert_eq!(cli.command, vec!["ls", "-la", "/tmp"]);
    }

    #[test]
    fn parses_durations_and_overrides() {
        let cli = Cli::try_parse_from([
            "ddblock",
            "--lease-duration",
            "750ms",
            "--endpoint",
            "http://localhost:8000",
            "--region",
            "ap-northeast-1",
            "-n",
            "-d",
            "ddb://locks/batch",
            "true",
        ])
        .unwrap();
        assert_eq!(cli.lease_duration, Duration::from_millis(750));
        assert_eq!(cli.endpoint.as_deref(), Some("http://localhost:8000"));
        assert_eq!(cli.region.as_deref(), Some("ap-northeast-1"));
        assert!(cli.no_panic);
        assert!(cli.debug);
    }

    #[test]
    fn rejects_a_missing_command() {
        assert!(Cli::try_parse_from(["ddblock", "ddb://locks/batch"]).is_err());
    }

    #[test]
    fn rejects_a_malformed_duration() {
        assert!(
            Cli::try_parse_from([
                "ddblock",
                "--lease-duration",
                "banana",
                "ddb://locks/batch",
                "true",
            ])
            .is_err()
        );
    }
}
