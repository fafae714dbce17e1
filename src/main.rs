//! Binary entry point for mnemon.
//!
//! Hook events must never take the host down with them: the `hook` path
//! is wrapped in `catch_unwind` on top of the dispatcher's own fail-open
//! handling, and a panic exits 0.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use anyhow::Context;
use clap::Parser;
use mnemon::cli::{Cli, Commands, execute};
use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let is_hook = matches!(cli.command, Commands::Hook { .. });

    let result = if is_hook {
        // Double fail-open: even a panic in the dispatcher allows
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| execute(&cli))).unwrap_or_else(
            |_| {
                eprintln!("mnemon: hook handler panicked; allowing");
                Ok(mnemon::cli::ExecOutcome::default())
            },
        )
    } else {
        execute(&cli)
    };

    match result.context("command failed") {
        Ok(outcome) => {
            if !outcome.stdout.is_empty() {
                // Handle broken pipe gracefully (e.g. when piped to `jq`)
                if let Err(e) = writeln!(io::stdout(), "{}", outcome.stdout)
                    && e.kind() != io::ErrorKind::BrokenPipe
                {
                    eprintln!("Error writing to stdout: {e}");
                    return ExitCode::FAILURE;
                }
            }
            for line in &outcome.stderr {
                eprintln!("{line}");
            }
            ExitCode::from(outcome.exit_code)
        }
        Err(e) => {
            if is_hook {
                // Unreachable in practice; belt and braces
                eprintln!("mnemon: {e:#}");
                ExitCode::SUCCESS
            } else {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}

/// Stderr tracing, filtered by `MNEMON_LOG` (off by default so hook
/// advisories stay clean).
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("MNEMON_LOG").unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}
