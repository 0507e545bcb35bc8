//! # burrow
//!
//! Daemon-less container runtime. One binary launches, lists, stops and
//! removes containers, manages bridge networks, and doubles as the init
//! process every container starts with.

mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::{Cli, Command};

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Inside a container stderr belongs to the user's program.
    let default_level = if matches!(cli.command, Command::Init(_)) { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    commands::execute(cli)
}
