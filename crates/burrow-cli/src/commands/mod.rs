//! CLI command definitions and dispatch.

pub mod commit;
pub mod init;
pub mod logs;
pub mod network;
pub mod ps;
pub mod rm;
pub mod run;
pub mod stop;

use std::path::PathBuf;
use std::process::ExitCode;

use burrow_common::config::RuntimeConfig;
use burrow_runtime::Engine;
use clap::{Parser, Subcommand};

/// Burrow, a daemon-less container runtime.
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// State directory (defaults to $BURROW_ROOT, then /var/lib/burrow).
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command in a new container.
    Run(run::RunArgs),
    /// Container init process; started by `run`, not by hand.
    #[command(hide = true)]
    Init(init::InitArgs),
    /// List containers.
    Ps(ps::PsArgs),
    /// Print a detached container's log.
    Logs(logs::LogsArgs),
    /// Stop a running container.
    Stop(stop::StopArgs),
    /// Remove a container and release its resources.
    Rm(rm::RmArgs),
    /// Save a container's filesystem as an image.
    Commit(commit::CommitArgs),
    /// Manage networks.
    #[command(subcommand)]
    Network(network::NetworkCommand),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let root = cli.root;
    let engine = || -> anyhow::Result<Engine> { Ok(Engine::new(RuntimeConfig::resolve(root.as_deref())?)) };
    let done = |()| ExitCode::SUCCESS;

    match cli.command {
        Command::Init(args) => init::execute(&args),
        Command::Run(args) => run::execute(&engine()?, args),
        Command::Ps(args) => ps::execute(&engine()?, &args).map(done),
        Command::Logs(args) => logs::execute(&engine()?, &args).map(done),
        Command::Stop(args) => stop::execute(&engine()?, &args).map(done),
        Command::Rm(args) => rm::execute(&engine()?, &args).map(done),
        Command::Commit(args) => commit::execute(&engine()?, &args).map(done),
        Command::Network(command) => network::execute(&engine()?, command).map(done),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
