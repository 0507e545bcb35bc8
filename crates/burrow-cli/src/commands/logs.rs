//! `burrow logs` — Print a detached container's output.

use burrow_runtime::Engine;
use clap::Args;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container name.
    pub container: String,

    /// Only print the last N lines.
    #[arg(long)]
    pub tail: Option<usize>,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or its log unreadable.
pub fn execute(engine: &Engine, args: &LogsArgs) -> anyhow::Result<()> {
    let logs = engine.logs(&args.container, args.tail)?;
    print!("{logs}");
    Ok(())
}
