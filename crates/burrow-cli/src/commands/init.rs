//! `burrow init` — First process inside a new container.

use std::process::ExitCode;

use clap::Args;

/// Arguments for the hidden `init` command.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Hostname to set in the container's UTS namespace.
    #[arg(long)]
    pub hostname: Option<String>,
}

/// Waits for the launcher's command, enters the container root and
/// replaces itself with the command. Only returns on failure.
///
/// # Errors
///
/// Returns an error if any setup step or the final exec fails.
pub fn execute(args: &InitArgs) -> anyhow::Result<ExitCode> {
    match burrow_runtime::init::run(args.hostname.as_deref()) {
        Ok(never) => match never {},
        Err(e) => Err(anyhow::anyhow!("container init failed: {e}")),
    }
}
