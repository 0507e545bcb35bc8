//! `burrow rm` — Remove containers.

use burrow_runtime::Engine;
use clap::Args;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container names.
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Stop running containers first.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `rm` command. Every container is attempted.
///
/// # Errors
///
/// Returns an error if any container could not be removed.
pub fn execute(engine: &Engine, args: &RmArgs) -> anyhow::Result<()> {
    let mut failed = 0_usize;
    for name in &args.containers {
        match engine.remove(name, args.force) {
            Ok(()) => println!("{name}"),
            Err(e) => {
                tracing::error!(name, error = %e, "remove failed");
                failed += 1;
            }
        }
    }
    anyhow::ensure!(failed == 0, "{failed} container(s) could not be removed");
    Ok(())
}
