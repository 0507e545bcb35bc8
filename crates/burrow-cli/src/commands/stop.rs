//! `burrow stop` — Stop running containers.

use std::time::Duration;

use burrow_runtime::Engine;
use clap::Args;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container names.
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Seconds to wait after SIGTERM before sending SIGKILL.
    #[arg(short, long, default_value_t = 10)]
    pub time: u64,
}

/// Executes the `stop` command. Every container is attempted.
///
/// # Errors
///
/// Returns an error if any container could not be stopped.
pub fn execute(engine: &Engine, args: &StopArgs) -> anyhow::Result<()> {
    let grace = Duration::from_secs(args.time);
    let mut failed = 0_usize;
    for name in &args.containers {
        match engine.stop(name, grace) {
            Ok(_) => println!("{name}"),
            Err(e) => {
                tracing::error!(name, error = %e, "stop failed");
                failed += 1;
            }
        }
    }
    anyhow::ensure!(failed == 0, "{failed} container(s) could not be stopped");
    Ok(())
}
