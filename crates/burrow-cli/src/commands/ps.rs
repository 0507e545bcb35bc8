//! `burrow ps` — List containers.

use burrow_common::types::ContainerStatus;
use burrow_runtime::Engine;
use clap::Args;

use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all containers (including stopped and exited).
    #[arg(short, long)]
    pub all: bool,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the container records cannot be read.
pub fn execute(engine: &Engine, args: &PsArgs) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let records: Vec<_> = engine
        .list()?
        .into_iter()
        .filter(|r| args.all || r.status == ContainerStatus::Running)
        .collect();

    println!(
        "{:<14} {:<16} {:<8} {:<9} {:<15} {:<14} {:<24} COMMAND",
        "CONTAINER ID", "NAME", "PID", "STATUS", "IP", "CREATED", "PORTS"
    );
    for r in &records {
        println!(
            "{:<14} {:<16} {:<8} {:<9} {:<15} {:<14} {:<24} {}",
            r.id,
            r.name,
            r.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
            r.status,
            r.ip.map_or_else(|| "-".to_string(), |ip| ip.to_string()),
            output::format_age(r.created_at, now),
            output::format_ports(&r.port_mappings),
            r.command.join(" "),
        );
    }
    Ok(())
}
