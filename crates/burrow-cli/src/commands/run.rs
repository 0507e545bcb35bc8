//! `burrow run` — Launch a command in a new container.

use std::process::ExitCode;

use burrow_common::types::{PortMapping, ResourceConfig, VolumeSpec, parse_memory};
use burrow_runtime::{Engine, LaunchConfig, LaunchOutcome};
use clap::Args;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run in the foreground attached to this terminal and wait for exit.
    #[arg(short, long)]
    pub tty: bool,

    /// Run in the background (the default without `--tty`).
    #[arg(short, long, conflicts_with = "tty")]
    pub detach: bool,

    /// Container name (defaults to the generated id).
    #[arg(long)]
    pub name: Option<String>,

    /// Relative CPU weight.
    #[arg(long)]
    pub cpu_shares: Option<u64>,

    /// CPU time in microseconds per 100ms period.
    #[arg(long)]
    pub cpu_quota: Option<u64>,

    /// CPUs the container may use, e.g. `0-2,4`.
    #[arg(long)]
    pub cpuset: Option<String>,

    /// Memory limit, e.g. `100m` or `1g`.
    #[arg(short, long, value_parser = memory_limit)]
    pub memory: Option<u64>,

    /// Bind mount `hostPath:containerPath`.
    #[arg(short, long)]
    pub volume: Option<VolumeSpec>,

    /// Network to attach to.
    #[arg(long = "net")]
    pub network: Option<String>,

    /// Environment variable `KEY=VALUE`; repeatable.
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Port forward `hostPort:containerPort`; repeatable.
    #[arg(short, long = "publish")]
    pub publish: Vec<PortMapping>,

    /// Image providing the root filesystem.
    pub image: String,

    /// Command and arguments to run.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn memory_limit(value: &str) -> Result<u64, String> {
    parse_memory(value).ok_or_else(|| format!("invalid memory size {value:?}"))
}

/// Executes the `run` command.
///
/// A foreground container's exit code becomes this process's exit code;
/// a detached launch prints the container id.
///
/// # Errors
///
/// Returns an error if the launch is aborted.
pub fn execute(engine: &Engine, args: RunArgs) -> anyhow::Result<ExitCode> {
    let launch = LaunchConfig {
        command: args.command,
        tty: args.tty && !args.detach,
        resources: ResourceConfig {
            cpu_shares: args.cpu_shares,
            cpu_quota: args.cpu_quota,
            cpuset: args.cpuset,
            memory_limit: args.memory,
        },
        name: args.name,
        image: args.image,
        volume: args.volume,
        network: args.network,
        env: args.env,
        port_mappings: args.publish,
    };

    match engine.run(launch)? {
        LaunchOutcome::Detached { id, .. } => {
            println!("{id}");
            Ok(ExitCode::SUCCESS)
        }
        LaunchOutcome::Exited { status: Some(status), .. } => {
            Ok(ExitCode::from(u8::try_from(status.code()).unwrap_or(1)))
        }
        LaunchOutcome::Exited { status: None, .. } => Ok(ExitCode::FAILURE),
    }
}
