//! `burrow network` — Create, list and remove networks.

use burrow_common::constants::DEFAULT_NETWORK_DRIVER;
use burrow_runtime::Engine;
use clap::{Args, Subcommand};
use ipnetwork::Ipv4Network;

/// Network subcommands.
#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a network.
    Create(CreateArgs),
    /// List networks.
    #[command(alias = "ls")]
    List,
    /// Remove a network with no attached containers.
    #[command(alias = "rm")]
    Remove {
        /// Network name.
        name: String,
    },
}

/// Arguments for `network create`.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Network name.
    pub name: String,

    /// Subnet in CIDR notation, e.g. `192.168.10.0/24`.
    #[arg(long)]
    pub subnet: Ipv4Network,

    /// Network driver.
    #[arg(long, default_value = DEFAULT_NETWORK_DRIVER)]
    pub driver: String,
}

/// Executes a `network` subcommand.
///
/// # Errors
///
/// Returns an error if the network state cannot be loaded or the
/// operation fails.
pub fn execute(engine: &Engine, command: NetworkCommand) -> anyhow::Result<()> {
    let service = engine.network();
    service.init()?;
    match command {
        NetworkCommand::Create(args) => {
            anyhow::ensure!(
                args.driver == DEFAULT_NETWORK_DRIVER,
                "unsupported network driver {:?}",
                args.driver
            );
            let network = service.create(&args.name, args.subnet)?;
            println!("{}", network.name);
        }
        NetworkCommand::List => {
            println!("{:<16} {:<18} {:<15} DRIVER", "NAME", "SUBNET", "GATEWAY");
            for network in service.list() {
                println!(
                    "{:<16} {:<18} {:<15} {}",
                    network.name, network.subnet, network.gateway, network.driver
                );
            }
        }
        NetworkCommand::Remove { name } => {
            service.remove(&name)?;
            println!("{name}");
        }
    }
    Ok(())
}
