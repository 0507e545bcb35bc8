//! Linux bridge driver built on `ip`, `nsenter` and `iptables`.

use std::process::Command;

use burrow_common::constants::DEFAULT_NETWORK_DRIVER;
use burrow_common::types::PortMapping;

use super::NetworkDriver;
use crate::endpoint::Endpoint;
use crate::error::{NetworkError, Result};
use crate::network::Network;

/// Bridge-per-network driver with MASQUERADE egress and DNAT port mapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeDriver;

impl BridgeDriver {
    /// Creates the driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        DEFAULT_NETWORK_DRIVER
    }

    fn create(&self, network: &Network) -> Result<()> {
        let bridge = network.bridge.as_str();
        run("ip", &["link", "add", "name", bridge, "type", "bridge"])?;

        let gateway = network.gateway_cidr();
        let subnet = network.subnet.to_string();
        let setup = run("ip", &["addr", "add", gateway.as_str(), "dev", bridge])
            .and_then(|()| run("ip", &["link", "set", bridge, "up"]))
            .and_then(|()| run("iptables", &masquerade_args("-A", &subnet, bridge)));
        if let Err(e) = setup {
            if let Err(undo) = run("ip", &["link", "delete", bridge, "type", "bridge"]) {
                tracing::warn!(bridge, error = %undo, "failed to remove half-created bridge");
            }
            return Err(e);
        }

        tracing::info!(network = %network.name, bridge, %subnet, "bridge created");
        Ok(())
    }

    fn delete(&self, network: &Network) -> Result<()> {
        let bridge = network.bridge.as_str();
        let subnet = network.subnet.to_string();
        if let Err(e) = run("iptables", &masquerade_args("-D", &subnet, bridge)) {
            tracing::warn!(bridge, error = %e, "masquerade rule already gone");
        }
        run("ip", &["link", "delete", bridge, "type", "bridge"])?;
        tracing::info!(network = %network.name, bridge, "bridge deleted");
        Ok(())
    }

    fn connect(&self, network: &Network, endpoint: &Endpoint, pid: i32) -> Result<()> {
        let host = endpoint.host_veth.as_str();
        let peer = endpoint.peer_veth.as_str();
        run("ip", &["link", "add", host, "type", "veth", "peer", "name", peer])?;

        if let Err(e) = wire(network, endpoint, pid) {
            if let Err(undo) = run("ip", &["link", "delete", host]) {
                tracing::warn!(veth = host, error = %undo, "failed to remove veth after error");
            }
            return Err(e);
        }

        tracing::info!(
            network = %network.name,
            container = %endpoint.container_id,
            ip = %endpoint.ip,
            pid,
            "endpoint connected"
        );
        Ok(())
    }

    fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        run("ip", &["link", "delete", endpoint.host_veth.as_str()])?;
        tracing::info!(container = %endpoint.container_id, veth = %endpoint.host_veth, "endpoint disconnected");
        Ok(())
    }

    fn map_ports(&self, endpoint: &Endpoint) -> Result<()> {
        for (done, mapping) in endpoint.port_mappings.iter().enumerate() {
            let args = dnat_args("-A", endpoint, mapping);
            if let Err(e) = run("iptables", &args) {
                for added in &endpoint.port_mappings[..done] {
                    let _ = run("iptables", &dnat_args("-D", endpoint, added));
                }
                return Err(e);
            }
            tracing::debug!(%mapping, ip = %endpoint.ip, "port mapped");
        }
        Ok(())
    }

    fn unmap_ports(&self, endpoint: &Endpoint) -> Result<()> {
        let mut first_error = None;
        for mapping in &endpoint.port_mappings {
            if let Err(e) = run("iptables", &dnat_args("-D", endpoint, mapping)) {
                tracing::warn!(%mapping, error = %e, "failed to remove port mapping");
                let _ = first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Moves the peer into the namespace of `pid` and configures it there.
fn wire(network: &Network, endpoint: &Endpoint, pid: i32) -> Result<()> {
    let host = endpoint.host_veth.as_str();
    let peer = endpoint.peer_veth.as_str();
    let pid = pid.to_string();
    let cidr = endpoint.cidr();
    let gateway = endpoint.gateway.to_string();

    run("ip", &["link", "set", host, "master", network.bridge.as_str()])?;
    run("ip", &["link", "set", host, "up"])?;
    run("ip", &["link", "set", peer, "address", endpoint.mac.as_str()])?;
    run("ip", &["link", "set", peer, "netns", pid.as_str()])?;

    nsenter(&pid, &["link", "set", "lo", "up"])?;
    nsenter(&pid, &["addr", "add", cidr.as_str(), "dev", peer])?;
    nsenter(&pid, &["link", "set", peer, "up"])?;
    nsenter(&pid, &["route", "add", "default", "via", gateway.as_str()])
}

/// Runs `ip <args>` inside the network namespace of `pid`.
fn nsenter(pid: &str, args: &[&str]) -> Result<()> {
    let mut full = vec!["--target", pid, "--net", "ip"];
    full.extend_from_slice(args);
    run("nsenter", &full)
}

fn masquerade_args<'a>(action: &'a str, subnet: &'a str, bridge: &'a str) -> Vec<&'a str> {
    vec![
        "-t", "nat", action, "POSTROUTING", "-s", subnet, "!", "-o", bridge, "-j", "MASQUERADE",
    ]
}

fn dnat_args(action: &str, endpoint: &Endpoint, mapping: &PortMapping) -> Vec<String> {
    let dport = mapping.host.to_string();
    let destination = format!("{}:{}", endpoint.ip, mapping.container);
    [
        "-t", "nat", action, "PREROUTING", "-p", "tcp", "-m", "tcp", "--dport", dport.as_str(),
        "-j", "DNAT", "--to-destination", destination.as_str(),
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Runs a host command, turning a non-zero exit into a driver error.
fn run<S: AsRef<str>>(program: &str, args: &[S]) -> Result<()> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let output = Command::new(program)
        .args(&args)
        .output()
        .map_err(|e| NetworkError::Driver(format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Driver(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}
