//! Container endpoints on a network.

use std::net::Ipv4Addr;
use std::path::Path;

use burrow_common::error::BurrowError;
use burrow_common::types::{ContainerId, PortMapping};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::network::Network;

/// What the service needs to know about a container to attach it.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Container the endpoint belongs to.
    pub container_id: ContainerId,
    /// Pid whose network namespace receives the interface.
    pub pid: i32,
    /// Host ports forwarded to the container.
    pub port_mappings: Vec<PortMapping>,
}

/// One container's interface on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Owning container.
    pub container_id: ContainerId,
    /// Network the endpoint is attached to.
    pub network: String,
    /// Address allocated from the network's pool.
    pub ip: Ipv4Addr,
    /// Prefix length of the network's subnet.
    pub prefix: u8,
    /// Gateway used as the container's default route.
    pub gateway: Ipv4Addr,
    /// Hardware address of the container-side interface.
    pub mac: String,
    /// Bridge the host side is enslaved to.
    pub bridge: String,
    /// Host-side veth name.
    pub host_veth: String,
    /// Container-side veth name.
    pub peer_veth: String,
    /// Host ports forwarded to the container.
    pub port_mappings: Vec<PortMapping>,
}

impl Endpoint {
    /// Describes the endpoint `attachment` gets on `network` at `ip`.
    #[must_use]
    pub fn new(network: &Network, attachment: &Attachment, ip: Ipv4Addr) -> Self {
        let short = attachment.container_id.short(8);
        Self {
            container_id: attachment.container_id.clone(),
            network: network.name.clone(),
            ip,
            prefix: network.subnet.prefix(),
            gateway: network.gateway,
            mac: mac_for(ip),
            bridge: network.bridge.clone(),
            host_veth: format!("veth{short}"),
            peer_veth: format!("ceth{short}"),
            port_mappings: attachment.port_mappings.clone(),
        }
    }

    /// Address with prefix, as configured inside the container.
    #[must_use]
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ip, self.prefix)
    }

    /// Reads an endpoint from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(BurrowError::io(path))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes this endpoint to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).map_err(BurrowError::io(path))?;
        Ok(())
    }
}

/// Locally administered MAC derived from the IPv4 address.
#[must_use]
pub fn mac_for(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("02:42:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_encodes_address() {
        assert_eq!(mac_for(Ipv4Addr::new(172, 18, 0, 2)), "02:42:ac:12:00:02");
    }

    #[test]
    fn veth_names_fit_interface_limit() {
        let network = Network::new("web", "bridge", "10.5.0.0/24".parse().unwrap()).unwrap();
        let attachment = Attachment {
            container_id: ContainerId::new("0123456789ab"),
            pid: 42,
            port_mappings: vec!["8080:80".parse().unwrap()],
        };
        let ep = Endpoint::new(&network, &attachment, Ipv4Addr::new(10, 5, 0, 2));
        assert_eq!(ep.host_veth, "veth01234567");
        assert_eq!(ep.peer_veth, "ceth01234567");
        assert_eq!(ep.cidr(), "10.5.0.2/24");
        assert_eq!(ep.gateway, Ipv4Addr::new(10, 5, 0, 1));
    }
}
