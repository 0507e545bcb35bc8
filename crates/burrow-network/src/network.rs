//! Persisted network definitions.

use std::net::Ipv4Addr;
use std::path::Path;

use burrow_common::error::BurrowError;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};

/// Longest Linux interface name.
pub const IFNAME_MAX: usize = 15;

/// A named virtual network backed by a host bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name, unique on the host.
    pub name: String,
    /// Driver that owns the host-side plumbing.
    pub driver: String,
    /// Address range handed out to endpoints.
    pub subnet: Ipv4Network,
    /// Gateway address, held by the bridge itself.
    pub gateway: Ipv4Addr,
    /// Host bridge interface name.
    pub bridge: String,
}

impl Network {
    /// Builds a definition for `subnet`, using its first host address as the
    /// gateway and the (truncated) network name as the bridge name.
    ///
    /// Truncation can map two names onto one bridge; the service refuses
    /// to create the second.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid network name.
    pub fn new(name: &str, driver: &str, subnet: Ipv4Network) -> Result<Self> {
        validate_name(name)?;
        let subnet = Ipv4Network::new(subnet.network(), subnet.prefix())
            .map_err(|e| config_error(format!("invalid subnet {subnet}: {e}")))?;
        let gateway = Ipv4Addr::from(u32::from(subnet.network()) + 1);
        let bridge = name.chars().take(IFNAME_MAX).collect();
        Ok(Self {
            name: name.to_string(),
            driver: driver.to_string(),
            subnet,
            gateway,
            bridge,
        })
    }

    /// Gateway with the subnet prefix, as assigned to the bridge.
    #[must_use]
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway, self.subnet.prefix())
    }

    /// Reads a definition from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(BurrowError::io(path))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes this definition to `path`.
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

/// Network names become file and interface names.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(config_error(format!("invalid network name {name:?}")))
    }
}

fn config_error(message: String) -> NetworkError {
    NetworkError::Common(BurrowError::Config { message })
}
