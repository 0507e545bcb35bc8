//! Network drivers: the host-facing half of network management.
//!
//! The service owns naming, persistence and address allocation; a driver
//! only turns a [`Network`] or [`Endpoint`] into kernel state and back.

pub mod bridge;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::network::Network;

/// Host plumbing for one kind of network.
pub trait NetworkDriver: Send + Sync {
    /// Driver name as stored in network definitions.
    fn name(&self) -> &str;

    /// Creates the host side of `network` (bridge, gateway address, NAT).
    ///
    /// # Errors
    ///
    /// Returns an error if any host command fails; partial state is undone.
    fn create(&self, network: &Network) -> Result<()>;

    /// Removes what [`NetworkDriver::create`] set up.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge cannot be removed.
    fn delete(&self, network: &Network) -> Result<()>;

    /// Wires `endpoint` into the network namespace of `pid` and configures
    /// its address and default route.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the veth pair is removed again.
    fn connect(&self, network: &Network, endpoint: &Endpoint, pid: i32) -> Result<()>;

    /// Removes the endpoint's veth pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be deleted.
    fn disconnect(&self, endpoint: &Endpoint) -> Result<()>;

    /// Installs the endpoint's port-forwarding rules.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule cannot be added; rules added so far are
    /// removed again.
    fn map_ports(&self, endpoint: &Endpoint) -> Result<()>;

    /// Removes the endpoint's port-forwarding rules.
    ///
    /// # Errors
    ///
    /// Returns the first failure after attempting every rule.
    fn unmap_ports(&self, endpoint: &Endpoint) -> Result<()>;
}
