//! Error types for network management.

use burrow_common::error::BurrowError;
use thiserror::Error;

/// Result type alias for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors raised by the network attachment service and its drivers.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No network with this name is registered.
    #[error("network not found: {name}")]
    NotFound {
        /// Requested network name.
        name: String,
    },

    /// Every host address in the subnet is allocated.
    #[error("address pool exhausted for network {name} ({subnet})")]
    PoolExhausted {
        /// Network name.
        name: String,
        /// Subnet in CIDR notation.
        subnet: String,
    },

    /// A network with this name already exists.
    #[error("network already exists: {name}")]
    AlreadyExists {
        /// Conflicting network name.
        name: String,
    },

    /// The network still has attached endpoints.
    #[error("network {name} still has {endpoints} attached endpoint(s)")]
    InUse {
        /// Network name.
        name: String,
        /// Number of attached endpoints.
        endpoints: usize,
    },

    /// A host networking command failed.
    #[error("network driver error: {0}")]
    Driver(String),

    /// Common error from the shared layer.
    #[error(transparent)]
    Common(#[from] BurrowError),
}

impl From<serde_json::Error> for NetworkError {
    fn from(source: serde_json::Error) -> Self {
        Self::Common(BurrowError::from(source))
    }
}
