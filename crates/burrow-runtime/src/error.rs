//! Error types for container lifecycle operations.
//!
//! The orchestrator is the only place that decides whether an error aborts
//! a launch; every component hands it one of these.

use burrow_common::error::BurrowError;
use burrow_common::types::ContainerStatus;
use burrow_network::NetworkError;
use thiserror::Error;

use crate::metadata::MetadataError;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised while launching or managing containers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The isolated process could not be created. Nothing else happened.
    #[error("failed to spawn container process: {0}")]
    Spawn(#[source] BurrowError),

    /// The root filesystem could not be assembled.
    #[error("failed to prepare workspace: {0}")]
    Workspace(#[source] BurrowError),

    /// A cgroup limit or membership could not be applied.
    #[error("failed to apply resource limits: {0}")]
    ResourceApply(#[source] BurrowError),

    /// Network attachment failed; the command was never sent.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// The metadata store failed.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// The init command could not be delivered to the child.
    #[error("init handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// The container is in the wrong state for the requested action.
    #[error("cannot {action} container {name}: it is {status}")]
    InvalidState {
        /// Container name.
        name: String,
        /// Current status.
        status: ContainerStatus,
        /// Requested action.
        action: &'static str,
    },

    /// The container's process survived `SIGKILL`.
    #[error("container {name} (pid {pid}) did not exit after SIGKILL")]
    StillRunning {
        /// Container name.
        name: String,
        /// Host pid of the surviving process.
        pid: u32,
    },

    /// Common error from the shared layer.
    #[error(transparent)]
    Common(#[from] BurrowError),
}
