//! UTS namespace helpers.
//!
//! Allows the container to have its own hostname.

use burrow_common::error::{BurrowError, Result};

/// Sets the hostname inside the current UTS namespace.
///
/// # Errors
///
/// Returns an error if `sethostname(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| BurrowError::PermissionDenied {
        message: format!("sethostname failed: {e}"),
    })?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: UTS namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_hostname: &str) -> Result<()> {
    Err(BurrowError::Unsupported {
        operation: "sethostname",
    })
}
