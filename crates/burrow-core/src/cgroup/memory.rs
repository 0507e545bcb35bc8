//! Memory resource control.
//!
//! Manages `memory.limit_in_bytes` (v1) or `memory.max` (v2).

use std::path::Path;

use burrow_common::error::Result;

use super::CgroupVersion;
use crate::isolation::Isolation;

/// Sets the hard memory limit for a cgroup.
///
/// # Errors
///
/// Returns an error if writing the control file fails.
pub fn set_memory_limit(
    isolation: &dyn Isolation,
    cgroup: &Path,
    version: CgroupVersion,
    bytes: u64,
) -> Result<()> {
    let key = match version {
        CgroupVersion::V1 => "memory.limit_in_bytes",
        CgroupVersion::V2 => "memory.max",
    };
    isolation.write_subsystem_limit(cgroup, key, &bytes.to_string())?;
    tracing::debug!(bytes, "memory limit set");
    Ok(())
}
