//! CPU resource control.
//!
//! Shares map to `cpu.shares` (v1) or `cpu.weight` (v2); bandwidth maps to
//! the CFS quota/period pair (v1) or `cpu.max` (v2).

use std::path::Path;

use burrow_common::constants::CPU_PERIOD_US;
use burrow_common::error::Result;

use super::CgroupVersion;
use crate::isolation::Isolation;

/// Converts v1 CPU shares (2..=262144) into a v2 weight (1..=10000).
#[must_use]
pub const fn shares_to_weight(shares: u64) -> u64 {
    let shares = if shares < 2 {
        2
    } else if shares > 262_144 {
        262_144
    } else {
        shares
    };
    1 + ((shares - 2) * 9_999) / 262_142
}

/// Sets the relative CPU share of a cgroup.
///
/// # Errors
///
/// Returns an error if writing the control file fails.
pub fn set_cpu_shares(
    isolation: &dyn Isolation,
    cgroup: &Path,
    version: CgroupVersion,
    shares: u64,
) -> Result<()> {
    match version {
        CgroupVersion::V1 => isolation.write_subsystem_limit(cgroup, "cpu.shares", &shares.to_string())?,
        CgroupVersion::V2 => isolation.write_subsystem_limit(
            cgroup,
            "cpu.weight",
            &shares_to_weight(shares).to_string(),
        )?,
    }
    tracing::debug!(shares, "CPU shares set");
    Ok(())
}

/// Sets the CPU bandwidth limit to `quota_us` per [`CPU_PERIOD_US`].
///
/// # Errors
///
/// Returns an error if writing the control files fails.
pub fn set_cpu_quota(
    isolation: &dyn Isolation,
    cgroup: &Path,
    version: CgroupVersion,
    quota_us: u64,
) -> Result<()> {
    match version {
        CgroupVersion::V1 => {
            isolation.write_subsystem_limit(cgroup, "cpu.cfs_period_us", &CPU_PERIOD_US.to_string())?;
            isolation.write_subsystem_limit(cgroup, "cpu.cfs_quota_us", &quota_us.to_string())?;
        }
        CgroupVersion::V2 => {
            isolation.write_subsystem_limit(cgroup, "cpu.max", &format!("{quota_us} {CPU_PERIOD_US}"))?;
        }
    }
    tracing::debug!(quota_us, period_us = CPU_PERIOD_US, "CPU quota set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_conversion_covers_range() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(1024), 39);
        assert_eq!(shares_to_weight(0), 1);
    }
}
