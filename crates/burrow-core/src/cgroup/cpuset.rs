//! CPU pinning via the cpuset controller.

use std::path::Path;

use burrow_common::error::Result;

use crate::isolation::Isolation;

/// Restricts the cgroup to the given CPU list, e.g. `0-1,3`.
///
/// # Errors
///
/// Returns an error if writing `cpuset.cpus` fails.
pub fn set_cpus(isolation: &dyn Isolation, cgroup: &Path, cpus: &str) -> Result<()> {
    isolation.write_subsystem_limit(cgroup, "cpuset.cpus", cpus)?;
    tracing::debug!(cpus, "cpuset set");
    Ok(())
}

/// Seeds empty `cpuset.cpus`/`cpuset.mems` of every directory between
/// `mount_root` (exclusive) and `cgroup` (inclusive) from its parent.
///
/// A v1 cpuset cgroup with empty values refuses new tasks, so freshly
/// created levels must inherit before anything is attached.
///
/// # Errors
///
/// Returns an error if a control file cannot be written.
pub fn inherit_from_parent(isolation: &dyn Isolation, mount_root: &Path, cgroup: &Path) -> Result<()> {
    let Ok(relative) = cgroup.strip_prefix(mount_root) else {
        return Ok(());
    };
    let mut parent = mount_root.to_path_buf();
    for component in relative.components() {
        let current = parent.join(component);
        for key in ["cpuset.cpus", "cpuset.mems"] {
            let own = read_trimmed(&current.join(key));
            let inherited = read_trimmed(&parent.join(key));
            if own.as_deref().is_some_and(str::is_empty) {
                if let Some(value) = inherited.filter(|v| !v.is_empty()) {
                    isolation.write_subsystem_limit(&current, key, &value)?;
                }
            }
        }
        parent = current;
    }
    Ok(())
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}
