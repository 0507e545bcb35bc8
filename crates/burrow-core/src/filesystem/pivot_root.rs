//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};

const PUT_OLD: &str = ".pivot_root";

/// Makes `new_root` the root of the calling mount namespace.
///
/// `new_root` is bind-mounted onto itself so it is a mount point, the old
/// root is parked under `new_root/.pivot_root`, then detached and removed.
///
/// # Errors
///
/// Returns an error if any of the mount, pivot or cleanup steps fail.
#[cfg(target_os = "linux")]
pub fn pivot_root(new_root: &Path) -> Result<()> {
    use nix::mount::{MntFlags, umount2};

    super::mount::bind_mount(new_root, new_root)?;

    let put_old = new_root.join(PUT_OLD);
    std::fs::create_dir_all(&put_old).map_err(BurrowError::io(&put_old))?;

    nix::unistd::pivot_root(new_root, &put_old).map_err(|e| BurrowError::PermissionDenied {
        message: format!("pivot_root to {} failed: {e}", new_root.display()),
    })?;
    nix::unistd::chdir("/").map_err(|e| BurrowError::PermissionDenied {
        message: format!("chdir to new root failed: {e}"),
    })?;

    let old = Path::new("/").join(PUT_OLD);
    umount2(&old, MntFlags::MNT_DETACH).map_err(|e| BurrowError::PermissionDenied {
        message: format!("detaching old root failed: {e}"),
    })?;
    std::fs::remove_dir(&old).map_err(BurrowError::io(&old))?;

    tracing::info!(new_root = %new_root.display(), "root pivoted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `pivot_root` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn pivot_root(_new_root: &Path) -> Result<()> {
    Err(BurrowError::Unsupported {
        operation: "pivot_root",
    })
}
