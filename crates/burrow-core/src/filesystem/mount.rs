//! Mount utilities for container filesystem setup.
//!
//! Host side: bind mounts, strict unmounts and lazy detaches for workspaces.
//! Container side: making the inherited mount tree private and mounting
//! `/proc` and `/dev` inside the new root.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};

/// Creates a recursive bind mount from `source` to `target`.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!("bind mount {} -> {} failed: {e}", source.display(), target.display()),
    })?;
    tracing::debug!(source = %source.display(), target = %target.display(), "bind mount created");
    Ok(())
}

/// Unmounts the filesystem at `target`.
///
/// The unmount is not lazy: a mount still in use fails with `EBUSY`
/// instead of vanishing from the tree while its users keep it alive.
/// A target that is not (or no longer) a mount point is already in the
/// desired state and is not an error.
///
/// # Errors
///
/// Returns an error if the mount is busy or the syscall fails for
/// another reason.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> Result<()> {
    settle(target, nix::mount::umount2(target, nix::mount::MntFlags::empty()))
}

/// Lazily detaches the filesystem mounted at `target` with `MNT_DETACH`.
///
/// Suited to bind mounts whose source outlives the container.
///
/// # Errors
///
/// Returns an error if the unmount syscall fails with anything other
/// than "not mounted".
#[cfg(target_os = "linux")]
pub fn detach(target: &Path) -> Result<()> {
    settle(target, nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH))
}

#[cfg(target_os = "linux")]
fn settle(target: &Path, outcome: nix::Result<()>) -> Result<()> {
    use nix::errno::Errno;

    match outcome {
        Ok(()) => {
            tracing::debug!(path = %target.display(), "unmounted");
            Ok(())
        }
        Err(Errno::EINVAL | Errno::ENOENT) => {
            tracing::debug!(path = %target.display(), "not mounted");
            Ok(())
        }
        Err(e) => Err(BurrowError::PermissionDenied {
            message: format!("unmount {} failed: {e}", target.display()),
        }),
    }
}

/// Marks every mount in the current namespace private so nothing the
/// container mounts propagates back to the host.
///
/// # Errors
///
/// Returns an error if the remount fails.
#[cfg(target_os = "linux")]
pub fn make_private() -> Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!("making mounts private failed: {e}"),
    })
}

/// Mounts `proc` at `<root>/proc` and a `tmpfs` at `<root>/dev`.
///
/// # Errors
///
/// Returns an error if a mount point cannot be created or a mount fails.
#[cfg(target_os = "linux")]
pub fn mount_essential_filesystems(root: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let proc_dir = root.join("proc");
    std::fs::create_dir_all(&proc_dir).map_err(BurrowError::io(&proc_dir))?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!("mounting proc failed: {e}"),
    })?;

    let dev_dir = root.join("dev");
    std::fs::create_dir_all(&dev_dir).map_err(BurrowError::io(&dev_dir))?;
    mount(
        Some("tmpfs"),
        &dev_dir,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755"),
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!("mounting /dev tmpfs failed: {e}"),
    })?;

    tracing::debug!(root = %root.display(), "essential filesystems mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: bind mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path) -> Result<()> {
    Err(BurrowError::Unsupported {
        operation: "bind mount",
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: unmounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> Result<()> {
    Err(BurrowError::Unsupported { operation: "unmount" })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: unmounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn detach(_target: &Path) -> Result<()> {
    Err(BurrowError::Unsupported { operation: "unmount" })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: mount propagation requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn make_private() -> Result<()> {
    Err(BurrowError::Unsupported {
        operation: "mount propagation",
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: procfs requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_essential_filesystems(_root: &Path) -> Result<()> {
    Err(BurrowError::Unsupported {
        operation: "proc mount",
    })
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn not_mounted_is_already_settled() {
        let target = Path::new("/nonexistent/merged");
        assert!(settle(target, Ok(())).is_ok());
        assert!(settle(target, Err(Errno::EINVAL)).is_ok());
        assert!(settle(target, Err(Errno::ENOENT)).is_ok());
    }

    #[test]
    fn busy_mount_is_an_error() {
        let err = settle(Path::new("/var/lib/burrow/merged"), Err(Errno::EBUSY)).unwrap_err();
        assert!(err.to_string().contains("/var/lib/burrow/merged"));
        assert!(settle(Path::new("/x"), Err(Errno::EPERM)).is_err());
    }
}
