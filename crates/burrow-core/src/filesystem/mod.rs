//! Filesystem management for container isolation.
//!
//! Provides `OverlayFS` layer mounting, bind mounts, `pivot_root` for secure
//! root filesystem switching, and the [`Mounter`] seam that lets the
//! workspace manager run against the real kernel or a test double.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;

use std::path::Path;

use burrow_common::error::Result;

pub use overlayfs::OverlayConfig;

/// Host-side mount operations needed to build a container workspace.
pub trait Mounter: Send + Sync {
    /// Mounts an overlay combining the layers in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount fails.
    fn mount_overlay(&self, config: &OverlayConfig) -> Result<()>;

    /// Bind-mounts `source` onto `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount fails.
    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    /// Unmounts whatever is mounted at `target`, failing if it is busy.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount fails.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Lazily detaches whatever is mounted at `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the detach fails.
    fn detach(&self, target: &Path) -> Result<()>;
}

/// [`Mounter`] backed by the `mount(2)` family of syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMounter;

impl Mounter for HostMounter {
    fn mount_overlay(&self, config: &OverlayConfig) -> Result<()> {
        overlayfs::mount_overlay(config)
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        mount::bind_mount(source, target)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        mount::unmount(target)
    }

    fn detach(&self, target: &Path) -> Result<()> {
        mount::detach(target)
    }
}
