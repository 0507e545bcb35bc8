//! `OverlayFS` management for layered container filesystems.
//!
//! Stacks a read-only base layer with a single writable upper layer,
//! giving each container a copy-on-write view of a shared image.

use std::path::PathBuf;

use burrow_common::error::{BurrowError, Result};

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers (bottom to top).
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Builds the `mount(2)` data string for this overlay.
    ///
    /// The kernel stacks `lowerdir` entries top-first, so the bottom layer
    /// is listed last.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers,
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// The upper, work and merged directories must already exist.
///
/// # Errors
///
/// Returns an error if the mount syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_overlay(config: &OverlayConfig) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let opts = config.mount_options();
    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| BurrowError::PermissionDenied {
        message: format!("overlay mount at {} failed: {e}", config.merged_dir.display()),
    })?;

    tracing::info!(merged = %config.merged_dir.display(), "overlayfs mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `OverlayFS` mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_config: &OverlayConfig) -> Result<()> {
    Err(BurrowError::Unsupported {
        operation: "overlay mount",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_list_top_layer_first() {
        let config = OverlayConfig {
            lower_dirs: vec!["/l/base".into(), "/l/patch".into()],
            upper_dir: "/o/upper".into(),
            work_dir: "/o/work".into(),
            merged_dir: "/o/merged".into(),
        };
        assert_eq!(
            config.mount_options(),
            "lowerdir=/l/patch:/l/base,upperdir=/o/upper,workdir=/o/work"
        );
    }
}
