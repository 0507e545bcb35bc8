//! Container root filesystem assembly.
//!
//! Each container gets `<overlay>/<id>/{upper,work,merged}`: a private
//! writable layer and an overlay mount that stacks it over the image's
//! shared, read-only base layer. An optional volume is bind-mounted into
//! the merged view. The base layer is never modified or deleted here.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use burrow_common::config::RuntimeConfig;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{ContainerId, VolumeSpec};
use burrow_core::filesystem::{Mounter, OverlayConfig};
use burrow_image::ImageStore;

/// Filesystem view of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Shared read-only base layer.
    pub base_layer: PathBuf,
    /// Per-container directory holding the writable layer and mount point.
    pub container_dir: PathBuf,
    /// Writable upper layer.
    pub writable_layer: PathBuf,
    /// Overlay work directory.
    pub work_dir: PathBuf,
    /// Overlay mount point; the container's root.
    pub merged: PathBuf,
    /// Volume bind, if requested.
    pub volume: Option<VolumeSpec>,
}

impl Workspace {
    /// Mount point of the volume inside the merged view.
    #[must_use]
    pub fn volume_target(&self) -> Option<PathBuf> {
        self.volume
            .as_ref()
            .map(|v| self.merged.join(relative(&v.container)))
    }

    fn overlay(&self) -> OverlayConfig {
        OverlayConfig {
            lower_dirs: vec![self.base_layer.clone()],
            upper_dir: self.writable_layer.clone(),
            work_dir: self.work_dir.clone(),
            merged_dir: self.merged.clone(),
        }
    }
}

/// Builds and tears down container workspaces.
pub struct WorkspaceManager {
    images: ImageStore,
    overlay_dir: PathBuf,
    mounter: Arc<dyn Mounter>,
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("overlay_dir", &self.overlay_dir)
            .finish_non_exhaustive()
    }
}

impl WorkspaceManager {
    /// Creates a manager using the directories in `config`.
    #[must_use]
    pub fn new(config: &RuntimeConfig, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            images: ImageStore::new(config),
            overlay_dir: config.overlay_dir(),
            mounter,
        }
    }

    /// Image store used to resolve base layers.
    #[must_use]
    pub const fn images(&self) -> &ImageStore {
        &self.images
    }

    /// Describes the workspace of container `id` without touching disk.
    #[must_use]
    pub fn layout(&self, id: &ContainerId, base_layer: PathBuf, volume: Option<VolumeSpec>) -> Workspace {
        let container_dir = self.overlay_dir.join(id.as_str());
        Workspace {
            base_layer,
            writable_layer: container_dir.join("upper"),
            work_dir: container_dir.join("work"),
            merged: container_dir.join("merged"),
            container_dir,
            volume,
        }
    }

    /// Materializes the workspace for container `id` from `image`.
    ///
    /// On failure every mount already made is undone and the per-container
    /// directory is removed before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the base layer is missing, the volume spec is
    /// unusable, or any directory or mount step fails.
    pub fn create(&self, id: &ContainerId, image: &str, volume: Option<&VolumeSpec>) -> Result<Workspace> {
        if let Some(spec) = volume {
            validate_volume(spec)?;
        }
        let base = self.images.base_layer(image)?;
        let ws = self.layout(id, base, volume.cloned());

        for dir in [&ws.writable_layer, &ws.work_dir, &ws.merged] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                self.remove_container_dir(&ws);
                return Err(BurrowError::io(dir)(e));
            }
        }

        if let Err(e) = self.mounter.mount_overlay(&ws.overlay()) {
            tracing::error!(id = %id, error = %e, "overlay mount failed");
            self.remove_container_dir(&ws);
            return Err(e);
        }

        if let (Some(spec), Some(target)) = (&ws.volume, ws.volume_target()) {
            if let Err(e) = self.bind_volume(spec, &target) {
                tracing::error!(id = %id, volume = %spec, error = %e, "volume bind failed");
                if let Err(undo) = self.mounter.unmount(&ws.merged) {
                    tracing::error!(id = %id, error = %undo, "failed to unwind overlay mount");
                    return Err(e);
                }
                self.remove_container_dir(&ws);
                return Err(e);
            }
        }

        tracing::info!(id = %id, image, merged = %ws.merged.display(), "workspace created");
        Ok(ws)
    }

    /// Tears `ws` down: volume bind first, then the overlay, then the
    /// writable layer.
    ///
    /// Every step is attempted and logged. The volume is detached lazily;
    /// the overlay is not, so a busy overlay fails here and its writable
    /// layer is kept.
    ///
    /// # Errors
    ///
    /// Returns the first failure.
    pub fn destroy(&self, ws: &Workspace) -> Result<()> {
        let mut first_error = None;

        if let Some(target) = ws.volume_target() {
            if let Err(e) = self.mounter.detach(&target) {
                tracing::warn!(target = %target.display(), error = %e, "failed to detach volume");
                let _ = first_error.get_or_insert(e);
            }
        }

        match self.mounter.unmount(&ws.merged) {
            Ok(()) => {
                if let Err(e) = std::fs::remove_dir_all(&ws.container_dir) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(dir = %ws.container_dir.display(), error = %e, "failed to remove writable layer");
                        let _ = first_error.get_or_insert(BurrowError::io(&ws.container_dir)(e));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    merged = %ws.merged.display(),
                    error = %e,
                    "overlay still mounted, keeping writable layer"
                );
                let _ = first_error.get_or_insert(e);
            }
        }

        tracing::info!(dir = %ws.container_dir.display(), "workspace destroyed");
        first_error.map_or(Ok(()), Err)
    }

    fn bind_volume(&self, spec: &VolumeSpec, target: &Path) -> Result<()> {
        std::fs::create_dir_all(&spec.host).map_err(BurrowError::io(&spec.host))?;
        std::fs::create_dir_all(target).map_err(BurrowError::io(target))?;
        self.mounter.bind_mount(&spec.host, target)
    }

    fn remove_container_dir(&self, ws: &Workspace) {
        if let Err(e) = std::fs::remove_dir_all(&ws.container_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %ws.container_dir.display(), error = %e, "failed to remove workspace directory");
            }
        }
    }
}

/// Container paths are interpreted relative to the container root.
fn relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn validate_volume(spec: &VolumeSpec) -> Result<()> {
    let escapes = spec
        .container
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if escapes || relative(&spec.container).as_os_str().is_empty() {
        return Err(BurrowError::Config {
            message: format!("volume target must be a path inside the container, got {}", spec.container.display()),
        });
    }
    Ok(())
}
