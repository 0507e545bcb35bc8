//! Local image store.
//!
//! Images live as tarballs under `<root>/images`; each is unpacked once into
//! `<root>/layers/<name>` and that directory is the shared, read-only base
//! layer for every container started from it.

use std::path::{Path, PathBuf};

use burrow_common::config::RuntimeConfig;
use burrow_common::error::{BurrowError, Result};

use crate::layer;

/// Archive suffixes probed for an image name, in order.
const ARCHIVE_SUFFIXES: [&str; 3] = ["tar", "tar.gz", "tgz"];

/// Resolves image names to base layers and stores committed images.
#[derive(Debug, Clone)]
pub struct ImageStore {
    images_dir: PathBuf,
    layers_dir: PathBuf,
}

impl ImageStore {
    /// Opens the store described by `config`.
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            images_dir: config.images_dir(),
            layers_dir: config.layers_dir(),
        }
    }

    /// Returns the directory holding image tarballs.
    #[must_use]
    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Returns the archive backing `image`, if one exists.
    #[must_use]
    pub fn archive_path(&self, image: &str) -> Option<PathBuf> {
        ARCHIVE_SUFFIXES
            .iter()
            .map(|suffix| self.images_dir.join(format!("{image}.{suffix}")))
            .find(|path| path.is_file())
    }

    /// Returns the base layer directory for `image`, unpacking it on first use.
    ///
    /// The archive is unpacked into a private staging directory and renamed
    /// into place, so a half-extracted layer is never handed out and
    /// concurrent resolvers never share a staging area.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if neither a layer nor an archive exists for
    /// `image`, or an I/O error if unpacking fails.
    pub fn base_layer(&self, image: &str) -> Result<PathBuf> {
        validate_name(image)?;
        let layer_dir = self.layers_dir.join(image);
        if layer_dir.is_dir() {
            return Ok(layer_dir);
        }

        let archive = self.archive_path(image).ok_or_else(|| BurrowError::NotFound {
            kind: "image",
            id: image.to_string(),
        })?;

        std::fs::create_dir_all(&self.layers_dir).map_err(BurrowError::io(&self.layers_dir))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{image}."))
            .tempdir_in(&self.layers_dir)
            .map_err(BurrowError::io(&self.layers_dir))?;
        let _ = layer::extract_layer(&archive, staging.path())?;
        if let Err(e) = std::fs::rename(staging.path(), &layer_dir) {
            // A concurrent resolver got there first; its layer is complete.
            if layer_dir.is_dir() {
                tracing::debug!(image, "base layer unpacked concurrently");
                return Ok(layer_dir);
            }
            return Err(BurrowError::io(&layer_dir)(e));
        }
        tracing::info!(image, layer = %layer_dir.display(), "base layer ready");
        Ok(layer_dir)
    }

    /// Packs `rootfs` into `<images>/<image>.tar` and returns the archive path.
    ///
    /// The archive appears atomically; a reader never sees a partial one.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the archive cannot be written.
    pub fn commit(&self, rootfs: &Path, image: &str) -> Result<PathBuf> {
        validate_name(image)?;
        std::fs::create_dir_all(&self.images_dir).map_err(BurrowError::io(&self.images_dir))?;
        let archive = self.images_dir.join(format!("{image}.tar"));
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{image}."))
            .tempfile_in(&self.images_dir)
            .map_err(BurrowError::io(&self.images_dir))?;
        layer::pack_directory(rootfs, staging.path())?;
        let _ = staging
            .persist(&archive)
            .map_err(|e| BurrowError::io(&archive)(e.error))?;
        tracing::info!(image, archive = %archive.display(), "image committed");
        Ok(archive)
    }
}

/// Image names become file names, so path separators are rejected.
fn validate_name(image: &str) -> Result<()> {
    if image.is_empty() || image.starts_with('.') || image.contains('/') {
        return Err(BurrowError::Config {
            message: format!("invalid image name {image:?}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &Path) -> ImageStore {
        ImageStore::new(&RuntimeConfig::with_root(root))
    }

    fn write_image(store: &ImageStore, name: &str) {
        let src = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(src.path().join("bin")).expect("mkdir");
        std::fs::write(src.path().join("bin/sh"), "#!").expect("write");
        std::fs::create_dir_all(store.images_dir()).expect("mkdir");
        layer::pack_directory(src.path(), &store.images_dir().join(format!("{name}.tar")))
            .expect("pack");
    }

    #[test]
    fn base_layer_unpacks_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        write_image(&store, "busybox");

        let layer = store.base_layer("busybox").expect("resolve");
        assert!(layer.join("bin/sh").exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("layers"))
            .expect("read layers")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(leftovers, vec!["busybox"]);

        std::fs::remove_file(store.archive_path("busybox").expect("archive")).expect("rm");
        assert_eq!(store.base_layer("busybox").expect("cached"), layer);
    }

    #[test]
    fn concurrent_resolvers_share_one_complete_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        write_image(&store, "busybox");

        let layers: Vec<PathBuf> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| store.base_layer("busybox").expect("resolve")))
                .collect();
            workers.into_iter().map(|w| w.join().expect("join")).collect()
        });

        assert!(layers.iter().all(|layer| *layer == dir.path().join("layers/busybox")));
        assert!(dir.path().join("layers/busybox/bin/sh").exists());
        assert_eq!(std::fs::read_dir(dir.path().join("layers")).expect("read").count(), 1);
    }

    #[test]
    fn missing_image_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = store(dir.path()).base_layer("nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn names_with_separators_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        assert!(store.base_layer("../etc").is_err());
        assert!(store.commit(dir.path(), "a/b").is_err());
    }

    #[test]
    fn commit_writes_tarball_that_resolves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let rootfs = dir.path().join("merged");
        std::fs::create_dir_all(&rootfs).expect("mkdir");
        std::fs::write(rootfs.join("state"), "saved").expect("write");

        let archive = store.commit(&rootfs, "snapshot").expect("commit");
        assert!(archive.ends_with("images/snapshot.tar"));
        assert_eq!(std::fs::read_dir(store.images_dir()).expect("read").count(), 1);
        let layer = store.base_layer("snapshot").expect("resolve");
        assert_eq!(std::fs::read_to_string(layer.join("state")).expect("read"), "saved");
    }
}
