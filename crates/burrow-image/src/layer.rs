//! Filesystem layer packing and unpacking.
//!
//! An image is a single tarball; unpacking it yields the read-only base
//! layer that every container of that image shares.

use std::fs::File;
use std::path::Path;

use burrow_common::error::{BurrowError, Result};

/// Extracts a tar archive to the target directory.
///
/// Supports both plain `.tar` and gzip-compressed `.tar.gz` / `.tgz` archives.
/// Returns the archive size in bytes.
///
/// # Errors
///
/// Returns an error if the archive cannot be opened or unpacked.
pub fn extract_layer(archive_path: &Path, target: &Path) -> Result<u64> {
    tracing::info!(
        archive = %archive_path.display(),
        target = %target.display(),
        "extracting layer"
    );

    std::fs::create_dir_all(target).map_err(BurrowError::io(target))?;

    let file = File::open(archive_path).map_err(BurrowError::io(archive_path))?;
    let size_bytes = file
        .metadata()
        .map_err(BurrowError::io(archive_path))?
        .len();

    if is_gzip_archive(archive_path) {
        let decoder = flate2::read::GzDecoder::new(file);
        tar::Archive::new(decoder)
            .unpack(target)
            .map_err(BurrowError::io(target))?;
    } else {
        tar::Archive::new(file)
            .unpack(target)
            .map_err(BurrowError::io(target))?;
    }

    tracing::info!(size = size_bytes, "layer extracted");
    Ok(size_bytes)
}

/// Packs the contents of `source` into an uncompressed tar at `archive_path`.
///
/// Entries are stored relative to `source`, so unpacking the result
/// recreates the directory's contents at the target root.
///
/// # Errors
///
/// Returns an error if the archive cannot be written or `source` cannot be read.
pub fn pack_directory(source: &Path, archive_path: &Path) -> Result<()> {
    tracing::info!(
        source = %source.display(),
        archive = %archive_path.display(),
        "packing layer"
    );

    let file = File::create(archive_path).map_err(BurrowError::io(archive_path))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", source)
        .map_err(BurrowError::io(source))?;
    let _ = builder
        .into_inner()
        .map_err(BurrowError::io(archive_path))?;
    Ok(())
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_tar_gz(dir: &Path) -> std::path::PathBuf {
        let tar_gz_path = dir.join("test.tar.gz");
        let file = File::create(&tar_gz_path).expect("failed to create tar.gz");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = b"hello from gzipped layer";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "gzhello.txt", &data[..])
            .expect("failed to append data");
        let encoder = builder.into_inner().expect("failed to finish encoder");
        let _ = encoder.finish().expect("failed to finish gzip");
        tar_gz_path
    }

    #[test]
    fn extract_gzip_tar_creates_expected_files() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let tar_gz_path = create_test_tar_gz(dir.path());
        let target = dir.path().join("extracted_gz");

        let size = extract_layer(&tar_gz_path, &target).expect("extract failed");
        assert!(size > 0);
        let content = std::fs::read_to_string(target.join("gzhello.txt")).expect("read failed");
        assert_eq!(content, "hello from gzipped layer");
    }

    #[test]
    fn pack_then_extract_preserves_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("rootfs");
        std::fs::create_dir_all(source.join("etc")).expect("mkdir");
        std::fs::write(source.join("etc/hostname"), "box\n").expect("write");

        let archive = dir.path().join("image.tar");
        pack_directory(&source, &archive).expect("pack");

        let target = dir.path().join("unpacked");
        let _ = extract_layer(&archive, &target).expect("extract");
        let content = std::fs::read_to_string(target.join("etc/hostname")).expect("read");
        assert_eq!(content, "box\n");
    }

    #[test]
    fn extract_nonexistent_archive_returns_error() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let result = extract_layer(&dir.path().join("missing.tar"), &dir.path().join("out"));
        assert!(result.is_err());
    }

    #[test]
    fn is_gzip_archive_detects_extensions() {
        assert!(is_gzip_archive(Path::new("layer.tar.gz")));
        assert!(is_gzip_archive(Path::new("layer.tgz")));
        assert!(!is_gzip_archive(Path::new("layer.tar")));
    }
}
