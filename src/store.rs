//! Local image store lookup.
//!
//! The orchestration layer only ever asks the store one question: does an
//! image with this name already exist? Materialization and mutation of the
//! store are entirely the puller's business.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::policy::ImageKind;

/// Errors from the image store lookup.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to inspect '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Read-only name-existence query against the local image store.
pub trait ImageStore {
    /// Check whether an image of the given kind and name exists.
    fn find(&self, kind: ImageKind, name: &str) -> Result<bool, StoreError>;
}

/// Image store backed by a plain directory (the image root).
///
/// A tar image occupies either an unpacked directory `NAME` or an archive
/// `NAME.tar`; a raw image occupies `NAME.raw` or a bare `NAME` file.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, kind: ImageKind, name: &str) -> [PathBuf; 2] {
        match kind {
            ImageKind::Tar => [self.root.join(name), self.root.join(format!("{name}.tar"))],
            ImageKind::Raw => [self.root.join(format!("{name}.raw")), self.root.join(name)],
        }
    }
}

impl ImageStore for DirStore {
    fn find(&self, kind: ImageKind, name: &str) -> Result<bool, StoreError> {
        for path in self.candidates(kind, name) {
            match std::fs::symlink_metadata(&path) {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Io { path, source: e }),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_root_is_not_found() {
        let store = DirStore::new("/nonexistent/imgpull-test-root");
        assert!(!store.find(ImageKind::Tar, "foo").unwrap());
    }

    #[test]
    fn test_finds_unpacked_tar_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("foo")).unwrap();

        let store = DirStore::new(dir.path());
        assert!(store.find(ImageKind::Tar, "foo").unwrap());
        assert!(!store.find(ImageKind::Tar, "bar").unwrap());
    }

    #[test]
    fn test_finds_raw_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("disk.raw"), b"").unwrap();

        let store = DirStore::new(dir.path());
        assert!(store.find(ImageKind::Raw, "disk").unwrap());
        assert!(!store.find(ImageKind::Raw, "other").unwrap());
    }

    #[test]
    fn test_kind_separation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("img.raw"), b"").unwrap();

        let store = DirStore::new(dir.path());
        assert!(store.find(ImageKind::Raw, "img").unwrap());
        // A raw file does not shadow the tar namespace.
        assert!(!store.find(ImageKind::Tar, "img").unwrap());
    }
}
