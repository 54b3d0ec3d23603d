//! File-system backed [`TempStorage`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::services::TempStorage;

/// Temporary files kept flat under one root directory.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TempStorage for ScratchDir {
    fn create(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid temporary file name: {name:?}"),
            ));
        }

        fs::create_dir_all(&self.root)?;
        let path = self.root.join(name);

        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Removed stale temporary file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(path)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        if !path.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is outside the scratch directory", path.display()),
            ));
        }

        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_makes_root_and_clears_stale_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = ScratchDir::new(dir.path().join("nested"));

        let path = scratch.create("signed").expect("create");
        assert!(scratch.root().is_dir());
        fs::write(&path, b"stale").expect("write");

        let again = scratch.create("signed").expect("create again");
        assert_eq!(again, path);
        assert!(!again.exists(), "stale file should be removed");
    }

    #[test]
    fn create_rejects_path_like_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = ScratchDir::new(dir.path());
        for name in ["", "a/b", "..", "c\\d"] {
            let err = scratch.create(name).expect_err("must reject");
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "name {name:?}");
        }
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = ScratchDir::new(dir.path());
        let path = scratch.create("output").expect("create");
        fs::write(&path, b"data").expect("write");

        scratch.delete(&path).expect("first delete");
        assert!(!path.exists());
        scratch.delete(&path).expect("second delete is a no-op");
    }

    #[test]
    fn delete_refuses_paths_outside_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let other = tempfile::NamedTempFile::new().expect("temp file");
        let scratch = ScratchDir::new(dir.path().join("scratch"));

        let err = scratch.delete(other.path()).expect_err("must refuse");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(other.path().exists());
    }
}
