//! Temporary directory management for tests.
//!
//! [`TestDir`] wraps [`tempfile::TempDir`] with the few helpers store tests
//! need: a path inside the directory and a way to copy a store file aside.

// Test utilities are expected to panic on failure
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A managed temporary directory for tests.
///
/// The directory is removed when this struct is dropped.
///
/// # Example
///
/// ```
/// use meowkey_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let store_path = dir.join("events.meow");
/// assert!(store_path.starts_with(dir.path()));
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates a new temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let inner = TempDir::new().expect("failed to create temp directory");
        Self { inner }
    }

    /// Returns the path to the temporary directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Joins a relative path to the temporary directory.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.inner.path().join(path)
    }

    /// Copies `file` (relative to the directory) to `copy` and returns the
    /// new path. Used to freeze a store file before a simulated crash.
    ///
    /// # Panics
    ///
    /// Panics if the copy fails.
    pub fn snapshot_file<P: AsRef<Path>, Q: AsRef<Path>>(&self, file: P, copy: Q) -> PathBuf {
        let target = self.join(copy);
        std::fs::copy(self.join(file), &target).expect("failed to copy file");
        target
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
