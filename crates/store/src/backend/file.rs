//! File-based storage backend using position-based I/O (`pread`/`pwrite`).
//!
//! On Unix, reads are lock-free via [`std::os::unix::fs::FileExt`]:
//! `read_exact_at()` takes `&self` and never touches the file cursor, so
//! any number of snapshot readers can walk trees concurrently with the writer.
//!
//! Writes and file extension are serialized via a lightweight
//! [`parking_lot::Mutex`] guard (a unit `()` sentinel, not wrapping the
//! `File`). The store funnels every mutation through one write transaction
//! at a time, so this is never contended in practice.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use super::StorageBackend;
use crate::error::{Error, Offset, Result};

/// File-based storage backend.
///
/// Durability requires the caller to invoke [`sync`](StorageBackend::sync)
/// after writes. Crash safety comes from the staged header commit in
/// [`crate::header`], not from this backend alone.
pub struct FileBackend {
    /// The underlying file handle.
    file: File,
    /// Serializes writes and `set_len` calls.
    write_lock: Mutex<()>,
    /// Refuse all writes.
    read_only: bool,
    path: PathBuf,
}

impl FileBackend {
    /// Opens an existing store file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Ok(Self::from_file(file, path.as_ref(), false))
    }

    /// Opens an existing store file for reading only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Ok(Self::from_file(file, path.as_ref(), true))
    }

    /// Opens a store file, creating an empty one if it does not exist.
    ///
    /// An existing file is never truncated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened or created.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Self::from_file(file, path.as_ref(), false))
    }

    fn from_file(file: File, path: &Path, read_only: bool) -> Self {
        Self { file, write_lock: Mutex::new(()), read_only, path: path.to_path_buf() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: Offset, buf: &mut [u8]) -> Result<()> {
        read_exact_at_offset(&self.file, buf, offset)
    }

    fn write_at(&self, offset: Offset, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let _guard = self.write_lock.lock();

        let file_len = self.file.metadata()?.len();
        let required_len = offset + data.len() as u64;
        if file_len < required_len {
            self.file.set_len(required_len)?;
        }

        write_all_at_offset(&self.file, data, offset)
    }

    fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn extend(&self, new_size: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let _guard = self.write_lock.lock();
        if self.file.metadata()?.len() < new_size {
            self.file.set_len(new_size)?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

/// Reads exactly `buf.len()` bytes from `file` at the given byte `offset`.
#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// Windows fallback: `seek_read` moves the file cursor, so concurrent
/// readers need external synchronization there.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

/// Writes all of `data` to `file` at the given byte `offset`.
#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

/// Windows fallback for positional writes.
#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_open_or_create_does_not_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");

        {
            let backend = FileBackend::open_or_create(&path).unwrap();
            backend.write_at(0, b"MEOW").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open_or_create(&path).unwrap();
        assert_eq!(backend.read_vec(0, 4).unwrap(), b"MEOW");
    }

    #[test]
    fn test_write_extends_file() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open_or_create(dir.path().join("events.db")).unwrap();

        assert_eq!(backend.file_size().unwrap(), 0);
        backend.write_at(1000, &[0xAB; 24]).unwrap();
        assert_eq!(backend.file_size().unwrap(), 1024);
        assert_eq!(backend.read_vec(1000, 24).unwrap(), vec![0xAB; 24]);
    }

    #[test]
    fn test_read_past_end_is_error() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open_or_create(dir.path().join("events.db")).unwrap();
        backend.extend(64).unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(backend.read_at(60, &mut buf), Err(Error::Io { .. })));
    }

    #[test]
    fn test_extend_never_shrinks() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open_or_create(dir.path().join("events.db")).unwrap();

        backend.extend(4096).unwrap();
        backend.extend(1024).unwrap();
        assert_eq!(backend.file_size().unwrap(), 4096);
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");
        FileBackend::open_or_create(&path).unwrap().extend(256).unwrap();

        let backend = FileBackend::open_read_only(&path).unwrap();
        assert!(backend.is_read_only());
        assert!(matches!(backend.write_at(0, b"x"), Err(Error::ReadOnly)));
        assert!(matches!(backend.extend(512), Err(Error::ReadOnly)));
        assert_eq!(backend.read_vec(0, 256).unwrap(), vec![0u8; 256]);
    }

    /// One thread rewrites a region while another reads a different one.
    #[test]
    fn test_concurrent_read_write_different_regions() {
        let dir = tempdir().unwrap();
        let backend =
            Arc::new(FileBackend::open_or_create(dir.path().join("events.db")).unwrap());

        backend.write_at(0, &[0x11; 64]).unwrap();
        backend.sync().unwrap();

        let b_write = Arc::clone(&backend);
        let b_read = Arc::clone(&backend);

        let writer = std::thread::spawn(move || {
            for i in 0u8..50 {
                b_write.write_at(4096, &[i; 64]).unwrap();
            }
        });

        let reader = std::thread::spawn(move || {
            for _ in 0..50 {
                let data = b_read.read_vec(0, 64).unwrap();
                assert!(data.iter().all(|&b| b == 0x11), "region 0 changed under writer");
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();

        assert_eq!(backend.read_vec(4096, 64).unwrap(), vec![49u8; 64]);
    }
}
