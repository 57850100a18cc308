//! Storage backend abstraction for the event store.
//!
//! The store addresses its file by byte offset: the header lives at offset 0,
//! the client table and every node and record live at offsets handed out by
//! the allocator. The backend only moves bytes. Layout, checksums and the
//! commit protocol are handled above it.
//!
//! Two implementations are provided:
//! - [`FileBackend`]: positional I/O (`pread`/`pwrite`) on a single file
//! - [`InMemoryBackend`]: a growable buffer, for tests and ephemeral stores

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

use crate::error::{Offset, Result};

/// Storage backend trait for abstracting file I/O.
pub trait StorageBackend: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails or runs past the end of storage.
    fn read_at(&self, offset: Offset, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `data` starting at `offset`, growing storage if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    /// Returns `Error::ReadOnly` if the backend was opened read-only.
    fn write_at(&self, offset: Offset, data: &[u8]) -> Result<()>;

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Returns the current storage size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn file_size(&self) -> Result<u64>;

    /// Grows storage to `new_size` bytes. Never shrinks.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be extended.
    /// Returns `Error::ReadOnly` if the backend was opened read-only.
    fn extend(&self, new_size: u64) -> Result<()>;

    /// Whether writes are refused.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Reads `len` bytes at `offset` into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Same as [`read_at`](Self::read_at).
    fn read_vec(&self, offset: Offset, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}
