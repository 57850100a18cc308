//! Monotonic space allocator.
//!
//! Space is never reclaimed: records are immutable and copy-on-write leaves
//! superseded nodes behind as unreachable garbage. The allocator only moves
//! `next_free` forward and grows the backing storage in whole chunks.

use parking_lot::Mutex;

use crate::{
    backend::StorageBackend,
    error::{Error, Offset, Result},
};

/// Every allocation starts on a multiple of this many bytes.
pub const ALIGNMENT: u64 = 64;

#[derive(Debug, Clone, Copy)]
struct Cursor {
    next_free: Offset,
    file_size: u64,
}

/// Bump allocator over the data region of the store.
#[derive(Debug)]
pub struct Allocator {
    cursor: Mutex<Cursor>,
    growth_chunk: u64,
    max_file_size: u64,
}

impl Allocator {
    /// Creates an allocator continuing from a committed header.
    pub fn new(next_free: Offset, file_size: u64, growth_chunk: u64, max_file_size: u64) -> Self {
        Self {
            cursor: Mutex::new(Cursor { next_free, file_size }),
            growth_chunk: growth_chunk.max(ALIGNMENT),
            max_file_size,
        }
    }

    /// Reserves `size` bytes and returns their offset.
    ///
    /// Extends `backend` by whole growth chunks (capped at the maximum file
    /// size) when the reservation runs past the current end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] if `size` is zero, the arithmetic
    /// overflows, or the store would exceed its maximum size.
    /// Returns [`Error::Io`] if extending the backend fails.
    pub fn allocate<B: StorageBackend>(&self, backend: &B, size: u64) -> Result<Offset> {
        if size == 0 {
            return Err(Error::AllocationFailure {
                requested: size,
                reason: "zero-sized allocation".to_string(),
            });
        }

        let mut cursor = self.cursor.lock();
        let offset = cursor.next_free.next_multiple_of(ALIGNMENT);
        let end = offset
            .checked_add(size)
            .and_then(|end| end.checked_next_multiple_of(ALIGNMENT))
            .ok_or_else(|| Error::AllocationFailure {
                requested: size,
                reason: "offset overflow".to_string(),
            })?;

        if end > self.max_file_size {
            return Err(Error::AllocationFailure {
                requested: size,
                reason: format!("store would exceed {} bytes", self.max_file_size),
            });
        }

        if end > cursor.file_size {
            let shortfall = end - cursor.file_size;
            let chunks = shortfall.div_ceil(self.growth_chunk);
            let grown = cursor
                .file_size
                .saturating_add(chunks.saturating_mul(self.growth_chunk))
                .min(self.max_file_size);
            backend.extend(grown)?;
            tracing::debug!(from = cursor.file_size, to = grown, "extended store");
            cursor.file_size = grown;
        }

        cursor.next_free = end;
        Ok(offset)
    }

    /// Next offset that would be handed out.
    pub fn next_free(&self) -> Offset {
        self.cursor.lock().next_free
    }

    /// Current size of the backing storage as seen by the allocator.
    pub fn file_size(&self) -> u64 {
        self.cursor.lock().file_size
    }

    /// Rewinds to a committed position, discarding uncommitted reservations.
    ///
    /// The file size is kept: storage already extended stays usable.
    pub fn rewind(&self, next_free: Offset) {
        self.cursor.lock().next_free = next_free;
    }
}
