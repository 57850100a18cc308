//! In-memory storage backend for testing.

use parking_lot::RwLock;

use super::StorageBackend;
use crate::error::{Offset, Result};

/// In-memory storage backend.
///
/// All data is lost when the backend is dropped. Useful for unit tests,
/// benchmarks, and for building a store image before writing it out.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding a copy of `bytes` (e.g. a file image).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { data: RwLock::new(bytes.to_vec()) }
    }

    /// Returns a copy of the full storage image.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: Offset, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(buf.len());
        if end > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {offset} past end ({})", buf.len(), data.len()),
            )
            .into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: Offset, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn extend(&self, new_size: u64) -> Result<()> {
        let mut data = self.data.write();
        let new_size = new_size as usize;
        if data.len() < new_size {
            data.resize(new_size, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_in_memory_basic() {
        let backend = InMemoryBackend::new();

        backend.write_at(10, &[0x42; 6]).unwrap();
        assert_eq!(backend.file_size().unwrap(), 16);
        assert_eq!(backend.read_vec(8, 8).unwrap(), vec![0, 0, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42]);
    }

    #[test]
    fn test_in_memory_read_past_end() {
        let backend = InMemoryBackend::new();
        backend.extend(32).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(backend.read_at(30, &mut buf), Err(Error::Io { .. })));
    }

    #[test]
    fn test_in_memory_image_round_trip() {
        let backend = InMemoryBackend::new();
        backend.write_at(0, b"MEOW").unwrap();

        let copy = InMemoryBackend::from_bytes(&backend.to_bytes());
        assert_eq!(copy.read_vec(0, 4).unwrap(), b"MEOW");
    }
}
