//! Tree node pages.
//!
//! Every node occupies `node_size` bytes at an allocator-assigned offset and
//! starts with a 16-byte header:
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   -----
//! 0       1      Node type (1 = branch, 2 = leaf)
//! 1       1      Reserved
//! 2       2      Entry count
//! 4       4      Checksum (XXH3-64 truncated to 32 bits, over bytes 16..)
//! 8       8      Commit id of the transaction that wrote the node
//! ```
//!
//! Leaves hold `(key, record_offset)` pairs. Branches hold `first_child`
//! followed by `(key, child)` pairs where `key` is the smallest key reachable
//! through `child`.

pub mod allocator;
pub mod cache;

pub use allocator::{ALIGNMENT, Allocator};
use byteorder::{ByteOrder, LittleEndian};
pub use cache::NodeCache;

use crate::error::{Error, Offset, Result};

/// Node header size in bytes.
pub const NODE_HEADER_SIZE: usize = 16;

/// Size of one `(key, offset)` entry.
pub const ENTRY_SIZE: usize = 16;

/// Default node size.
pub const DEFAULT_NODE_SIZE: u32 = 4096;

/// Smallest supported node size.
pub const MIN_NODE_SIZE: u32 = 128;

/// Largest supported node size.
pub const MAX_NODE_SIZE: u32 = 65536;

/// True if `size` is a power of two within the supported range.
pub fn is_valid_node_size(size: u32) -> bool {
    size.is_power_of_two() && (MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&size)
}

/// Node type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// Interior node.
    Branch = 1,
    /// Leaf node.
    Leaf = 2,
}

impl TryFrom<u8> for NodeKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            1 => Ok(Self::Branch),
            2 => Ok(Self::Leaf),
            other => Err(other),
        }
    }
}

/// One `(key, offset)` pair. The offset is a record in leaves and a child
/// node in branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Packed index key.
    pub key: u64,
    /// Record or child offset.
    pub offset: Offset,
}

/// Decoded tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Where the node lives.
    pub offset: Offset,
    /// Branch or leaf.
    pub kind: NodeKind,
    /// Commit that wrote the node.
    pub commit_id: u64,
    /// Leftmost child (branches only, 0 for leaves).
    pub first_child: Offset,
    /// Sorted entries.
    pub entries: Vec<Entry>,
}

impl Node {
    /// Creates an empty leaf.
    pub fn leaf(offset: Offset, commit_id: u64) -> Self {
        Self { offset, kind: NodeKind::Leaf, commit_id, first_child: 0, entries: Vec::new() }
    }

    /// Creates a branch with a single child.
    pub fn branch(offset: Offset, commit_id: u64, first_child: Offset) -> Self {
        Self { offset, kind: NodeKind::Branch, commit_id, first_child, entries: Vec::new() }
    }

    /// Returns true for leaves.
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Maximum number of entries a node of this kind holds at `node_size`.
    pub fn capacity(kind: NodeKind, node_size: u32) -> usize {
        let body = node_size as usize - NODE_HEADER_SIZE;
        match kind {
            NodeKind::Leaf => body / ENTRY_SIZE,
            NodeKind::Branch => (body - 8) / ENTRY_SIZE,
        }
    }

    /// Number of children of a branch.
    pub fn child_count(&self) -> usize {
        self.entries.len() + 1
    }

    /// Child at `index`, where index 0 is `first_child`.
    pub fn child(&self, index: usize) -> Offset {
        if index == 0 { self.first_child } else { self.entries[index - 1].offset }
    }

    /// Replaces the child at `index`.
    pub fn set_child(&mut self, index: usize, child: Offset) {
        if index == 0 {
            self.first_child = child;
        } else {
            self.entries[index - 1].offset = child;
        }
    }

    /// Serializes the node into a `node_size` buffer with a fresh checksum.
    pub fn encode(&self, node_size: u32) -> Vec<u8> {
        let mut buf = vec![0u8; node_size as usize];
        buf[0] = self.kind as u8;
        LittleEndian::write_u16(&mut buf[2..4], self.entries.len() as u16);
        LittleEndian::write_u64(&mut buf[8..16], self.commit_id);

        let mut at = NODE_HEADER_SIZE;
        if self.kind == NodeKind::Branch {
            LittleEndian::write_u64(&mut buf[at..at + 8], self.first_child);
            at += 8;
        }
        for entry in &self.entries {
            LittleEndian::write_u64(&mut buf[at..at + 8], entry.key);
            LittleEndian::write_u64(&mut buf[at + 8..at + 16], entry.offset);
            at += ENTRY_SIZE;
        }

        let checksum = checksum(&buf);
        LittleEndian::write_u32(&mut buf[4..8], checksum);
        buf
    }

    /// Strictly decodes the node stored at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] on an unknown type tag, an entry count
    /// past capacity, a checksum mismatch or entries out of order.
    pub fn decode(offset: Offset, buf: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| Error::CorruptTree { offset, reason };

        let node_size = u32::try_from(buf.len())
            .ok()
            .filter(|&size| is_valid_node_size(size))
            .ok_or_else(|| corrupt(format!("unexpected node size {}", buf.len())))?;

        let kind = NodeKind::try_from(buf[0])
            .map_err(|tag| corrupt(format!("unknown node type {tag}")))?;

        let count = LittleEndian::read_u16(&buf[2..4]) as usize;
        let capacity = Self::capacity(kind, node_size);
        if count > capacity {
            return Err(corrupt(format!("entry count {count} exceeds capacity {capacity}")));
        }

        let stored = LittleEndian::read_u32(&buf[4..8]);
        if stored != checksum(buf) {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        let commit_id = LittleEndian::read_u64(&buf[8..16]);
        let mut at = NODE_HEADER_SIZE;
        let mut first_child = 0;
        if kind == NodeKind::Branch {
            first_child = LittleEndian::read_u64(&buf[at..at + 8]);
            at += 8;
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(Entry {
                key: LittleEndian::read_u64(&buf[at..at + 8]),
                offset: LittleEndian::read_u64(&buf[at + 8..at + 16]),
            });
            at += ENTRY_SIZE;
        }

        if entries.windows(2).any(|pair| pair[0].key > pair[1].key) {
            return Err(corrupt("entries out of order".to_string()));
        }
        if kind == NodeKind::Branch && count == 0 {
            return Err(corrupt("branch without separators".to_string()));
        }

        Ok(Self { offset, kind, commit_id, first_child, entries })
    }
}

fn checksum(buf: &[u8]) -> u32 {
    xxhash_rust::xxh3::xxh3_64(&buf[NODE_HEADER_SIZE..]) as u32
}

/// Verifies a raw node buffer's checksum without decoding it.
pub fn verify_checksum(buf: &[u8]) -> bool {
    buf.len() >= NODE_HEADER_SIZE && LittleEndian::read_u32(&buf[4..8]) == checksum(buf)
}
