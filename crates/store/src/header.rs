//! Header region: the store's single source of truth for its layout.
//!
//! # Layout (256 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     magic (0x4D454F57, "MEOW")
//! 4       4     version
//! 8       8     file_size
//! 16      8     client_table_offset
//! 24      8     keystroke_tree_offset
//! 32      8     clipboard_tree_offset
//! 40      8     window_tree_offset
//! 48      4     num_clients
//! 52      4     max_clients
//! 56      8     next_free_offset
//! 64      4     node_size            (extension)
//! 68      4     reserved
//! 72      8     commit_id            (extension)
//! 80      168   reserved
//! 248     8     checksum (XXH3-64 of bytes 0..248)
//! ```
//!
//! Tools that only understand the first 64 bytes can ignore the rest.
//!
//! The client table has two images laid out back to back after the header
//! region. `client_table_offset` names the committed one; a commit that
//! changes clients writes the other image and publishes its offset.
//!
//! # Commit protocol
//!
//! Two images of the header exist: the primary at offset 0 and a staged
//! copy at [`STAGED_HEADER_OFFSET`]. A commit:
//!
//! 1. syncs the nodes and records written by the transaction,
//! 2. writes the new image to the staged slot and syncs,
//! 3. writes the same image to the primary slot and syncs.
//!
//! A crash before step 2 completes leaves the old primary in force. A crash
//! during step 3 leaves a torn primary whose checksum fails, and the staged
//! image (already durable) takes over. Either way every published offset
//! points at fully written structure, client table image included.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    backend::StorageBackend,
    client::CLIENT_SLOT_SIZE,
    error::{Error, Offset, Result},
    page::allocator::ALIGNMENT,
    record::EventKind,
};

/// Magic tag at offset 0 ("MEOW" read as a little-endian u32).
pub const MAGIC: u32 = 0x4D45_4F57;

/// Highest format version this build understands.
pub const FORMAT_VERSION: u32 = 1;

/// Size of one header image.
pub const HEADER_SIZE: usize = 256;

/// Offset of the staged header image.
pub const STAGED_HEADER_OFFSET: Offset = HEADER_SIZE as Offset;

/// First byte after both header images; the client table starts here.
pub const HEADER_REGION_END: Offset = 2 * HEADER_SIZE as Offset;

/// Largest client table capacity a header may record.
pub const MAX_CLIENTS: u32 = 1 << 20;

const CHECKSUM_OFFSET: usize = HEADER_SIZE - 8;

/// Decoded header image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Format version.
    pub version: u32,
    /// Size of the backing storage covered by this image.
    pub file_size: u64,
    /// Start of the committed client table image.
    pub client_table_offset: Offset,
    /// Tree roots indexed by [`EventKind::index`]; 0 means empty.
    pub tree_roots: [Offset; EventKind::COUNT],
    /// Number of active client slots.
    pub num_clients: u32,
    /// Capacity of the client table.
    pub max_clients: u32,
    /// Next offset the allocator hands out.
    pub next_free_offset: Offset,
    /// Size in bytes of every tree node.
    pub node_size: u32,
    /// Number of commits since the store was created.
    pub commit_id: u64,
}

/// Changes produced by one write transaction, applied at commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderDelta {
    /// New tree roots, by [`EventKind::index`].
    pub tree_roots: [Option<Offset>; EventKind::COUNT],
    /// New active client count.
    pub num_clients: Option<u32>,
    /// New allocator position.
    pub next_free_offset: Option<Offset>,
    /// New storage size.
    pub file_size: Option<u64>,
    /// Client table image written by the transaction.
    pub client_table_offset: Option<Offset>,
}

impl HeaderDelta {
    /// True when the delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.tree_roots.iter().all(Option::is_none)
            && self.num_clients.is_none()
            && self.next_free_offset.is_none()
            && self.file_size.is_none()
            && self.client_table_offset.is_none()
    }
}

/// How the committed header was obtained on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSource {
    /// The primary image was valid and current.
    Primary,
    /// The staged image was used (torn primary or interrupted commit).
    Staged,
}

impl Header {
    /// Builds the header of a freshly created store.
    ///
    /// Both client table images sit right after the two header images, the
    /// first one committed, and the allocator starts after them.
    pub fn initial(max_clients: u32, node_size: u32) -> Self {
        let max_clients = max_clients.clamp(1, MAX_CLIENTS);
        let layout = TableLayout::new(max_clients);
        Self {
            version: FORMAT_VERSION,
            file_size: layout.data_start,
            client_table_offset: layout.images[0],
            tree_roots: [0; EventKind::COUNT],
            num_clients: 0,
            max_clients,
            next_free_offset: layout.data_start,
            node_size,
            commit_id: 0,
        }
    }

    /// Root offset of the tree for `kind` (0 = empty).
    pub fn root(&self, kind: EventKind) -> Offset {
        self.tree_roots[kind.index()]
    }

    /// Offsets of the two client table images.
    pub fn client_table_images(&self) -> [Offset; 2] {
        TableLayout::new(self.max_clients).images
    }

    /// Image a commit that changes clients writes next.
    pub fn next_client_table_offset(&self) -> Offset {
        let [first, second] = self.client_table_images();
        if self.client_table_offset == first { second } else { first }
    }

    /// First offset past both client table images: the lowest offset a node
    /// or record may occupy.
    pub fn data_start(&self) -> Offset {
        TableLayout::new(self.max_clients).data_start
    }

    /// Checks the structural invariants every committed image must hold.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptHeader`] naming the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |reason: String| Err(Error::CorruptHeader { reason });

        if self.next_free_offset > self.file_size {
            return corrupt(format!(
                "next_free_offset {} exceeds file_size {}",
                self.next_free_offset, self.file_size
            ));
        }
        if self.num_clients > self.max_clients {
            return corrupt(format!(
                "num_clients {} exceeds max_clients {}",
                self.num_clients, self.max_clients
            ));
        }
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return corrupt(format!("max_clients {} outside 1..={MAX_CLIENTS}", self.max_clients));
        }
        if !self.client_table_images().contains(&self.client_table_offset) {
            return corrupt(format!(
                "client_table_offset {} is not a client table image",
                self.client_table_offset
            ));
        }
        if self.data_start() > self.next_free_offset {
            return corrupt(format!(
                "client table ends at {} past next_free_offset {}",
                self.data_start(),
                self.next_free_offset
            ));
        }
        for kind in EventKind::ALL {
            let root = self.root(kind);
            if root != 0 && (root < self.data_start() || root >= self.next_free_offset) {
                return corrupt(format!(
                    "{kind} root {root} outside data region [{}, {})",
                    self.data_start(),
                    self.next_free_offset
                ));
            }
        }
        if !crate::page::is_valid_node_size(self.node_size) {
            return corrupt(format!("invalid node_size {}", self.node_size));
        }
        Ok(())
    }

    /// Produces the image that results from applying `delta`.
    ///
    /// The commit id is advanced; the result is validated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptHeader`] if the new image violates an invariant.
    pub fn apply(&self, delta: &HeaderDelta) -> Result<Header> {
        let mut next = self.clone();
        for (root, change) in next.tree_roots.iter_mut().zip(delta.tree_roots.iter()) {
            if let Some(offset) = change {
                *root = *offset;
            }
        }
        if let Some(num_clients) = delta.num_clients {
            next.num_clients = num_clients;
        }
        if let Some(next_free) = delta.next_free_offset {
            next.next_free_offset = next_free;
        }
        if let Some(file_size) = delta.file_size {
            next.file_size = file_size;
        }
        if let Some(offset) = delta.client_table_offset {
            next.client_table_offset = offset;
        }
        next.commit_id = self.commit_id + 1;
        next.validate()?;
        Ok(next)
    }

    /// Serializes the header, including its checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], self.version);
        LittleEndian::write_u64(&mut buf[8..16], self.file_size);
        LittleEndian::write_u64(&mut buf[16..24], self.client_table_offset);
        for (i, root) in self.tree_roots.iter().enumerate() {
            let at = 24 + i * 8;
            LittleEndian::write_u64(&mut buf[at..at + 8], *root);
        }
        LittleEndian::write_u32(&mut buf[48..52], self.num_clients);
        LittleEndian::write_u32(&mut buf[52..56], self.max_clients);
        LittleEndian::write_u64(&mut buf[56..64], self.next_free_offset);
        LittleEndian::write_u32(&mut buf[64..68], self.node_size);
        LittleEndian::write_u64(&mut buf[72..80], self.commit_id);

        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[..CHECKSUM_OFFSET]);
        LittleEndian::write_u64(&mut buf[CHECKSUM_OFFSET..], checksum);
        buf
    }

    /// Strictly decodes and validates a header image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the buffer is not exactly 256 bytes.
    /// Returns [`Error::CorruptHeader`] on bad magic, bad checksum or a
    /// violated invariant.
    /// Returns [`Error::UnsupportedVersion`] if the version is newer than
    /// [`FORMAT_VERSION`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_SIZE {
            return Err(Error::Decode {
                what: "header",
                reason: format!("expected {HEADER_SIZE} bytes, got {}", buf.len()),
            });
        }

        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != MAGIC {
            return Err(Error::CorruptHeader { reason: format!("bad magic {magic:#010x}") });
        }

        let version = LittleEndian::read_u32(&buf[4..8]);
        if version == 0 {
            return Err(Error::CorruptHeader { reason: "version 0".to_string() });
        }
        if version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }

        let stored = LittleEndian::read_u64(&buf[CHECKSUM_OFFSET..]);
        let computed = xxhash_rust::xxh3::xxh3_64(&buf[..CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(Error::CorruptHeader { reason: "checksum mismatch".to_string() });
        }

        let mut tree_roots = [0; EventKind::COUNT];
        for (i, root) in tree_roots.iter_mut().enumerate() {
            let at = 24 + i * 8;
            *root = LittleEndian::read_u64(&buf[at..at + 8]);
        }

        let header = Self {
            version,
            file_size: LittleEndian::read_u64(&buf[8..16]),
            client_table_offset: LittleEndian::read_u64(&buf[16..24]),
            tree_roots,
            num_clients: LittleEndian::read_u32(&buf[48..52]),
            max_clients: LittleEndian::read_u32(&buf[52..56]),
            next_free_offset: LittleEndian::read_u64(&buf[56..64]),
            node_size: LittleEndian::read_u32(&buf[64..68]),
            commit_id: LittleEndian::read_u64(&buf[72..80]),
        };
        header.validate()?;
        Ok(header)
    }
}

/// Client table images and data region start for a table capacity.
struct TableLayout {
    images: [Offset; 2],
    data_start: Offset,
}

impl TableLayout {
    fn new(max_clients: u32) -> Self {
        let len = u64::from(max_clients).saturating_mul(CLIENT_SLOT_SIZE as u64);
        let second = HEADER_REGION_END.saturating_add(len);
        let end = second.saturating_add(len);
        let data_start = end.checked_next_multiple_of(ALIGNMENT).unwrap_or(u64::MAX);
        Self { images: [HEADER_REGION_END, second], data_start }
    }
}

/// Reads both header images and picks the committed one.
///
/// The valid image with the higher commit id wins. An unsupported version in
/// the primary image is fatal regardless of the staged copy.
///
/// # Errors
///
/// Returns the primary image's decode error when neither image is valid.
pub fn read_committed<B: StorageBackend>(backend: &B) -> Result<(Header, HeaderSource)> {
    let size = backend.file_size()?;
    if size < HEADER_REGION_END {
        return Err(Error::CorruptHeader {
            reason: format!("file is {size} bytes, shorter than the header region"),
        });
    }

    let primary = Header::from_bytes(&backend.read_vec(0, HEADER_SIZE)?);
    if let Err(Error::UnsupportedVersion { version }) = primary {
        return Err(Error::UnsupportedVersion { version });
    }
    let staged = Header::from_bytes(&backend.read_vec(STAGED_HEADER_OFFSET, HEADER_SIZE)?);

    let (header, source) = match (primary, staged) {
        (Ok(p), Ok(s)) if s.commit_id > p.commit_id => (s, HeaderSource::Staged),
        (Ok(p), _) => (p, HeaderSource::Primary),
        (Err(_), Ok(s)) => (s, HeaderSource::Staged),
        (Err(e), Err(_)) => return Err(e),
    };

    if header.file_size > size {
        return Err(Error::CorruptHeader {
            reason: format!("file is {size} bytes, header records {}", header.file_size),
        });
    }
    Ok((header, source))
}

/// Durably publishes `header` using the staged-then-primary protocol.
///
/// With `sync` disabled the writes still happen in the same order but
/// durability is left to the operating system.
///
/// # Errors
///
/// Returns `Error::Io` if any write or sync fails. The previously published
/// image stays authoritative in that case.
pub fn publish<B: StorageBackend>(backend: &B, header: &Header, sync: bool) -> Result<()> {
    let bytes = header.to_bytes();

    if sync {
        backend.sync()?;
    }
    backend.write_at(STAGED_HEADER_OFFSET, &bytes)?;
    if sync {
        backend.sync()?;
    }
    backend.write_at(0, &bytes)?;
    if sync {
        backend.sync()?;
    }
    Ok(())
}
