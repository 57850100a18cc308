//! The event store handle.
//!
//! [`EventStore`] owns the storage backend, the committed header, the client
//! table and the allocator. Mutations go through [`WriteTransaction`]s, one
//! at a time; reads go through [`Snapshot`]s, which never block and never
//! observe a partially applied commit.
//!
//! # Example
//!
//! ```no_run
//! use meowkey_store::{EventKind, EventStore};
//!
//! let store = EventStore::open_or_create("events.meow", Default::default())?;
//! store.register_client("001")?;
//! let receipt = store.record_event(EventKind::Keystroke, "001", b"A")?;
//! assert_eq!(receipt.sequence, 0);
//!
//! let snapshot = store.snapshot();
//! for record in snapshot.scan(EventKind::Keystroke, receipt.client_hash, 0, 10)? {
//!     println!("{:?}", record?);
//! }
//! # Ok::<(), meowkey_store::Error>(())
//! ```

use std::{
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{FileBackend, InMemoryBackend, StorageBackend},
    client::{ClientSlot, ClientTable, Registration},
    clock::Timestamper,
    config::StoreConfig,
    error::{Error, Offset, Result},
    header::{self, Header, HeaderSource},
    page::{ALIGNMENT, Allocator, Node, NodeCache},
    record::EventKind,
    transaction::{ClientEvent, IngestReceipt, Snapshot, WriteTransaction},
};

/// Times [`EventStore::refresh`] re-reads a header that moves under it.
const REFRESH_ATTEMPTS: usize = 4;

/// Single-file store of keystroke, clipboard and window events.
///
/// Generic over [`StorageBackend`]: use [`EventStore<FileBackend>`] for
/// persistent stores and [`EventStore<InMemoryBackend>`] for tests.
///
/// Thread-safe. One writer at a time, any number of concurrent snapshots.
pub struct EventStore<B: StorageBackend> {
    pub(crate) backend: B,
    pub(crate) config: StoreConfig,
    /// Last durably published header; swapped after each commit.
    pub(crate) committed: ArcSwap<Header>,
    pub(crate) clients: RwLock<ClientTable>,
    pub(crate) allocator: Allocator,
    pub(crate) cache: NodeCache,
    pub(crate) clock: Timestamper,
    write_lock: Mutex<()>,
    read_only: bool,
    /// Set once a commit failed after touching storage.
    poisoned: AtomicBool,
    header_source: Mutex<HeaderSource>,
    pub(crate) node_splits: AtomicU64,
    pub(crate) anomalies: AtomicU64,
    pub(crate) commits: AtomicU64,
}

impl EventStore<FileBackend> {
    /// Opens an existing store with default settings.
    ///
    /// Node size and client capacity always come from the header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened,
    /// [`Error::CorruptHeader`] if neither header image is valid and
    /// [`Error::UnsupportedVersion`] for a newer format.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens an existing store.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open), plus [`Error::InvalidConfig`].
    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let backend = FileBackend::open(path)?;
        if backend.file_size()? == 0 {
            return Err(Error::CorruptHeader { reason: "file is empty".to_string() });
        }
        Self::from_backend(backend, config)
    }

    /// Creates a new store with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created and
    /// [`Error::CorruptHeader`] if a non-empty file already exists there.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_config(path, StoreConfig::default())
    }

    /// Creates a new store.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create), plus [`Error::InvalidConfig`].
    pub fn create_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let backend = FileBackend::open_or_create(path)?;
        let size = backend.file_size()?;
        if size != 0 {
            return Err(Error::CorruptHeader {
                reason: format!("refusing to create over an existing {size}-byte file"),
            });
        }
        Self::from_backend(backend, config)
    }

    /// Opens the store at `path`, creating it if the file is missing or empty.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_or_create(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let backend = FileBackend::open_or_create(path)?;
        Self::from_backend(backend, config)
    }

    /// Opens a store for reading from another process.
    ///
    /// The reader sees the header committed when it opened; call
    /// [`refresh`](Self::refresh) to pick up later commits. Writes fail with
    /// [`Error::ReadOnly`].
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let backend = FileBackend::open_read_only(path)?;
        Self::from_backend(backend, StoreConfig::default())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.backend.path()
    }
}

impl EventStore<InMemoryBackend> {
    /// Creates an empty in-memory store. Data is lost on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(StoreConfig::default())
    }

    /// Creates an empty in-memory store with custom settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` is out of range.
    pub fn open_in_memory_with_config(config: StoreConfig) -> Result<Self> {
        Self::from_backend(InMemoryBackend::new(), config)
    }
}

impl<B: StorageBackend> EventStore<B> {
    /// Opens a store over `backend`, initializing it when empty.
    ///
    /// On a writable backend a stale or torn primary header is restored from
    /// the staged copy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`], [`Error::CorruptHeader`],
    /// [`Error::UnsupportedVersion`], [`Error::Decode`] for an unreadable
    /// client table, or `Error::Io`.
    pub fn from_backend(backend: B, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let read_only = backend.is_read_only();

        let fresh = backend.file_size()? == 0;
        let (header, source) = if fresh {
            if read_only {
                return Err(Error::CorruptHeader { reason: "file is empty".to_string() });
            }
            (Self::initialize(&backend, &config)?, HeaderSource::Primary)
        } else {
            header::read_committed(&backend)?
        };

        if source == HeaderSource::Staged && !read_only {
            warn!(commit_id = header.commit_id, "primary header invalid or stale, restoring from staged copy");
            backend.write_at(0, &header.to_bytes())?;
            backend.sync()?;
        }
        if header.node_size != config.node_size || header.max_clients != config.max_clients {
            debug!(
                node_size = header.node_size,
                max_clients = header.max_clients,
                "using geometry recorded in the header"
            );
        }

        let clients = if fresh { ClientTable::empty(&header) } else { ClientTable::load(&backend, &header)? };
        let latest = clients.slots().iter().map(|slot| slot.last_seen).max().unwrap_or(0);
        let allocator = Allocator::new(
            header.next_free_offset,
            backend.file_size()?,
            config.growth_chunk,
            config.max_file_size.max(header.file_size),
        );

        let store = Self {
            cache: NodeCache::new(config.cache_capacity),
            clock: Timestamper::starting_after(latest),
            clients: RwLock::new(clients),
            committed: ArcSwap::from_pointee(header),
            allocator,
            backend,
            config,
            write_lock: Mutex::new(()),
            read_only,
            poisoned: AtomicBool::new(false),
            header_source: Mutex::new(source),
            node_splits: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        };

        let header = store.committed.load();
        info!(
            commit_id = header.commit_id,
            clients = header.num_clients,
            file_size = header.file_size,
            read_only,
            "event store opened"
        );
        drop(header);
        Ok(store)
    }

    /// Writes the header and empty client table of a new store.
    fn initialize(backend: &B, config: &StoreConfig) -> Result<Header> {
        let mut header = Header::initial(config.max_clients, config.node_size);
        header.file_size = config
            .initial_file_size
            .max(header.next_free_offset)
            .next_multiple_of(ALIGNMENT)
            .min(config.max_file_size);

        backend.extend(header.file_size)?;
        header::publish(backend, &header, config.sync_on_commit)?;
        info!(
            node_size = header.node_size,
            max_clients = header.max_clients,
            file_size = header.file_size,
            "initialized new event store"
        );
        Ok(header)
    }

    /// Starts a write transaction, waiting for the current one to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] for a read-only store and
    /// [`Error::Poisoned`] after a commit failed part-way through its writes.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_, B>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let guard = self.write_lock.lock();
        if self.is_poisoned() {
            return Err(Error::Poisoned);
        }
        Ok(WriteTransaction::new(self, guard))
    }

    /// Whether a failed commit left storage ahead of this handle.
    ///
    /// The header may already carry the failed commit's id, so a poisoned
    /// handle refuses writes until the store is reopened.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            error!(
                commit_id = self.committed.load().commit_id,
                "commit failed after writing to storage; reopen the store to continue"
            );
        }
    }

    /// Captures the committed state for reading.
    pub fn snapshot(&self) -> Snapshot<'_, B> {
        Snapshot::new(self, self.committed.load_full())
    }

    /// Re-reads the header and client table written by another process.
    ///
    /// Returns whether the committed header changed. A writable store always
    /// returns `false`: its in-memory state is authoritative.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptHeader`] if no valid header image is found
    /// and [`Error::Decode`] if the client table it names is unreadable.
    pub fn refresh(&self) -> Result<bool> {
        if !self.read_only {
            return Ok(false);
        }
        for _ in 0..REFRESH_ATTEMPTS {
            let (header, source) = header::read_committed(&self.backend)?;
            if header == **self.committed.load() {
                return Ok(false);
            }
            let clients = ClientTable::load(&self.backend, &header);
            // A writer may have moved on and started reusing the image.
            if header::read_committed(&self.backend)?.0 != header {
                continue;
            }
            let clients = clients?;
            debug!(commit_id = header.commit_id, "picked up newer commit");
            *self.clients.write() = clients;
            *self.header_source.lock() = source;
            self.committed.store(Arc::new(header));
            return Ok(true);
        }
        debug!("header kept changing during refresh; keeping the current view");
        Ok(false)
    }

    /// Registers a client in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`], [`Error::HashCollision`],
    /// [`Error::TableFull`], [`Error::ReadOnly`] or `Error::Io`.
    pub fn register_client(&self, identifier: &str) -> Result<Registration> {
        let mut txn = self.begin_write()?;
        let registration = txn.register_client(identifier)?;
        txn.commit()?;
        Ok(registration)
    }

    /// Tombstones a client in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] if the identifier is not active.
    pub fn deregister_client(&self, identifier: &str) -> Result<ClientSlot> {
        let mut txn = self.begin_write()?;
        let slot = txn.deregister_client(identifier)?;
        txn.commit()?;
        Ok(slot)
    }

    /// Records one event and commits it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] if the identifier is not active,
    /// [`Error::AllocationFailure`] when the store is full, or `Error::Io`.
    pub fn record_event(&self, kind: EventKind, identifier: &str, payload: &[u8]) -> Result<IngestReceipt> {
        let mut txn = self.begin_write()?;
        let receipt = txn.record_event(kind, identifier, payload)?;
        txn.commit()?;
        Ok(receipt)
    }

    /// Slot of a registered client, active or tombstoned, with its counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] if the identifier was never
    /// registered.
    pub fn client_stats(&self, identifier: &str) -> Result<ClientSlot> {
        match self.clients.read().lookup_identifier(identifier) {
            Ok(slot) => Ok(slot.clone()),
            Err(Error::NotFound) => Err(Error::UnknownClient { identifier: identifier.to_string() }),
            Err(e) => Err(e),
        }
    }

    /// Active clients in slot order.
    pub fn clients(&self) -> Vec<ClientSlot> {
        self.clients.read().clients().cloned().collect()
    }

    /// Slot holding `hash`, preferring an active one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no slot carries the hash.
    pub fn lookup(&self, hash: u32) -> Result<ClientSlot> {
        self.clients.read().lookup(hash).cloned()
    }

    /// Events of a client for the given kinds, each kind in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] if the identifier was never
    /// registered and [`Error::CorruptTree`] if a tree is damaged.
    pub fn query_client(&self, identifier: &str, kinds: &[EventKind]) -> Result<Vec<ClientEvent>> {
        let hash = self.client_stats(identifier)?.hash;
        self.snapshot().query_client(hash, kinds)
    }

    /// Every event of a client across the three trees.
    ///
    /// # Errors
    ///
    /// Same as [`query_client`](Self::query_client).
    pub fn client_events(&self, identifier: &str) -> Result<Vec<ClientEvent>> {
        self.query_client(identifier, &EventKind::ALL)
    }

    /// Events of a client with `start <= timestamp <= end`, oldest first.
    ///
    /// # Errors
    ///
    /// Same as [`query_client`](Self::query_client).
    pub fn query_time_range(&self, identifier: &str, start: u64, end: u64) -> Result<Vec<ClientEvent>> {
        let hash = self.client_stats(identifier)?.hash;
        self.snapshot().query_time_range(hash, start, end)
    }

    /// Returns store statistics.
    pub fn stats(&self) -> StoreStats {
        let header = self.committed.load_full();
        let used_bytes = header.next_free_offset;
        StoreStats {
            file_size: header.file_size,
            used_bytes,
            usage_ratio: if header.file_size == 0 { 0.0 } else { used_bytes as f64 / header.file_size as f64 },
            active_clients: header.num_clients,
            max_clients: header.max_clients,
            commit_id: header.commit_id,
            commits: self.commits.load(Ordering::Relaxed),
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
            node_splits: self.node_splits.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
        }
    }

    /// Depth of each event tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if a leftmost path is damaged.
    pub fn tree_depths(&self) -> Result<[(EventKind, u32); EventKind::COUNT]> {
        self.snapshot().tree_depths()
    }

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.backend.sync()
    }

    /// Flushes and closes the store.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the final sync fails.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        info!(commit_id = self.committed.load().commit_id, "event store closed");
        Ok(())
    }

    /// The committed header.
    pub fn header(&self) -> Arc<Header> {
        self.committed.load_full()
    }

    /// Settings the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Which header image the current state was read from.
    pub fn header_source(&self) -> HeaderSource {
        *self.header_source.lock()
    }

    /// Whether writes are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The storage backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Reads a committed node through the cache.
    pub(crate) fn read_committed_node(&self, offset: Offset, node_size: u32) -> Result<Node> {
        if let Some(node) = self.cache.get(offset) {
            return Ok(node);
        }
        let buf = self.backend.read_vec(offset, node_size as usize)?;
        let node = Node::decode(offset, &buf)?;
        self.cache.insert(node.clone());
        Ok(node)
    }
}

/// Store statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    /// Size of the backing storage covered by the committed header.
    pub file_size: u64,
    /// Bytes below the allocator position.
    pub used_bytes: u64,
    /// `used_bytes / file_size`.
    pub usage_ratio: f64,
    /// Active clients.
    pub active_clients: u32,
    /// Client table capacity.
    pub max_clients: u32,
    /// Commits since the store was created.
    pub commit_id: u64,
    /// Commits since this handle was opened.
    pub commits: u64,
    /// Node cache hits since open.
    pub cache_hits: u64,
    /// Node cache misses since open.
    pub cache_misses: u64,
    /// Tree node splits since open.
    pub node_splits: u64,
    /// Sequence anomalies reported since open.
    pub anomalies: u64,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "file size:      {} bytes", self.file_size)?;
        writeln!(f, "used:           {} bytes ({:.1}%)", self.used_bytes, self.usage_ratio * 100.0)?;
        writeln!(f, "clients:        {}/{}", self.active_clients, self.max_clients)?;
        writeln!(f, "commit id:      {}", self.commit_id)?;
        writeln!(f, "cache:          {} hits, {} misses", self.cache_hits, self.cache_misses)?;
        write!(f, "splits:         {}, anomalies: {}", self.node_splits, self.anomalies)
    }
}
