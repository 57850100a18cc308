//! Write transactions and read snapshots.
//!
//! A [`WriteTransaction`] buffers every node and record it produces. Nothing
//! reaches storage until [`WriteTransaction::commit`], which writes the
//! buffered data, then the inactive client table image, and finally publishes
//! a new header naming both. Dropping a transaction without committing
//! discards its work and rewinds the allocator.
//!
//! A [`Snapshot`] captures the committed header once and reads only through
//! its offsets, so later commits never change what it sees in the trees.

use std::{collections::HashMap, ops::Range, sync::Arc, sync::atomic::Ordering};

use parking_lot::MutexGuard;
use tracing::{debug, instrument, warn};

use crate::{
    backend::StorageBackend,
    btree::{Anomaly, EventScan, EventTree, NodeReader, NodeWriter},
    client::{ClientSlot, Registration},
    db::EventStore,
    error::{Error, Offset, Result},
    header::{self, Header, HeaderDelta},
    page::Node,
    record::{EventKind, EventRecord, IndexKey, IndexedRecord, RECORD_SIZE},
};

/// What [`WriteTransaction::record_event`] stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    /// Event stream the record went to.
    pub kind: EventKind,
    /// Hash of the client.
    pub client_hash: u32,
    /// Sequence assigned to the event.
    pub sequence: u32,
    /// Timestamp assigned to the event.
    pub timestamp: u64,
    /// Where the record was written.
    pub offset: Offset,
    /// Whether the payload was cut to fit.
    pub truncated: bool,
    /// Sequence irregularity observed while indexing.
    pub anomaly: Option<Anomaly>,
}

/// An event together with the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    /// Event stream.
    pub kind: EventKind,
    /// The stored record.
    pub record: EventRecord,
}

/// Exclusive write access to the store.
///
/// Only one exists at a time; [`EventStore::begin_write`] blocks until the
/// previous one is committed or dropped.
pub struct WriteTransaction<'s, B: StorageBackend> {
    store: &'s EventStore<B>,
    base: Arc<Header>,
    roots: [Offset; EventKind::COUNT],
    dirty_nodes: HashMap<Offset, Node>,
    records: HashMap<Offset, Vec<u8>>,
    splits: u64,
    anomalies: u64,
    poisoned: bool,
    finished: bool,
    io_attempted: bool,
    _guard: MutexGuard<'s, ()>,
}

impl<'s, B: StorageBackend> WriteTransaction<'s, B> {
    pub(crate) fn new(store: &'s EventStore<B>, guard: MutexGuard<'s, ()>) -> Self {
        let base = store.committed.load_full();
        Self {
            store,
            roots: base.tree_roots,
            base,
            dirty_nodes: HashMap::new(),
            records: HashMap::new(),
            splits: 0,
            anomalies: 0,
            poisoned: false,
            finished: false,
            io_attempted: false,
            _guard: guard,
        }
    }

    /// Header the transaction started from.
    pub fn base(&self) -> &Header {
        &self.base
    }

    /// Current root of the tree for `kind`, including uncommitted inserts.
    pub fn root(&self, kind: EventKind) -> Offset {
        self.roots[kind.index()]
    }

    fn nodes(&mut self) -> BufferedNodes<'_, B> {
        BufferedNodes {
            store: self.store,
            base: &self.base,
            dirty: &mut self.dirty_nodes,
            records: &self.records,
        }
    }

    fn reader(&self) -> BufferedReader<'_, B> {
        BufferedReader { store: self.store, base: &self.base, dirty: &self.dirty_nodes, records: &self.records }
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned { Err(Error::Aborted) } else { Ok(()) }
    }

    /// Registers a client, or returns its existing slot on reconnect.
    ///
    /// A client claiming a free slot starts each sequence after the highest
    /// one already indexed under its hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`], [`Error::HashCollision`] or
    /// [`Error::TableFull`]; the transaction stays usable after these.
    pub fn register_client(&mut self, identifier: &str) -> Result<Registration> {
        self.check_usable()?;
        let now = self.store.clock.now();
        let reader = self.reader();
        let roots = self.roots;

        let registration = self.store.clients.write().register(identifier, now, |hash| {
            let mut next = [0u32; EventKind::COUNT];
            for kind in EventKind::ALL {
                let tree = EventTree::<_, EventRecord>::new(kind, roots[kind.index()], &reader);
                next[kind.index()] = tree.last_sequence(hash)?.map_or(0, |s| s.saturating_add(1));
            }
            Ok(next)
        })?;

        debug!(identifier, slot = registration.slot, outcome = ?registration.outcome, "client registered");
        Ok(registration)
    }

    /// Tombstones an active client. Its identifier stays in the slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] if the identifier is not active.
    pub fn deregister_client(&mut self, identifier: &str) -> Result<ClientSlot> {
        self.check_usable()?;
        let mut clients = self.store.clients.write();
        let index = clients.active(identifier)?.index;
        let slot = clients.deregister(index)?.clone();
        debug!(identifier, slot = index, "client deregistered");
        Ok(slot)
    }

    /// Appends an event for an active client and indexes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] if the identifier is not active; the
    /// transaction stays usable. Storage, allocation or tree failures poison
    /// the transaction: later calls and [`commit`](Self::commit) return
    /// [`Error::Aborted`].
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub fn record_event(&mut self, kind: EventKind, identifier: &str, payload: &[u8]) -> Result<IngestReceipt> {
        self.check_usable()?;
        let (index, client_hash, sequence) = {
            let clients = self.store.clients.read();
            let slot = clients.active(identifier)?;
            (slot.index, slot.hash, slot.next_sequence[kind.index()])
        };
        if sequence == u32::MAX {
            return Err(Error::AllocationFailure {
                requested: 1,
                reason: format!("{kind} sequence space exhausted for {identifier}"),
            });
        }

        let timestamp = self.store.clock.now();
        let (record, truncated) = EventRecord::new(timestamp, client_hash, sequence, payload);

        let appended = self.append(kind, &record);
        let (offset, anomaly) = match appended {
            Ok(done) => done,
            Err(e) => {
                self.poisoned = true;
                return Err(e);
            },
        };

        if let Err(e) = self.store.clients.write().next_sequence(index, kind, timestamp) {
            self.poisoned = true;
            return Err(e);
        }

        if let Some(anomaly) = anomaly {
            self.anomalies += 1;
            warn!(%kind, client_hash = format_args!("{client_hash:#010x}"), %anomaly, "sequence anomaly");
        }
        if truncated {
            debug!(%kind, original = payload.len(), "payload truncated");
        }

        Ok(IngestReceipt { kind, client_hash, sequence, timestamp, offset, truncated, anomaly })
    }

    fn append(&mut self, kind: EventKind, record: &EventRecord) -> Result<(Offset, Option<Anomaly>)> {
        let offset = self.store.allocator.allocate(&self.store.backend, RECORD_SIZE as u64)?;
        self.records.insert(offset, record.encode());

        let root = self.roots[kind.index()];
        let (outcome, splits) = {
            let mut tree = EventTree::<_, EventRecord>::new(kind, root, self.nodes());
            let outcome = tree.insert(record.index_key(), offset)?;
            (outcome, tree.split_count())
        };
        self.splits += splits;
        self.roots[kind.index()] = outcome.root;
        Ok((offset, outcome.anomaly))
    }

    /// Highest sequence indexed for a client, including uncommitted inserts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if the tree is damaged.
    pub fn last_sequence(&self, kind: EventKind, client_hash: u32) -> Result<Option<u32>> {
        let reader = self.reader();
        EventTree::<_, EventRecord>::new(kind, self.root(kind), &reader).last_sequence(client_hash)
    }

    /// Looks up a record, including uncommitted inserts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTree`], [`Error::NotFound`] or
    /// [`Error::CorruptTree`].
    pub fn point_lookup(&self, kind: EventKind, client_hash: u32, sequence: u32) -> Result<EventRecord> {
        let reader = self.reader();
        EventTree::new(kind, self.root(kind), &reader).point_lookup(client_hash, sequence)
    }

    /// Writes buffered data and publishes the new header.
    ///
    /// Order: records and nodes, the inactive client table image, then the
    /// header through the staged-then-primary protocol. The new state becomes
    /// visible to snapshots only after the header is durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if an earlier operation failed and
    /// `Error::Io` if storage rejects a write. The previously committed state
    /// stays in force either way. Once a write was attempted the store
    /// refuses further transactions; see [`Error::Poisoned`].
    pub fn commit(mut self) -> Result<()> {
        self.check_usable()?;

        let clients_changed = self.store.clients.read().is_dirty();
        if self.records.is_empty() && self.dirty_nodes.is_empty() && !clients_changed {
            self.finished = true;
            return Ok(());
        }

        let header = self.publish(clients_changed)?;
        let commit_id = header.commit_id;
        let table_offset = header.client_table_offset;
        self.store.committed.store(Arc::new(header));
        self.store.clients.write().committed(table_offset);

        for (_, node) in self.dirty_nodes.drain() {
            self.store.cache.insert(node);
        }
        self.store.node_splits.fetch_add(self.splits, Ordering::Relaxed);
        self.store.anomalies.fetch_add(self.anomalies, Ordering::Relaxed);
        self.store.commits.fetch_add(1, Ordering::Relaxed);

        debug!(commit_id, records = self.records.len(), "transaction committed");
        self.finished = true;
        Ok(())
    }

    fn publish(&mut self, clients_changed: bool) -> Result<Header> {
        let backend = &self.store.backend;
        let node_size = self.base.node_size;
        self.io_attempted = true;

        for (offset, bytes) in &self.records {
            backend.write_at(*offset, bytes)?;
        }
        for node in self.dirty_nodes.values() {
            backend.write_at(node.offset, &node.encode(node_size))?;
        }

        let clients = self.store.clients.read();
        let mut delta = HeaderDelta {
            num_clients: Some(clients.num_active()),
            next_free_offset: Some(self.store.allocator.next_free()),
            file_size: Some(self.store.allocator.file_size()),
            ..HeaderDelta::default()
        };
        if clients_changed {
            let image = clients.next_image();
            for (offset, bytes) in &image.slots {
                backend.write_at(*offset, bytes)?;
            }
            delta.client_table_offset = Some(image.offset);
        }
        drop(clients);
        for kind in EventKind::ALL {
            if self.roots[kind.index()] != self.base.root(kind) {
                delta.tree_roots[kind.index()] = Some(self.roots[kind.index()]);
            }
        }

        let header = self.base.apply(&delta)?;
        header::publish(backend, &header, self.store.config.sync_on_commit)?;
        Ok(header)
    }

    /// Discards the transaction.
    pub fn abort(self) {}
}

impl<B: StorageBackend> Drop for WriteTransaction<'_, B> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.store.clients.write().rollback();
        // Once storage may hold a header referring to this space, it must not
        // be handed out again, and the in-memory state can no longer be
        // trusted to match what is durable.
        if self.io_attempted {
            self.store.poison();
        } else {
            self.store.allocator.rewind(self.base.next_free_offset);
        }
        self.store.cache.invalidate_from(self.base.next_free_offset);
        debug!(records = self.records.len(), poisoned = self.poisoned, "transaction discarded");
    }
}

/// Node provider for inserts: reads see this transaction's writes.
struct BufferedNodes<'t, B: StorageBackend> {
    store: &'t EventStore<B>,
    base: &'t Header,
    dirty: &'t mut HashMap<Offset, Node>,
    records: &'t HashMap<Offset, Vec<u8>>,
}

/// Read-only view of a transaction's buffered state.
struct BufferedReader<'t, B: StorageBackend> {
    store: &'t EventStore<B>,
    base: &'t Header,
    dirty: &'t HashMap<Offset, Node>,
    records: &'t HashMap<Offset, Vec<u8>>,
}

fn buffered_bytes<B: StorageBackend>(
    store: &EventStore<B>,
    records: &HashMap<Offset, Vec<u8>>,
    offset: Offset,
    len: usize,
) -> Result<Vec<u8>> {
    match records.get(&offset) {
        Some(bytes) if bytes.len() == len => Ok(bytes.clone()),
        _ => store.backend.read_vec(offset, len),
    }
}

impl<B: StorageBackend> NodeReader for BufferedNodes<'_, B> {
    fn read_node(&self, offset: Offset) -> Result<Node> {
        match self.dirty.get(&offset) {
            Some(node) => Ok(node.clone()),
            None => self.store.read_committed_node(offset, self.base.node_size),
        }
    }

    fn read_bytes(&self, offset: Offset, len: usize) -> Result<Vec<u8>> {
        buffered_bytes(self.store, self.records, offset, len)
    }

    fn bounds(&self) -> Range<Offset> {
        self.base.data_start()..self.store.allocator.next_free()
    }

    fn node_size(&self) -> u32 {
        self.base.node_size
    }
}

impl<B: StorageBackend> NodeWriter for BufferedNodes<'_, B> {
    fn allocate_node(&mut self) -> Result<Offset> {
        self.store.allocator.allocate(&self.store.backend, u64::from(self.base.node_size))
    }

    fn write_node(&mut self, node: Node) -> Result<()> {
        self.dirty.insert(node.offset, node);
        Ok(())
    }

    fn is_fresh(&self, offset: Offset) -> bool {
        offset >= self.base.next_free_offset
    }

    fn commit_id(&self) -> u64 {
        self.base.commit_id + 1
    }
}

impl<B: StorageBackend> NodeReader for BufferedReader<'_, B> {
    fn read_node(&self, offset: Offset) -> Result<Node> {
        match self.dirty.get(&offset) {
            Some(node) => Ok(node.clone()),
            None => self.store.read_committed_node(offset, self.base.node_size),
        }
    }

    fn read_bytes(&self, offset: Offset, len: usize) -> Result<Vec<u8>> {
        buffered_bytes(self.store, self.records, offset, len)
    }

    fn bounds(&self) -> Range<Offset> {
        self.base.data_start()..self.store.allocator.next_free()
    }

    fn node_size(&self) -> u32 {
        self.base.node_size
    }
}

/// Consistent read view through one committed header.
pub struct Snapshot<'s, B: StorageBackend> {
    store: &'s EventStore<B>,
    header: Arc<Header>,
}

impl<'s, B: StorageBackend> Snapshot<'s, B> {
    pub(crate) fn new(store: &'s EventStore<B>, header: Arc<Header>) -> Self {
        Self { store, header }
    }

    /// The captured header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The tree for `kind` as of this snapshot.
    pub fn tree(&self, kind: EventKind) -> EventTree<&Self> {
        EventTree::new(kind, self.header.root(kind), self)
    }

    /// Scans `(client_hash, from..=to)` in the tree for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTree`] if nothing of this kind was ever stored.
    pub fn scan(&self, kind: EventKind, client_hash: u32, from: u32, to: u32) -> Result<EventScan<&Self, EventRecord>> {
        let lower = IndexKey::new(client_hash, from).to_u64();
        let upper = IndexKey::new(client_hash, to).to_u64();
        if self.header.root(kind) == 0 {
            return Err(Error::EmptyTree { kind });
        }
        Ok(EventScan::new(self.tree(kind), lower, upper))
    }

    /// Looks up one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTree`], [`Error::NotFound`] or
    /// [`Error::CorruptTree`].
    pub fn point_lookup(&self, kind: EventKind, client_hash: u32, sequence: u32) -> Result<EventRecord> {
        self.tree(kind).point_lookup(client_hash, sequence)
    }

    /// Highest sequence indexed for a client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if the tree is damaged.
    pub fn last_sequence(&self, kind: EventKind, client_hash: u32) -> Result<Option<u32>> {
        self.tree(kind).last_sequence(client_hash)
    }

    /// Events of one client for the given kinds, each kind in sequence order.
    ///
    /// Kinds with an empty tree contribute nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if a tree is damaged.
    pub fn query_client(&self, client_hash: u32, kinds: &[EventKind]) -> Result<Vec<ClientEvent>> {
        let mut events = Vec::new();
        for &kind in kinds {
            let scan = match self.scan(kind, client_hash, 0, u32::MAX) {
                Ok(scan) => scan,
                Err(Error::EmptyTree { .. }) => continue,
                Err(e) => return Err(e),
            };
            for record in scan {
                events.push(ClientEvent { kind, record: record? });
            }
        }
        Ok(events)
    }

    /// Events of one client across all kinds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if a tree is damaged.
    pub fn client_events(&self, client_hash: u32) -> Result<Vec<ClientEvent>> {
        self.query_client(client_hash, &EventKind::ALL)
    }

    /// Events of one client with `start <= timestamp <= end`, ordered by
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if a tree is damaged.
    pub fn query_time_range(&self, client_hash: u32, start: u64, end: u64) -> Result<Vec<ClientEvent>> {
        let mut events: Vec<_> = self
            .client_events(client_hash)?
            .into_iter()
            .filter(|event| (start..=end).contains(&event.record.timestamp))
            .collect();
        events.sort_by_key(|event| event.record.timestamp);
        Ok(events)
    }

    /// Depth of each tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if a tree's leftmost path is damaged.
    pub fn tree_depths(&self) -> Result<[(EventKind, u32); EventKind::COUNT]> {
        let mut depths = [(EventKind::Keystroke, 0); EventKind::COUNT];
        for kind in EventKind::ALL {
            depths[kind.index()] = (kind, self.tree(kind).depth()?);
        }
        Ok(depths)
    }
}

impl<B: StorageBackend> NodeReader for Snapshot<'_, B> {
    fn read_node(&self, offset: Offset) -> Result<Node> {
        self.store.read_committed_node(offset, self.header.node_size)
    }

    fn read_bytes(&self, offset: Offset, len: usize) -> Result<Vec<u8>> {
        self.store.backend.read_vec(offset, len)
    }

    fn bounds(&self) -> Range<Offset> {
        self.header.data_start()..self.header.next_free_offset
    }

    fn node_size(&self) -> u32 {
        self.header.node_size
    }
}
