//! Copy-on-write B+ tree indexing event records.
//!
//! One tree per event kind, keyed by `(client_hash, sequence)`. Nodes refer
//! to children by file offset and carry no sibling links; scans keep a
//! descent stack instead.
//!
//! ## Copy-on-write
//!
//! A node reachable from a published root is never modified. Inserting copies
//! every node on the path from the root to the target leaf into freshly
//! allocated space, so the previously published root keeps describing a
//! complete tree. Nodes already written by the current, still unpublished
//! transaction are updated where they are.
//!
//! ## Structure
//!
//! - `cursor.rs`: lazy range scans
//! - `split.rs`: node splitting

/// Lazy range scans.
pub mod cursor;
/// Node splitting.
pub mod split;

use std::{fmt, marker::PhantomData, ops::Range};

pub use cursor::EventScan;
use split::{needs_split, split_branch, split_leaf};

use crate::{
    error::{Error, Offset, Result},
    page::{Entry, Node},
    record::{EventKind, EventRecord, IndexKey, IndexedRecord},
};

/// Deepest tree a traversal accepts before declaring a cycle.
pub const MAX_DEPTH: usize = 32;

/// Read access to nodes and records.
pub trait NodeReader {
    /// Reads and decodes the node at `offset`.
    fn read_node(&self, offset: Offset) -> Result<Node>;

    /// Reads `len` raw bytes at `offset`.
    fn read_bytes(&self, offset: Offset, len: usize) -> Result<Vec<u8>>;

    /// Region that may contain nodes and records: `[data_start, next_free)`.
    fn bounds(&self) -> Range<Offset>;

    /// Size of every node.
    fn node_size(&self) -> u32;
}

impl<T: NodeReader + ?Sized> NodeReader for &T {
    fn read_node(&self, offset: Offset) -> Result<Node> {
        (**self).read_node(offset)
    }

    fn read_bytes(&self, offset: Offset, len: usize) -> Result<Vec<u8>> {
        (**self).read_bytes(offset, len)
    }

    fn bounds(&self) -> Range<Offset> {
        (**self).bounds()
    }

    fn node_size(&self) -> u32 {
        (**self).node_size()
    }
}

/// Write access for inserts within one transaction.
pub trait NodeWriter: NodeReader {
    /// Reserves space for a node.
    fn allocate_node(&mut self) -> Result<Offset>;

    /// Stores `node` at `node.offset`.
    fn write_node(&mut self, node: Node) -> Result<()>;

    /// True if `offset` was allocated by the current transaction and is
    /// therefore unreachable from any published root.
    fn is_fresh(&self, offset: Offset) -> bool;

    /// Commit id stamped into written nodes.
    fn commit_id(&self) -> u64;
}

/// Irregularity in a client's sequence numbers.
///
/// Reported, never corrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// The predecessor key is not `sequence - 1`.
    Gap {
        /// Sequence that should have come next.
        expected: u32,
        /// Sequence actually inserted.
        found: u32,
    },
    /// The key is already present.
    Duplicate {
        /// The repeated sequence.
        sequence: u32,
    },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::Gap { expected, found } => write!(f, "gap: expected {expected}, found {found}"),
            Anomaly::Duplicate { sequence } => write!(f, "duplicate sequence {sequence}"),
        }
    }
}

/// Outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Root after the insert; publish it to make the insert visible.
    pub root: Offset,
    /// Sequence irregularity observed at the insert position.
    pub anomaly: Option<Anomaly>,
}

type Promoted = Option<(u64, Offset)>;

/// Event tree over a node provider.
pub struct EventTree<P, R = EventRecord> {
    kind: EventKind,
    root: Offset,
    provider: P,
    splits: u64,
    _record: PhantomData<fn() -> R>,
}

impl<P: NodeReader, R: IndexedRecord> EventTree<P, R> {
    /// Opens the tree rooted at `root` (0 = empty).
    pub fn new(kind: EventKind, root: Offset, provider: P) -> Self {
        Self { kind, root, provider, splits: 0, _record: PhantomData }
    }

    /// Which event stream this tree indexes.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Current root offset.
    pub fn root(&self) -> Offset {
        self.root
    }

    /// True if nothing was ever inserted.
    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    /// Splits performed by this handle.
    pub fn split_count(&self) -> u64 {
        self.splits
    }

    /// Consumes the tree, returning its provider.
    pub fn into_provider(self) -> P {
        self.provider
    }

    /// Loads a node after checking that its offset lies in the data region.
    pub(crate) fn load(&self, offset: Offset) -> Result<Node> {
        let bounds = self.provider.bounds();
        let end = offset.checked_add(u64::from(self.provider.node_size()));
        if offset < bounds.start || end.is_none_or(|end| end > bounds.end) {
            return Err(Error::CorruptTree {
                offset,
                reason: format!("node outside data region [{}, {})", bounds.start, bounds.end),
            });
        }
        self.provider.read_node(offset)
    }

    /// Reads the record referenced by a leaf entry and checks its key.
    pub(crate) fn read_record(&self, entry: Entry) -> Result<R> {
        let bounds = self.provider.bounds();
        let end = entry.offset.checked_add(R::SIZE as u64);
        if entry.offset < bounds.start || end.is_none_or(|end| end > bounds.end) {
            return Err(Error::CorruptTree {
                offset: entry.offset,
                reason: format!("record outside data region [{}, {})", bounds.start, bounds.end),
            });
        }
        let record = R::decode(&self.provider.read_bytes(entry.offset, R::SIZE)?)?;
        if record.index_key().to_u64() != entry.key {
            return Err(Error::CorruptTree {
                offset: entry.offset,
                reason: format!("record key does not match index key {:#018x}", entry.key),
            });
        }
        Ok(record)
    }

    /// Looks up the record stored under `(client_hash, sequence)`.
    ///
    /// With duplicates present the first one inserted is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTree`] for an empty tree, [`Error::NotFound`]
    /// for a missing key and [`Error::CorruptTree`] if the path is damaged.
    pub fn point_lookup(&self, client_hash: u32, sequence: u32) -> Result<R> {
        let key = IndexKey::new(client_hash, sequence).to_u64();
        let mut scan = self.scan_keys(key, key)?;
        match scan.next_entry()? {
            Some(entry) => self.read_record(entry),
            None => Err(Error::NotFound),
        }
    }

    /// Highest sequence indexed for `client_hash`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if the path is damaged.
    pub fn last_sequence(&self, client_hash: u32) -> Result<Option<u32>> {
        if self.root == 0 {
            return Ok(None);
        }
        let target = IndexKey::new(client_hash, u32::MAX).to_u64();
        Ok(self
            .floor(self.root, target, 0)?
            .map(IndexKey::from_u64)
            .filter(|key| key.client_hash == client_hash)
            .map(|key| key.sequence))
    }

    /// Greatest key `<= target` in the subtree at `offset`.
    fn floor(&self, offset: Offset, target: u64, depth: usize) -> Result<Option<u64>> {
        if depth >= MAX_DEPTH {
            return Err(Error::CorruptTree { offset, reason: "tree too deep".to_string() });
        }
        let node = self.load(offset)?;
        let upper = node.entries.partition_point(|e| e.key <= target);
        if node.is_leaf() {
            return Ok(upper.checked_sub(1).map(|i| node.entries[i].key));
        }
        for index in (0..=upper).rev() {
            if let Some(key) = self.floor(node.child(index), target, depth + 1)? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Classifies the insert of `key` against its predecessor.
    fn check_sequence(&self, key: IndexKey) -> Result<Option<Anomaly>> {
        let previous = if self.root == 0 {
            None
        } else {
            self.floor(self.root, key.to_u64(), 0)?
                .map(IndexKey::from_u64)
                .filter(|prev| prev.client_hash == key.client_hash)
        };

        Ok(match previous {
            Some(prev) if prev == key => Some(Anomaly::Duplicate { sequence: key.sequence }),
            Some(prev) if prev.sequence.wrapping_add(1) != key.sequence => {
                Some(Anomaly::Gap { expected: prev.sequence.wrapping_add(1), found: key.sequence })
            },
            Some(_) => None,
            None if key.sequence != 0 => Some(Anomaly::Gap { expected: 0, found: key.sequence }),
            None => None,
        })
    }

    /// Scans `(client_hash, from..=to)` in key order.
    ///
    /// The scan is lazy and reads through the root captured now; later
    /// inserts through other handles are not observed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTree`] if the tree has no root.
    pub fn scan(&self, client_hash: u32, from: u32, to: u32) -> Result<EventScan<&P, R>> {
        let lower = IndexKey::new(client_hash, from).to_u64();
        let upper = IndexKey::new(client_hash, to).to_u64();
        self.scan_keys(lower, upper)
    }

    /// Scans every entry of the tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTree`] if the tree has no root.
    pub fn scan_all(&self) -> Result<EventScan<&P, R>> {
        self.scan_keys(0, u64::MAX)
    }

    fn scan_keys(&self, lower: u64, upper: u64) -> Result<EventScan<&P, R>> {
        if self.root == 0 {
            return Err(Error::EmptyTree { kind: self.kind });
        }
        let tree = EventTree::new(self.kind, self.root, &self.provider);
        Ok(EventScan::new(tree, lower, upper))
    }

    /// Depth of the tree: 0 when empty, 1 when the root is a leaf.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if the leftmost path is damaged.
    pub fn depth(&self) -> Result<u32> {
        if self.root == 0 {
            return Ok(0);
        }
        let mut depth = 1;
        let mut node = self.load(self.root)?;
        while !node.is_leaf() {
            if depth as usize >= MAX_DEPTH {
                return Err(Error::CorruptTree { offset: node.offset, reason: "tree too deep".to_string() });
            }
            node = self.load(node.first_child)?;
            depth += 1;
        }
        Ok(depth)
    }
}

impl<P: NodeWriter, R: IndexedRecord> EventTree<P, R> {
    /// Indexes the record at `record_offset` under `key`.
    ///
    /// Equal keys are kept, ordered after the existing ones, and reported as
    /// [`Anomaly::Duplicate`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if the insert path is damaged and
    /// [`Error::AllocationFailure`] if no space is left for new nodes.
    pub fn insert(&mut self, key: IndexKey, record_offset: Offset) -> Result<InsertOutcome> {
        let anomaly = self.check_sequence(key)?;
        let raw = key.to_u64();

        if self.root == 0 {
            let offset = self.provider.allocate_node()?;
            let mut leaf = Node::leaf(offset, self.provider.commit_id());
            leaf.entries.push(Entry { key: raw, offset: record_offset });
            self.provider.write_node(leaf)?;
            self.root = offset;
            return Ok(InsertOutcome { root: offset, anomaly });
        }

        let (root, promoted) = self.insert_into(self.root, raw, record_offset, 0)?;
        self.root = root;

        if let Some((separator, right)) = promoted {
            let offset = self.provider.allocate_node()?;
            let mut new_root = Node::branch(offset, self.provider.commit_id(), root);
            new_root.entries.push(Entry { key: separator, offset: right });
            self.provider.write_node(new_root)?;
            self.root = offset;
        }

        Ok(InsertOutcome { root: self.root, anomaly })
    }

    /// Inserts below `offset`, returning where the (possibly copied) node now
    /// lives and the separator and right sibling if it split.
    fn insert_into(
        &mut self,
        offset: Offset,
        key: u64,
        value: Offset,
        depth: usize,
    ) -> Result<(Offset, Promoted)> {
        if depth >= MAX_DEPTH {
            return Err(Error::CorruptTree { offset, reason: "tree too deep".to_string() });
        }
        let mut node = self.load(offset)?;
        let index = node.entries.partition_point(|e| e.key <= key);

        if node.is_leaf() {
            node.entries.insert(index, Entry { key, offset: value });
        } else {
            let child = node.child(index);
            let (new_child, promoted) = self.insert_into(child, key, value, depth + 1)?;
            if new_child == child && promoted.is_none() {
                return Ok((offset, None));
            }
            node.set_child(index, new_child);
            if let Some((separator, right)) = promoted {
                node.entries.insert(index, Entry { key: separator, offset: right });
            }
        }

        if !needs_split(&node, self.provider.node_size()) {
            return Ok((self.place(node)?, None));
        }

        self.splits += 1;
        let commit_id = self.provider.commit_id();
        let split =
            if node.is_leaf() { split_leaf(node, commit_id) } else { split_branch(node, commit_id) };
        tracing::trace!(kind = %self.kind, separator = split.separator, "node split");

        let left = self.place(split.left)?;
        let mut right = split.right;
        right.offset = self.provider.allocate_node()?;
        let right_offset = right.offset;
        self.provider.write_node(right)?;
        Ok((left, Some((split.separator, right_offset))))
    }

    /// Writes `node` in place when fresh, otherwise to a new offset.
    fn place(&mut self, mut node: Node) -> Result<Offset> {
        if !self.provider.is_fresh(node.offset) {
            node.offset = self.provider.allocate_node()?;
        }
        node.commit_id = self.provider.commit_id();
        let offset = node.offset;
        self.provider.write_node(node)?;
        Ok(offset)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::record::RECORD_SIZE;

    /// In-memory provider: nodes and records in maps, monotonic offsets.
    pub(crate) struct TestProvider {
        pub nodes: HashMap<Offset, Vec<u8>>,
        pub records: HashMap<Offset, Vec<u8>>,
        pub next_free: Offset,
        pub committed: Offset,
        pub node_size: u32,
        pub commit_id: u64,
    }

    pub(crate) const DATA_START: Offset = 4096;

    impl TestProvider {
        pub(crate) fn new(node_size: u32) -> Self {
            Self {
                nodes: HashMap::new(),
                records: HashMap::new(),
                next_free: DATA_START,
                committed: DATA_START,
                node_size,
                commit_id: 1,
            }
        }

        pub(crate) fn add_record(&mut self, record: &EventRecord) -> Offset {
            let offset = self.next_free;
            self.next_free += RECORD_SIZE as u64;
            self.records.insert(offset, record.encode());
            offset
        }

        /// Marks everything written so far as published.
        pub(crate) fn publish(&mut self) {
            self.committed = self.next_free;
            self.commit_id += 1;
        }
    }

    impl NodeReader for TestProvider {
        fn read_node(&self, offset: Offset) -> Result<Node> {
            let buf = self.nodes.get(&offset).ok_or(Error::CorruptTree {
                offset,
                reason: "no node".to_string(),
            })?;
            Node::decode(offset, buf)
        }

        fn read_bytes(&self, offset: Offset, len: usize) -> Result<Vec<u8>> {
            let buf = self.records.get(&offset).cloned().unwrap_or_default();
            if buf.len() != len {
                return Err(Error::Decode { what: "test record", reason: "missing".to_string() });
            }
            Ok(buf)
        }

        fn bounds(&self) -> Range<Offset> {
            DATA_START..self.next_free
        }

        fn node_size(&self) -> u32 {
            self.node_size
        }
    }

    impl NodeWriter for TestProvider {
        fn allocate_node(&mut self) -> Result<Offset> {
            let offset = self.next_free;
            self.next_free += u64::from(self.node_size);
            Ok(offset)
        }

        fn write_node(&mut self, node: Node) -> Result<()> {
            self.nodes.insert(node.offset, node.encode(self.node_size));
            Ok(())
        }

        fn is_fresh(&self, offset: Offset) -> bool {
            offset >= self.committed
        }

        fn commit_id(&self) -> u64 {
            self.commit_id
        }
    }

    pub(crate) fn insert_event(
        tree: &mut EventTree<TestProvider>,
        hash: u32,
        sequence: u32,
        payload: &str,
    ) -> InsertOutcome {
        let (record, _) = EventRecord::new(u64::from(sequence), hash, sequence, payload.as_bytes());
        let offset = tree.provider.add_record(&record);
        tree.insert(record.index_key(), offset).unwrap()
    }

    fn small_tree() -> EventTree<TestProvider> {
        EventTree::new(EventKind::Keystroke, 0, TestProvider::new(128))
    }

    fn sequences(tree: &EventTree<TestProvider>, hash: u32, from: u32, to: u32) -> Vec<u32> {
        tree.scan(hash, from, to).unwrap().map(|r| r.unwrap().sequence).collect()
    }

    #[test]
    fn test_empty_tree_errors() {
        let tree = small_tree();
        assert!(tree.is_empty());
        assert!(matches!(tree.scan(1, 0, 10), Err(Error::EmptyTree { kind: EventKind::Keystroke })));
        assert!(matches!(tree.point_lookup(1, 0), Err(Error::EmptyTree { .. })));
        assert_eq!(tree.last_sequence(1).unwrap(), None);
        assert_eq!(tree.depth().unwrap(), 0);
    }

    #[test]
    fn test_scenario_two_clients() {
        let mut tree = small_tree();
        for (seq, payload) in ["A", "B", "C"].iter().enumerate() {
            let outcome = insert_event(&mut tree, 0x1111, seq as u32, payload);
            assert_eq!(outcome.anomaly, None);
        }

        let records: Vec<_> = tree.scan(0x1111, 0, 2).unwrap().map(|r| r.unwrap()).collect();
        let payloads: Vec<_> = records.iter().map(|r| r.payload_lossy()).collect();
        assert_eq!(payloads, vec!["A", "B", "C"]);
        assert_eq!(tree.scan(0x2222, 0, 2).unwrap().count(), 0);
    }

    #[test]
    fn test_many_inserts_split_and_stay_ordered() {
        let mut tree = small_tree();
        for seq in 0..500 {
            insert_event(&mut tree, 7, seq, "x");
        }

        assert!(tree.split_count() > 0);
        assert!(tree.depth().unwrap() >= 3);
        assert_eq!(sequences(&tree, 7, 0, 499), (0..500).collect::<Vec<_>>());
        assert_eq!(sequences(&tree, 7, 100, 109), (100..110).collect::<Vec<_>>());
        assert_eq!(tree.last_sequence(7).unwrap(), Some(499));
    }

    #[test]
    fn test_interleaved_clients_are_grouped() {
        let mut tree = small_tree();
        for seq in 0..50 {
            for hash in [3u32, 1, 2] {
                insert_event(&mut tree, hash, seq, "k");
            }
        }

        for hash in [1u32, 2, 3] {
            assert_eq!(sequences(&tree, hash, 0, u32::MAX), (0..50).collect::<Vec<_>>());
            assert_eq!(tree.last_sequence(hash).unwrap(), Some(49));
        }
        assert_eq!(tree.last_sequence(4).unwrap(), None);
    }

    #[test]
    fn test_point_lookup() {
        let mut tree = small_tree();
        for seq in 0..40 {
            insert_event(&mut tree, 9, seq, &format!("p{seq}"));
        }

        assert_eq!(tree.point_lookup(9, 17).unwrap().payload_lossy(), "p17");
        assert!(matches!(tree.point_lookup(9, 40), Err(Error::NotFound)));
        assert!(matches!(tree.point_lookup(8, 0), Err(Error::NotFound)));
    }

    #[test]
    fn test_gap_and_duplicate_reported() {
        let mut tree = small_tree();
        insert_event(&mut tree, 5, 0, "a");
        insert_event(&mut tree, 5, 1, "b");

        let gap = insert_event(&mut tree, 5, 4, "c");
        assert_eq!(gap.anomaly, Some(Anomaly::Gap { expected: 2, found: 4 }));

        let dup = insert_event(&mut tree, 5, 4, "d");
        assert_eq!(dup.anomaly, Some(Anomaly::Duplicate { sequence: 4 }));

        let first = insert_event(&mut tree, 6, 3, "e");
        assert_eq!(first.anomaly, Some(Anomaly::Gap { expected: 0, found: 3 }));

        // Both duplicates are kept, in insertion order.
        let payloads: Vec<_> = tree.scan(5, 4, 4).unwrap().map(|r| r.unwrap().payload_lossy()).collect();
        assert_eq!(payloads, vec!["c", "d"]);
    }

    #[test]
    fn test_duplicates_across_splits() {
        let mut tree = small_tree();
        for _ in 0..30 {
            insert_event(&mut tree, 1, 0, "same");
        }
        insert_event(&mut tree, 1, 1, "next");

        assert_eq!(tree.scan(1, 0, 0).unwrap().count(), 30);
        assert_eq!(sequences(&tree, 1, 1, 1), vec![1]);
    }

    #[test]
    fn test_published_tree_is_not_modified() {
        let mut tree = small_tree();
        for seq in 0..20 {
            insert_event(&mut tree, 1, seq, "old");
        }
        tree.provider.publish();
        let old_root = tree.root();
        let snapshot: HashMap<_, _> = tree.provider.nodes.clone();

        for seq in 20..60 {
            insert_event(&mut tree, 1, seq, "new");
        }

        assert_ne!(tree.root(), old_root);
        for (offset, bytes) in &snapshot {
            assert_eq!(tree.provider.nodes.get(offset), Some(bytes), "node {offset} was rewritten");
        }

        let old = EventTree::<_, EventRecord>::new(EventKind::Keystroke, old_root, &tree.provider);
        assert_eq!(old.scan(1, 0, u32::MAX).unwrap().count(), 20);
        assert_eq!(tree.scan(1, 0, u32::MAX).unwrap().count(), 60);
    }

    #[test]
    fn test_fresh_nodes_updated_in_place() {
        let mut tree = small_tree();
        insert_event(&mut tree, 1, 0, "a");
        let root = tree.root();
        insert_event(&mut tree, 1, 1, "b");
        assert_eq!(tree.root(), root);
    }

    #[test]
    fn test_child_outside_bounds_is_corrupt() {
        let mut tree = small_tree();
        for seq in 0..20 {
            insert_event(&mut tree, 1, seq, "x");
        }
        let mut root = tree.provider.read_node(tree.root()).unwrap();
        assert!(!root.is_leaf());
        root.first_child = 1 << 40;
        tree.provider.write_node(root).unwrap();

        let err = tree.scan(1, 0, 0).unwrap().next().unwrap().unwrap_err();
        assert!(matches!(err, Error::CorruptTree { offset, .. } if offset == 1 << 40));
    }

    #[test]
    fn test_record_key_mismatch_is_corrupt() {
        let mut tree = small_tree();
        insert_event(&mut tree, 1, 0, "x");
        let (other, _) = EventRecord::new(0, 2, 0, b"y");
        let offset = *tree.provider.records.keys().next().unwrap();
        tree.provider.records.insert(offset, other.encode());

        let err = tree.point_lookup(1, 0).unwrap_err();
        assert!(err.to_string().contains("does not match"), "got: {err}");
    }

    #[test]
    fn test_anomaly_display() {
        assert_eq!(Anomaly::Gap { expected: 3, found: 5 }.to_string(), "gap: expected 3, found 5");
        assert_eq!(Anomaly::Duplicate { sequence: 2 }.to_string(), "duplicate sequence 2");
    }

    mod proptest_tree {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn prop_scan_returns_sorted_keys(
                keys in proptest::collection::vec((0u32..4, 0u32..200), 1..300)
            ) {
                let mut tree = small_tree();
                for &(hash, seq) in &keys {
                    insert_event(&mut tree, hash, seq, "p");
                }

                let scanned: Vec<_> = tree
                    .scan_all()
                    .unwrap()
                    .map(|r| r.unwrap().index_key())
                    .collect();

                let mut expected: Vec<_> = keys.iter().map(|&(h, s)| IndexKey::new(h, s)).collect();
                expected.sort();
                prop_assert_eq!(scanned, expected);
            }

            #[test]
            fn prop_last_sequence_is_max(
                keys in proptest::collection::vec((0u32..3, 0u32..1000), 1..200)
            ) {
                let mut tree = small_tree();
                for &(hash, seq) in &keys {
                    insert_event(&mut tree, hash, seq, "p");
                }
                for hash in 0..3u32 {
                    let max = keys.iter().filter(|k| k.0 == hash).map(|k| k.1).max();
                    prop_assert_eq!(tree.last_sequence(hash).unwrap(), max);
                }
            }
        }
    }
}
