//! Integrity scrubber for detecting silent data corruption.
//!
//! Walks every event tree from the committed roots, reading nodes and records
//! raw from the backend (bypassing the node cache) so that what is checked is
//! what is actually stored. Verifies node checksums, offsets, key ranges,
//! uniform leaf depth and record keys, and reports sequence gaps and
//! duplicates. Also cross-checks the header images and the client table.

use std::{collections::HashSet, sync::Arc};

use crate::{
    EventStore,
    backend::StorageBackend,
    btree::{Anomaly, MAX_DEPTH},
    client::SlotState,
    error::{Error, Offset, Result},
    header::{HEADER_SIZE, Header, STAGED_HEADER_OFFSET},
    page::{Node, verify_checksum},
    record::{EventKind, EventRecord, IndexKey, IndexedRecord, RECORD_SIZE},
};

/// Result of an integrity scrub.
#[derive(Debug, Default)]
pub struct ScrubResult {
    /// Tree nodes read.
    pub nodes_checked: u64,
    /// Event records read.
    pub records_checked: u64,
    /// Nodes whose stored checksum does not match their contents.
    pub checksum_errors: u64,
    /// Layout, ordering, bounds and bookkeeping violations.
    pub structural_errors: u64,
    /// Detailed error descriptions.
    pub errors: Vec<ScrubError>,
    /// Sequence gaps and duplicates, as [`Error::SequenceAnomaly`] values.
    pub anomalies: Vec<Error>,
}

impl ScrubResult {
    /// True when no checksum or structural error was found. Anomalies do not
    /// count.
    pub fn is_clean(&self) -> bool {
        self.checksum_errors == 0 && self.structural_errors == 0
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: ScrubResult) {
        self.nodes_checked += other.nodes_checked;
        self.records_checked += other.records_checked;
        self.checksum_errors += other.checksum_errors;
        self.structural_errors += other.structural_errors;
        self.errors.extend(other.errors);
        self.anomalies.extend(other.anomalies);
    }

    /// Turns findings into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] for the first checksum or structural
    /// error; with `strict`, returns the first sequence anomaly as well.
    pub fn check(mut self, strict: bool) -> Result<Self> {
        if let Some(first) = self.errors.first() {
            return Err(Error::CorruptTree { offset: first.offset, reason: first.description.clone() });
        }
        if strict && !self.anomalies.is_empty() {
            return Err(self.anomalies.remove(0));
        }
        Ok(self)
    }

    fn checksum_errors_at(&mut self, offset: Offset, description: String) {
        self.checksum_errors += 1;
        self.errors.push(ScrubError { offset, kind: None, description });
    }

    fn structural(&mut self, offset: Offset, kind: Option<EventKind>, description: String) {
        self.structural_errors += 1;
        self.errors.push(ScrubError { offset, kind, description });
    }
}

/// A single integrity error detected during scrubbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubError {
    /// Offset of the offending node, record, slot or header image.
    pub offset: Offset,
    /// The tree the error was found in, if any.
    pub kind: Option<EventKind>,
    /// Human-readable description of the error.
    pub description: String,
}

/// State of one tree walk.
struct TreeWalk {
    kind: EventKind,
    visited: HashSet<Offset>,
    leaf_depth: Option<usize>,
    previous: Option<IndexKey>,
    result: ScrubResult,
}

/// Integrity scrubber over one committed state of a store.
pub struct IntegrityScrubber<'a, B: StorageBackend> {
    store: &'a EventStore<B>,
    header: Arc<Header>,
}

impl<'a, B: StorageBackend> IntegrityScrubber<'a, B> {
    /// Creates a scrubber for the state committed now.
    pub fn new(store: &'a EventStore<B>) -> Self {
        Self { header: store.header(), store }
    }

    /// Runs every check.
    pub fn run(&self) -> ScrubResult {
        let mut result = self.verify_header();
        for kind in EventKind::ALL {
            result.merge(self.verify_tree(kind));
        }
        result.merge(self.verify_clients());
        tracing::debug!(
            nodes = result.nodes_checked,
            records = result.records_checked,
            errors = result.errors.len(),
            anomalies = result.anomalies.len(),
            "integrity scrub finished"
        );
        result
    }

    /// Checks the committed header and both stored images.
    pub fn verify_header(&self) -> ScrubResult {
        let mut result = ScrubResult::default();
        if let Err(e) = self.header.validate() {
            result.structural(0, None, e.to_string());
        }

        for (offset, name) in [(0, "primary"), (STAGED_HEADER_OFFSET, "staged")] {
            let image = self.store.backend().read_vec(offset, HEADER_SIZE).and_then(|buf| Header::from_bytes(&buf));
            match image {
                Ok(image) if image.commit_id > self.header.commit_id => result.structural(
                    offset,
                    None,
                    format!("{name} header image is ahead of the committed state ({})", image.commit_id),
                ),
                Ok(_) => {},
                Err(e) => result.checksum_errors_at(offset, format!("{name} header image unreadable: {e}")),
            }
        }
        result
    }

    /// Walks the tree for `kind`.
    pub fn verify_tree(&self, kind: EventKind) -> ScrubResult {
        let mut walk = TreeWalk {
            kind,
            visited: HashSet::new(),
            leaf_depth: None,
            previous: None,
            result: ScrubResult::default(),
        };
        let root = self.header.root(kind);
        if root != 0 {
            self.verify_subtree(&mut walk, root, None, None, 0);
        }
        walk.result
    }

    fn verify_subtree(
        &self,
        walk: &mut TreeWalk,
        offset: Offset,
        lower: Option<u64>,
        upper: Option<u64>,
        depth: usize,
    ) {
        let kind = Some(walk.kind);
        if depth >= MAX_DEPTH {
            walk.result.structural(offset, kind, format!("tree deeper than {MAX_DEPTH} levels"));
            return;
        }
        let node_size = self.header.node_size;
        if !self.in_data_region(offset, u64::from(node_size)) {
            walk.result.structural(offset, kind, format!("node at {offset} outside the data region"));
            return;
        }
        if !walk.visited.insert(offset) {
            walk.result.structural(offset, kind, format!("node at {offset} reachable more than once"));
            return;
        }

        let buf = match self.store.backend().read_vec(offset, node_size as usize) {
            Ok(buf) => buf,
            Err(e) => {
                walk.result.structural(offset, kind, format!("cannot read node at {offset}: {e}"));
                return;
            },
        };
        walk.result.nodes_checked += 1;

        if !verify_checksum(&buf) {
            walk.result.checksum_errors += 1;
            walk.result.errors.push(ScrubError {
                offset,
                kind,
                description: format!("Checksum mismatch on node at {offset}"),
            });
            return;
        }
        let node = match Node::decode(offset, &buf) {
            Ok(node) => node,
            Err(e) => {
                walk.result.structural(offset, kind, e.to_string());
                return;
            },
        };

        if node.commit_id > self.header.commit_id {
            walk.result.structural(
                offset,
                kind,
                format!("node commit id {} is newer than the header's {}", node.commit_id, self.header.commit_id),
            );
        }
        let out_of_range = node
            .entries
            .iter()
            .any(|e| lower.is_some_and(|l| e.key < l) || upper.is_some_and(|u| e.key > u));
        if out_of_range {
            walk.result.structural(offset, kind, format!("node at {offset} holds keys outside its parent's range"));
        }

        if node.is_leaf() {
            match walk.leaf_depth {
                Some(expected) if expected != depth => walk.result.structural(
                    offset,
                    kind,
                    format!("leaf at depth {depth}, expected {expected}"),
                ),
                Some(_) => {},
                None => walk.leaf_depth = Some(depth),
            }
            for entry in &node.entries {
                self.verify_record(walk, entry.key, entry.offset);
            }
            return;
        }

        for index in 0..node.child_count() {
            let lo = if index == 0 { lower } else { Some(node.entries[index - 1].key) };
            let hi = node.entries.get(index).map(|e| e.key).or(upper);
            self.verify_subtree(walk, node.child(index), lo, hi, depth + 1);
        }
    }

    fn verify_record(&self, walk: &mut TreeWalk, key: u64, offset: Offset) {
        let kind = Some(walk.kind);
        if !self.in_data_region(offset, RECORD_SIZE as u64) {
            walk.result.structural(offset, kind, format!("record at {offset} outside the data region"));
            return;
        }
        let record = self.store.backend().read_vec(offset, RECORD_SIZE).and_then(|buf| EventRecord::decode(&buf));
        walk.result.records_checked += 1;
        match record {
            Ok(record) if record.index_key().to_u64() == key => {},
            Ok(_) => walk.result.structural(offset, kind, format!("record at {offset} does not match its index key")),
            Err(e) => walk.result.structural(offset, kind, format!("cannot read record at {offset}: {e}")),
        }

        let current = IndexKey::from_u64(key);
        let anomaly = match walk.previous {
            Some(prev) if prev.client_hash == current.client_hash => {
                if prev == current {
                    Some(Anomaly::Duplicate { sequence: current.sequence })
                } else if prev.sequence.wrapping_add(1) != current.sequence {
                    Some(Anomaly::Gap { expected: prev.sequence.wrapping_add(1), found: current.sequence })
                } else {
                    None
                }
            },
            _ if current.sequence != 0 => Some(Anomaly::Gap { expected: 0, found: current.sequence }),
            _ => None,
        };
        if let Some(anomaly) = anomaly {
            walk.result.anomalies.push(Error::SequenceAnomaly {
                kind: walk.kind,
                client_hash: current.client_hash,
                anomaly,
            });
        }
        walk.previous = Some(current);
    }

    /// Checks the client table against the header and the trees.
    ///
    /// A sequence counter at or below the last indexed sequence would make
    /// the next event a duplicate.
    pub fn verify_clients(&self) -> ScrubResult {
        let mut result = ScrubResult::default();
        let snapshot = self.store.snapshot();
        let clients = self.store.clients();
        if clients.len() as u32 != self.header.num_clients {
            result.structural(
                self.header.client_table_offset,
                None,
                format!("{} active slots, header records {}", clients.len(), self.header.num_clients),
            );
        }

        let table = self.store.clients.read();
        for slot in table.slots().iter().filter(|slot| slot.state != SlotState::Empty) {
            let at = self.header.client_table_offset + u64::from(slot.index) * crate::client::CLIENT_SLOT_SIZE as u64;
            for kind in EventKind::ALL {
                match snapshot.last_sequence(kind, slot.hash) {
                    Ok(Some(last)) if slot.next_sequence[kind.index()] <= last => result.structural(
                        at,
                        Some(kind),
                        format!(
                            "client {} next {kind} sequence {} not past indexed {last}",
                            slot.identifier,
                            slot.next_sequence[kind.index()]
                        ),
                    ),
                    Ok(_) => {},
                    Err(e) => result.structural(at, Some(kind), format!("cannot look up client {}: {e}", slot.identifier)),
                }
            }
        }
        result
    }

    fn in_data_region(&self, offset: Offset, len: u64) -> bool {
        offset >= self.header.data_start()
            && offset.checked_add(len).is_some_and(|end| end <= self.header.next_free_offset)
    }
}

impl<B: StorageBackend> EventStore<B> {
    /// Scrubs the committed state. See [`IntegrityScrubber`].
    pub fn verify(&self) -> ScrubResult {
        IntegrityScrubber::new(self).run()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{StoreConfig, backend::InMemoryBackend};

    fn store_with_events(count: u32) -> EventStore<InMemoryBackend> {
        let config = StoreConfig::builder().node_size(256).max_clients(4).sync_on_commit(false).build().unwrap();
        let store = EventStore::open_in_memory_with_config(config).unwrap();
        store.register_client("001").unwrap();
        store.register_client("002").unwrap();
        let mut txn = store.begin_write().unwrap();
        for i in 0..count {
            let id = if i % 3 == 0 { "002" } else { "001" };
            txn.record_event(EventKind::ALL[i as usize % 3], id, b"scrub").unwrap();
        }
        txn.commit().unwrap();
        store
    }

    fn flip_byte(store: &EventStore<InMemoryBackend>, offset: Offset) {
        let mut byte = [0u8; 1];
        store.backend().read_at(offset, &mut byte).unwrap();
        byte[0] ^= 0xFF;
        store.backend().write_at(offset, &byte).unwrap();
    }

    #[test]
    fn test_scrub_empty_store() {
        let store = EventStore::open_in_memory().unwrap();
        let result = store.verify();
        assert_eq!(result.nodes_checked, 0);
        assert_eq!(result.records_checked, 0);
        assert!(result.is_clean(), "errors: {:?}", result.errors);
        assert!(result.anomalies.is_empty());
    }

    #[test]
    fn test_scrub_valid_store() {
        let store = store_with_events(200);
        let result = store.verify();
        assert!(result.nodes_checked > 3);
        assert_eq!(result.records_checked, 200);
        assert!(result.is_clean(), "errors: {:?}", result.errors);
        assert!(result.anomalies.is_empty(), "anomalies: {:?}", result.anomalies);
        result.check(true).unwrap();
    }

    #[test]
    fn test_scrub_detects_corrupted_checksum() {
        let store = store_with_events(10);
        let root = store.header().root(EventKind::Keystroke);
        flip_byte(&store, root + 20);

        let result = IntegrityScrubber::new(&store).verify_tree(EventKind::Keystroke);
        assert_eq!(result.checksum_errors, 1);
        assert!(result.errors[0].description.contains("Checksum mismatch"));
        assert_eq!(result.errors[0].kind, Some(EventKind::Keystroke));
        assert!(matches!(result.check(false), Err(Error::CorruptTree { .. })));
    }

    #[test]
    fn test_scrub_detects_corrupted_record() {
        let store = store_with_events(3);
        let snapshot = store.snapshot();
        let hash = store.client_stats("002").unwrap().hash;
        let tree = snapshot.tree(EventKind::Keystroke);
        let mut scan = tree.scan(hash, 0, 0).unwrap();
        let entry = scan.next_entry().unwrap().unwrap();
        flip_byte(&store, entry.offset + 8);

        let result = store.verify();
        assert_eq!(result.structural_errors, 1, "errors: {:?}", result.errors);
        assert!(result.errors[0].description.contains("does not match"));
    }

    #[test]
    fn test_scrub_reports_gap_as_anomaly() {
        let store = store_with_events(0);
        store.record_event(EventKind::Window, "001", b"w").unwrap();
        let txn = store.begin_write().unwrap();
        {
            let mut clients = store.clients.write();
            let index = clients.active("001").unwrap().index;
            clients.reset_sequence(index, EventKind::Window, 5).unwrap();
        }
        txn.commit().unwrap();
        store.record_event(EventKind::Window, "001", b"w").unwrap();

        let result = store.verify();
        assert!(result.is_clean(), "errors: {:?}", result.errors);
        assert_eq!(result.anomalies.len(), 1);
        assert!(matches!(
            result.anomalies[0],
            Error::SequenceAnomaly { kind: EventKind::Window, anomaly: Anomaly::Gap { expected: 1, found: 5 }, .. }
        ));
        assert!(matches!(result.check(true), Err(Error::SequenceAnomaly { .. })));
    }

    #[test]
    fn test_scrub_flags_counter_behind_index() {
        let store = store_with_events(6);
        let txn = store.begin_write().unwrap();
        {
            let mut clients = store.clients.write();
            let index = clients.active("001").unwrap().index;
            clients.reset_sequence(index, EventKind::Clipboard, 0).unwrap();
        }
        txn.commit().unwrap();
        let result = IntegrityScrubber::new(&store).verify_clients();
        assert_eq!(result.structural_errors, 1, "errors: {:?}", result.errors);
        assert_eq!(result.errors[0].kind, Some(EventKind::Clipboard));
    }

    #[test]
    fn test_scrub_reports_torn_staged_image() {
        let store = store_with_events(1);
        flip_byte(&store, STAGED_HEADER_OFFSET + 30);
        let result = IntegrityScrubber::new(&store).verify_header();
        assert_eq!(result.checksum_errors, 1);
        assert_eq!(result.errors[0].offset, STAGED_HEADER_OFFSET);
    }

    #[test]
    fn test_scrub_result_default() {
        let result = ScrubResult::default();
        assert_eq!(result.nodes_checked, 0);
        assert_eq!(result.checksum_errors, 0);
        assert_eq!(result.structural_errors, 0);
        assert!(result.errors.is_empty());
        assert!(result.is_clean());
    }
}
