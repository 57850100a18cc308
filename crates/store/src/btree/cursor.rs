//! Range scans over the event tree.
//!
//! Nodes carry no sibling links, so the cursor keeps the descent path on a
//! stack. Each frame remembers the node and the position of the child (or
//! leaf entry) being visited; moving past the end of a leaf pops frames until
//! a branch with an unvisited child is found.

use super::{EventTree, MAX_DEPTH, NodeReader};
use crate::{
    error::{Error, Offset, Result},
    page::{Entry, Node},
    record::IndexedRecord,
};

/// One level of the descent path.
#[derive(Debug)]
struct Frame {
    node: Node,
    /// Next entry in a leaf; child being visited in a branch.
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unpositioned,
    Positioned,
    Exhausted,
}

/// Lazy, restartable scan over an inclusive key range.
///
/// Yields `Result<R>`; after the first error the scan ends. A corrupt node
/// only ends this scan, other readers are unaffected.
pub struct EventScan<P, R> {
    tree: EventTree<P, R>,
    lower: u64,
    upper: u64,
    stack: Vec<Frame>,
    state: State,
}

impl<P: NodeReader, R: IndexedRecord> EventScan<P, R> {
    pub(crate) fn new(tree: EventTree<P, R>, lower: u64, upper: u64) -> Self {
        let state = if lower > upper { State::Exhausted } else { State::Unpositioned };
        Self { tree, lower, upper, stack: Vec::new(), state }
    }

    /// Root the scan reads through.
    pub fn root(&self) -> Offset {
        self.tree.root()
    }

    /// Rewinds to the start of the range.
    pub fn restart(&mut self) {
        self.stack.clear();
        self.state = if self.lower > self.upper { State::Exhausted } else { State::Unpositioned };
    }

    /// Descends from the root to the first entry `>= lower`.
    fn seek(&mut self) -> Result<()> {
        self.stack.clear();
        let mut offset = self.tree.root();
        loop {
            self.check_depth(offset)?;
            let node = self.tree.load(offset)?;
            let index = node.entries.partition_point(|e| e.key < self.lower);
            let leaf = node.is_leaf();
            if !leaf {
                offset = node.child(index);
            }
            self.stack.push(Frame { node, index });
            if leaf {
                return Ok(());
            }
        }
    }

    /// Descends along first children from `offset` to a leaf.
    fn descend_leftmost(&mut self, mut offset: Offset) -> Result<()> {
        loop {
            self.check_depth(offset)?;
            let node = self.tree.load(offset)?;
            let leaf = node.is_leaf();
            if !leaf {
                offset = node.first_child;
            }
            self.stack.push(Frame { node, index: 0 });
            if leaf {
                return Ok(());
            }
        }
    }

    fn check_depth(&self, offset: Offset) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(Error::CorruptTree { offset, reason: "tree too deep".to_string() });
        }
        Ok(())
    }

    /// Advances to the next leaf entry within the range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTree`] if a node on the path is damaged.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        match self.state {
            State::Exhausted => return Ok(None),
            State::Unpositioned => {
                self.state = State::Positioned;
                if let Err(e) = self.seek() {
                    self.state = State::Exhausted;
                    return Err(e);
                }
            },
            State::Positioned => {},
        }

        match self.advance() {
            Ok(Some(entry)) if entry.key <= self.upper => Ok(Some(entry)),
            Ok(_) => {
                self.state = State::Exhausted;
                Ok(None)
            },
            Err(e) => {
                self.state = State::Exhausted;
                Err(e)
            },
        }
    }

    fn advance(&mut self) -> Result<Option<Entry>> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };

            if top.node.is_leaf() {
                if let Some(&entry) = top.node.entries.get(top.index) {
                    top.index += 1;
                    return Ok(Some(entry));
                }
                self.stack.pop();
                continue;
            }

            top.index += 1;
            if top.index < top.node.child_count() {
                let child = top.node.child(top.index);
                self.descend_leftmost(child)?;
            } else {
                self.stack.pop();
            }
        }
    }
}

impl<P: NodeReader, R: IndexedRecord> Iterator for EventScan<P, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => {
                let record = self.tree.read_record(entry);
                if record.is_err() {
                    self.state = State::Exhausted;
                }
                Some(record)
            },
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<P: NodeReader, R: IndexedRecord> std::iter::FusedIterator for EventScan<P, R> {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        btree::tests::{TestProvider, insert_event},
        record::EventKind,
    };

    fn populated(count: u32) -> EventTree<TestProvider> {
        let mut tree = EventTree::new(EventKind::Clipboard, 0, TestProvider::new(128));
        for seq in 0..count {
            insert_event(&mut tree, 42, seq, "c");
        }
        tree
    }

    #[test]
    fn test_restart_replays_range() {
        let tree = populated(30);
        let mut scan = tree.scan(42, 5, 14).unwrap();

        let first: Vec<_> = scan.by_ref().take(3).map(|r| r.unwrap().sequence).collect();
        assert_eq!(first, vec![5, 6, 7]);

        scan.restart();
        let all: Vec<_> = scan.map(|r| r.unwrap().sequence).collect();
        assert_eq!(all, (5..15).collect::<Vec<_>>());
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let tree = populated(10);
        assert_eq!(tree.scan(42, 8, 2).unwrap().count(), 0);
    }

    #[test]
    fn test_range_past_end() {
        let tree = populated(10);
        let seqs: Vec<_> = tree.scan(42, 8, 100).unwrap().map(|r| r.unwrap().sequence).collect();
        assert_eq!(seqs, vec![8, 9]);
    }

    #[test]
    fn test_scan_is_fused_after_exhaustion() {
        let tree = populated(3);
        let mut scan = tree.scan(42, 0, 2).unwrap();
        assert_eq!(scan.by_ref().count(), 3);
        assert!(scan.next().is_none());
        assert!(scan.next().is_none());
    }

    #[test]
    fn test_scan_keeps_captured_root() {
        let mut tree = populated(10);
        let root = tree.root();
        tree.provider.publish();

        // Later inserts produce a new root; a scan over the old root is unaffected.
        for seq in 10..40 {
            insert_event(&mut tree, 42, seq, "c");
        }
        let old = EventTree::<_, crate::record::EventRecord>::new(EventKind::Clipboard, root, &tree.provider);
        let scan = old.scan(42, 0, u32::MAX).unwrap();
        assert_eq!(scan.root(), root);
        assert_eq!(scan.count(), 10);
    }

    #[test]
    fn test_error_ends_scan() {
        let mut tree = populated(20);
        let leaf_offsets: Vec<_> = tree
            .provider
            .nodes
            .iter()
            .filter(|(_, bytes)| bytes[0] == crate::page::NodeKind::Leaf as u8)
            .map(|(&offset, _)| offset)
            .collect();
        for offset in leaf_offsets {
            tree.provider.nodes.get_mut(&offset).unwrap()[40] ^= 0xFF;
        }

        let mut scan = tree.scan(42, 0, 19).unwrap();
        assert!(matches!(scan.next(), Some(Err(Error::CorruptTree { .. }))));
        assert!(scan.next().is_none());
    }
}
