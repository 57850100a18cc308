//! Offset-keyed node cache with clock eviction.
//!
//! Only committed nodes are cached. Committed nodes are immutable, so a
//! cached entry never goes stale while its offset stays below the committed
//! `next_free`.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use super::Node;
use crate::error::Offset;

struct Slot {
    node: Node,
    referenced: bool,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<Offset, Slot>,
    ring: Vec<Offset>,
    hand: usize,
}

/// Node cache with second-chance eviction.
pub struct NodeCache {
    inner: Mutex<Inner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NodeCache {
    /// Creates a cache holding up to `capacity` nodes. Zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::with_capacity(capacity),
                ring: Vec::with_capacity(capacity),
                hand: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a copy of the node cached at `offset`.
    pub fn get(&self, offset: Offset) -> Option<Node> {
        let mut inner = self.inner.lock();
        match inner.nodes.get_mut(&offset) {
            Some(slot) => {
                slot.referenced = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.node.clone())
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    /// Caches `node`, evicting another entry when full.
    pub fn insert(&self, node: Node) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        let offset = node.offset;
        if let Some(slot) = inner.nodes.get_mut(&offset) {
            slot.node = node;
            slot.referenced = true;
            return;
        }

        if inner.nodes.len() >= self.capacity {
            Self::evict_one(&mut inner);
        }
        inner.ring.push(offset);
        inner.nodes.insert(offset, Slot { node, referenced: false });
    }

    fn evict_one(inner: &mut Inner) {
        loop {
            if inner.ring.is_empty() {
                return;
            }
            if inner.hand >= inner.ring.len() {
                inner.hand = 0;
            }
            let offset = inner.ring[inner.hand];
            match inner.nodes.get_mut(&offset) {
                Some(slot) if slot.referenced => {
                    slot.referenced = false;
                    inner.hand += 1;
                },
                _ => {
                    inner.nodes.remove(&offset);
                    inner.ring.swap_remove(inner.hand);
                    return;
                },
            }
        }
    }

    /// Drops every entry at or above `offset`.
    ///
    /// Called when a transaction aborts, since its offsets will be handed out
    /// again.
    pub fn invalidate_from(&self, offset: Offset) {
        let mut inner = self.inner.lock();
        inner.nodes.retain(|&at, _| at < offset);
        inner.ring.retain(|&at| at < offset);
        inner.hand = 0;
    }

    /// Removes all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.ring.clear();
        inner.hand = 0;
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
