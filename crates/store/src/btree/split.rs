//! Node splitting for the event tree.
//!
//! ## Leaf split
//!
//! An overfull leaf keeps the lower half of its entries; the upper half moves
//! to a new right sibling. The first key of the right half is *copied* up as
//! the separator. Equal keys may straddle the split, so the left subtree
//! holds keys `<= separator` and the right subtree keys `>= separator`.
//!
//! ## Branch split
//!
//! The median entry of an overfull branch is *moved* up: its key becomes the
//! separator and its child becomes the right branch's `first_child`.
//!
//! Both functions work on decoded nodes; the caller decides where the halves
//! are written.

use crate::{
    error::Offset,
    page::{Node, NodeKind},
};

/// Offset of a right half that has not been placed yet.
const UNPLACED: Offset = 0;

/// Halves produced by a split.
#[derive(Debug)]
pub struct SplitResult {
    /// The original node, trimmed to its lower half.
    pub left: Node,
    /// The new right sibling. Its offset is a placeholder until written.
    pub right: Node,
    /// Key promoted into the parent.
    pub separator: u64,
}

/// Splits an overfull leaf.
pub fn split_leaf(mut node: Node, commit_id: u64) -> SplitResult {
    debug_assert_eq!(node.kind, NodeKind::Leaf);
    let mid = node.entries.len() / 2;
    let upper = node.entries.split_off(mid);
    let separator = upper[0].key;

    let mut right = Node::leaf(UNPLACED, commit_id);
    right.entries = upper;
    SplitResult { left: node, right, separator }
}

/// Splits an overfull branch.
pub fn split_branch(mut node: Node, commit_id: u64) -> SplitResult {
    debug_assert_eq!(node.kind, NodeKind::Branch);
    let mid = node.entries.len() / 2;
    let mut upper = node.entries.split_off(mid);
    let promoted = upper.remove(0);

    let mut right = Node::branch(UNPLACED, commit_id, promoted.offset);
    right.entries = upper;
    SplitResult { left: node, right, separator: promoted.key }
}

/// Returns true when `node` holds more entries than fit at `node_size`.
pub fn needs_split(node: &Node, node_size: u32) -> bool {
    node.entries.len() > Node::capacity(node.kind, node_size)
}
