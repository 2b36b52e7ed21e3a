//! RGA (Replicated Growable Array) CRDT for ordered sequences.
//!
//! RGA provides:
//! - Ordered sequence semantics (like a list/array)
//! - Concurrent insert/delete operations that converge
//! - Deterministic ordering of concurrent inserts at the same position
//!
//! # Algorithm Overview
//!
//! Each element is stored as a node with:
//! - A unique OpId
//! - A logical [`Timestamp`] taken when the element was inserted
//! - The value, kept even after deletion (tombstones carry a `deleted` flag)
//! - A parent_id (the element this was inserted after)
//! - Children (elements inserted immediately after this one)
//!
//! Children are kept sorted by timestamp, newest first, and the sequence is the
//! pre-order walk of that tree. A local insert always carries a timestamp
//! newer than anything the replica has seen, so it lands directly after its
//! parent. Two concurrent inserts after the same parent are ordered by
//! `(counter, client_id)`, which every replica agrees on.

use crate::clock::Timestamp;
use crate::op_id::OpId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A node in the RGA sequence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RgaNode<T> {
    /// Unique operation ID for this node
    pub id: OpId,
    /// Timestamp used to order this node among its siblings
    pub stamp: Timestamp,
    /// The value (None only for the root sentinel)
    pub value: Option<T>,
    /// Whether the element has been deleted
    pub deleted: bool,
    /// ID of the parent node (where this was inserted after)
    pub parent_id: Option<OpId>,
    /// IDs of nodes inserted immediately after this one (newest first)
    children: Vec<OpId>,
}

impl<T> RgaNode<T> {
    fn new(id: OpId, stamp: Timestamp, value: Option<T>, parent_id: Option<OpId>) -> Self {
        Self {
            id,
            stamp,
            value,
            deleted: false,
            parent_id,
            children: Vec::new(),
        }
    }

    /// Check if this node is a tombstone (deleted)
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// The live value, if the node is visible
    pub fn visible_value(&self) -> Option<&T> {
        if self.deleted {
            None
        } else {
            self.value.as_ref()
        }
    }

    /// Get the children of this node
    pub fn children(&self) -> &[OpId] {
        &self.children
    }
}

/// Replicated Growable Array - a CRDT for ordered sequences
///
/// # Example
///
/// ```
/// use itinerary_collab::clock::Timestamp;
/// use itinerary_collab::op_id::{ClientId, OpId};
/// use itinerary_collab::rga::Rga;
///
/// let mut replica1 = Rga::<char>::new();
/// let mut replica2 = Rga::<char>::new();
///
/// let a = OpId::new(1u64, 1);
/// replica1.insert(a, Timestamp::new(1, ClientId::new(1)), None, 'a');
/// replica2.insert(a, Timestamp::new(1, ClientId::new(1)), None, 'a');
///
/// assert_eq!(replica1.to_vec(), replica2.to_vec());
/// ```
#[derive(Clone, Debug)]
pub struct Rga<T> {
    /// All nodes by their OpId
    nodes: HashMap<OpId, RgaNode<T>>,
    /// The root sentinel node ID
    root: OpId,
    /// Number of visible elements
    visible: usize,
}

impl<T> Default for Rga<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Rga<T> {
    /// Create an empty sequence
    pub fn new() -> Self {
        let root_id = OpId::root();
        let mut nodes = HashMap::new();
        nodes.insert(root_id, RgaNode::new(root_id, Timestamp::default(), None, None));

        Self {
            nodes,
            root: root_id,
            visible: 0,
        }
    }

    /// Get the root OpId
    pub fn root_id(&self) -> OpId {
        self.root
    }

    /// Whether an element (live or deleted) with this id exists
    pub fn contains(&self, id: OpId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Whether an insert after `parent_id` can be integrated now
    pub fn can_insert_after(&self, parent_id: Option<OpId>) -> bool {
        parent_id.map_or(true, |id| self.nodes.contains_key(&id))
    }

    /// Insert a value after the given element (None = at the beginning).
    ///
    /// Idempotent: returns `false` if the id is already present. Also returns
    /// `false` without inserting if the parent is unknown; callers check
    /// [`Rga::can_insert_after`] first and defer such inserts.
    pub fn insert(&mut self, id: OpId, stamp: Timestamp, parent_id: Option<OpId>, value: T) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }

        let actual_parent_id = parent_id.unwrap_or(self.root);
        let nodes = &self.nodes;
        let Some(parent) = self.nodes.get(&actual_parent_id) else {
            return false;
        };

        // Find insertion position to keep siblings in descending stamp order
        let pos = parent
            .children
            .iter()
            .position(|child| {
                nodes
                    .get(child)
                    .map_or(true, |c| (c.stamp, c.id) < (stamp, id))
            })
            .unwrap_or(parent.children.len());

        if let Some(parent) = self.nodes.get_mut(&actual_parent_id) {
            parent.children.insert(pos, id);
        }
        self.nodes
            .insert(id, RgaNode::new(id, stamp, Some(value), Some(actual_parent_id)));
        self.visible += 1;
        true
    }

    /// Mark the element as deleted.
    ///
    /// Returns `true` only if the element was visible before the call.
    pub fn delete(&mut self, id: OpId) -> bool {
        if id.is_root() {
            return false;
        }
        match self.nodes.get_mut(&id) {
            Some(node) if !node.deleted => {
                node.deleted = true;
                self.visible -= 1;
                true
            }
            _ => false,
        }
    }

    /// Pre-order walk from the root, collecting element ids in sequence order
    fn traverse(&self) -> Vec<OpId> {
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];

        while let Some(node_id) = stack.pop() {
            if let Some(node) = self.nodes.get(&node_id) {
                if !node_id.is_root() {
                    result.push(node_id);
                }
                // Newest child must be visited first
                stack.extend(node.children.iter().rev().copied());
            }
        }
        result
    }

    /// Get the visible sequence as a vector
    pub fn to_vec(&self) -> Vec<&T> {
        self.iter().map(|(_, value)| value).collect()
    }

    /// Visible elements with their ids, in order
    pub fn iter(&self) -> impl Iterator<Item = (OpId, &T)> + '_ {
        self.traverse().into_iter().filter_map(move |id| {
            self.nodes
                .get(&id)
                .and_then(|n| n.visible_value())
                .map(|v| (id, v))
        })
    }

    /// Get all nodes in order (including tombstones)
    pub fn nodes_in_order(&self) -> Vec<&RgaNode<T>> {
        self.traverse()
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .collect()
    }

    /// Get the OpId at a visible index (0-based)
    pub fn id_at_index(&self, index: usize) -> Option<OpId> {
        self.iter().nth(index).map(|(id, _)| id)
    }

    /// Get the visible index of an element; `None` for tombstones
    pub fn index_of(&self, id: OpId) -> Option<usize> {
        self.iter().position(|(current, _)| current == id)
    }

    /// Number of visible elements
    pub fn len(&self) -> usize {
        self.visible
    }

    /// Check if empty (no visible elements)
    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Get a node by its OpId, including tombstones
    pub fn get_node(&self, id: OpId) -> Option<&RgaNode<T>> {
        self.nodes.get(&id)
    }

    /// Get a visible value by its OpId
    pub fn get(&self, id: OpId) -> Option<&T> {
        self.nodes.get(&id).and_then(|n| n.visible_value())
    }
}
