//! Ordered Queue
//!
//! A comparator-ordered singly linked list whose nodes live in an arena and are
//! addressed through generation-checked [`NodeId`] handles.
//!
//! The list can be mutated while it is being traversed. A traversal starts
//! with [`Queue::begin_walk`], which snapshots the successor of every linked
//! node. [`Queue::walk_next`] follows that snapshot, so:
//!
//! - every node linked at `begin_walk` is yielded exactly once;
//! - a node deleted during the walk stays readable until [`Queue::end_walk`],
//!   which is where its slot is reclaimed;
//! - a node inserted during the walk is not yielded by that walk.
//!
//! ```rust
//! use lumen_core::queue::{Order, Queue};
//!
//! let mut queue = Queue::new();
//! for value in [5u32, 1, 3] {
//!     queue.insert(value, |a, b| Order::ascending(a, b));
//! }
//! let values: Vec<u32> = queue.iter().map(|(_, v)| *v).collect();
//! assert_eq!(values, vec![1, 3, 5]);
//! ```

use std::fmt;

use thiserror::Error;
use tracing::error;

/// Result of comparing a candidate node against an existing one.
///
/// `After` means `existing` belongs after `candidate`: an insertion scan stops
/// at the first existing node for which the comparator answers `After` and
/// splices the candidate in front of it. Answering `Before` on ties keeps
/// equal elements in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Before,
    After,
}

impl Order {
    /// Comparator for ascending keys, FIFO among equal keys.
    pub fn ascending<K: Ord + ?Sized>(candidate: &K, existing: &K) -> Order {
        if candidate < existing {
            Order::After
        } else {
            Order::Before
        }
    }
}

/// Handle to a node stored in a [`Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: usize,
    generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Misuse of the queue protocol.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// `delete` was called on a node that is already deleted.
    #[error("node {0} was already deleted")]
    AlreadyDeleted(NodeId),

    /// `begin_walk` was called while another walk of the same queue is live.
    #[error("a walk over this queue is already in progress")]
    WalkInProgress,
}

/// Snapshot cursor returned by [`Queue::begin_walk`].
///
/// Must be handed back to [`Queue::end_walk`]; until then every node in the
/// snapshot is pinned.
#[derive(Debug)]
#[must_use = "a walk must be finished with Queue::end_walk"]
pub struct Walk {
    first: Option<usize>,
    cursor: Option<usize>,
}

struct Node<T> {
    value: T,
    next: Option<usize>,
    order: Option<usize>,
    walking: bool,
    deleted: bool,
    linked: bool,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Comparator-ordered queue. See the module documentation.
pub struct Queue<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    len: usize,
    walk_active: bool,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            len: 0,
            walk_active: false,
        }
    }

    /// Number of linked nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether a walk is currently in progress.
    pub fn is_walking(&self) -> bool {
        self.walk_active
    }

    /// Insert `value` at the first position where `order(value, existing)`
    /// answers [`Order::After`].
    pub fn insert<F>(&mut self, value: T, order: F) -> NodeId
    where
        F: FnMut(&T, &T) -> Order,
    {
        let node = Node {
            value,
            next: None,
            order: None,
            walking: false,
            deleted: false,
            linked: false,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        };

        self.link(index, order);
        NodeId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Unlink a node without reclaiming it. Returns `false` if the node was
    /// not linked.
    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.live_index(id) {
            Some(index) => self.unlink(index),
            None => false,
        }
    }

    /// Re-sort a node after its key changed. A detached node is linked again.
    /// Walk state is left untouched, so a node moved during a walk is still
    /// yielded exactly once. Returns `false` for deleted or unknown nodes.
    pub fn reorder<F>(&mut self, id: NodeId, order: F) -> bool
    where
        F: FnMut(&T, &T) -> Order,
    {
        let Some(index) = self.live_index(id) else {
            return false;
        };
        if self.at(index).deleted {
            return false;
        }

        self.unlink(index);
        self.link(index, order);
        true
    }

    /// Unlink and logically delete a node.
    ///
    /// The slot is reclaimed immediately unless the node is pinned by a walk,
    /// in which case reclamation happens in [`Queue::end_walk`]. Deleting a
    /// handle this queue never issued is a no-op. Deleting the same node
    /// twice is rejected.
    pub fn delete(&mut self, id: NodeId) -> Result<(), QueueError> {
        let Some(slot) = self.slots.get(id.index) else {
            return Ok(());
        };

        let already_deleted = match &slot.node {
            Some(node) if slot.generation == id.generation => node.deleted,
            _ => true,
        };
        if already_deleted {
            error!(node = %id, "Rejected second delete of queue node");
            return Err(QueueError::AlreadyDeleted(id));
        }

        self.unlink(id.index);
        let node = self.at_mut(id.index);
        node.deleted = true;
        if !node.walking {
            self.reclaim(id.index);
        }
        Ok(())
    }

    /// Snapshot the current link structure and pin every linked node.
    pub fn begin_walk(&mut self) -> Result<Walk, QueueError> {
        if self.walk_active {
            error!("Rejected nested walk of the same queue");
            return Err(QueueError::WalkInProgress);
        }
        self.walk_active = true;

        let mut cursor = self.head;
        while let Some(index) = cursor {
            let node = self.at_mut(index);
            node.order = node.next;
            node.walking = true;
            cursor = node.next;
        }

        Ok(Walk {
            first: self.head,
            cursor: self.head,
        })
    }

    /// Next node of the snapshot, including nodes deleted since the walk
    /// began (check [`Queue::is_deleted`]).
    pub fn walk_next(&self, walk: &mut Walk) -> Option<NodeId> {
        let index = walk.cursor?;
        walk.cursor = self.at(index).order;
        Some(NodeId {
            index,
            generation: self.slots[index].generation,
        })
    }

    /// Unpin every node of the snapshot and reclaim those deleted meanwhile.
    pub fn end_walk(&mut self, walk: Walk) {
        let mut cursor = walk.first;
        while let Some(index) = cursor {
            let node = self.at_mut(index);
            cursor = node.order;
            node.order = None;
            node.walking = false;
            if node.deleted {
                self.reclaim(index);
            }
        }
        self.walk_active = false;
    }

    /// Borrow a node's value. Nodes deleted during a live walk remain
    /// readable until the walk ends.
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.live_index(id).map(|index| &self.at(index).value)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        let index = self.live_index(id)?;
        Some(&mut self.at_mut(index).value)
    }

    /// True once `delete` has been called for this node, whether or not its
    /// slot has been reclaimed yet.
    pub fn is_deleted(&self, id: NodeId) -> bool {
        match self.live_index(id) {
            Some(index) => self.at(index).deleted,
            None => true,
        }
    }

    /// Whether the node is currently linked into the list.
    pub fn contains(&self, id: NodeId) -> bool {
        self.live_index(id)
            .map(|index| self.at(index).linked)
            .unwrap_or(false)
    }

    /// Iterate linked nodes in list order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    /// Handles of the linked nodes in list order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.iter().map(|(id, _)| id).collect()
    }

    fn live_index(&self, id: NodeId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        if slot.generation == id.generation && slot.node.is_some() {
            Some(id.index)
        } else {
            None
        }
    }

    fn at(&self, index: usize) -> &Node<T> {
        match &self.slots[index].node {
            Some(node) => node,
            None => unreachable!("queue slot {index} is free but still referenced"),
        }
    }

    fn at_mut(&mut self, index: usize) -> &mut Node<T> {
        match &mut self.slots[index].node {
            Some(node) => node,
            None => unreachable!("queue slot {index} is free but still referenced"),
        }
    }

    fn link<F>(&mut self, index: usize, mut order: F)
    where
        F: FnMut(&T, &T) -> Order,
    {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(existing) = cursor {
            if order(&self.at(index).value, &self.at(existing).value) == Order::After {
                break;
            }
            prev = Some(existing);
            cursor = self.at(existing).next;
        }

        let node = self.at_mut(index);
        node.next = cursor;
        node.linked = true;
        match prev {
            Some(prev) => self.at_mut(prev).next = Some(index),
            None => self.head = Some(index),
        }
        self.len += 1;
    }

    fn unlink(&mut self, index: usize) -> bool {
        if !self.at(index).linked {
            return false;
        }

        let mut prev = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == index {
                let next = self.at(current).next;
                match prev {
                    Some(prev) => self.at_mut(prev).next = next,
                    None => self.head = next,
                }
                let node = self.at_mut(current);
                node.next = None;
                node.linked = false;
                self.len -= 1;
                return true;
            }
            prev = Some(current);
            cursor = self.at(current).next;
        }
        false
    }

    fn reclaim(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }
}

/// Iterator over linked nodes, see [`Queue::iter`].
pub struct Iter<'a, T> {
    queue: &'a Queue<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.queue.at(index);
        self.cursor = node.next;
        Some((
            NodeId {
                index,
                generation: self.queue.slots[index].generation,
            },
            &node.value,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_value(a: &u32, b: &u32) -> Order {
        Order::ascending(a, b)
    }

    fn values(queue: &Queue<(u32, char)>) -> Vec<(u32, char)> {
        queue.iter().map(|(_, v)| *v).collect()
    }

    fn by_key(a: &(u32, char), b: &(u32, char)) -> Order {
        Order::ascending(&a.0, &b.0)
    }

    #[test]
    fn test_ascending_insert() {
        let mut queue = Queue::new();
        for v in [5, 1, 3] {
            queue.insert(v, by_value);
        }
        let got: Vec<u32> = queue.iter().map(|(_, v)| *v).collect();
        assert_eq!(got, vec![1, 3, 5]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut queue = Queue::new();
        queue.insert((5, 'x'), by_key);
        queue.insert((1, 'y'), by_key);
        queue.insert((3, 'a'), by_key);
        queue.insert((3, 'b'), by_key);
        assert_eq!(values(&queue), vec![(1, 'y'), (3, 'a'), (3, 'b'), (5, 'x')]);
    }

    #[test]
    fn test_insert_then_remove_restores_order() {
        let mut queue = Queue::new();
        for (k, c) in [(4, 'a'), (2, 'b'), (4, 'c'), (9, 'd')] {
            queue.insert((k, c), by_key);
        }
        let before = values(&queue);

        let id = queue.insert((4, 'z'), by_key);
        assert!(queue.remove(id));
        assert_eq!(values(&queue), before);
        assert!(!queue.remove(id));
    }

    #[test]
    fn test_remove_detaches_without_reclaiming() {
        let mut queue = Queue::new();
        let id = queue.insert(7, by_value);
        assert!(queue.remove(id));
        assert!(!queue.contains(id));
        assert_eq!(queue.get(id), Some(&7));
        assert!(queue.is_empty());

        // A detached node can be relinked.
        assert!(queue.reorder(id, by_value));
        assert!(queue.contains(id));
    }

    #[test]
    fn test_reorder_moves_node() {
        let mut queue = Queue::new();
        let a = queue.insert(1, by_value);
        queue.insert(2, by_value);
        queue.insert(3, by_value);

        *queue.get_mut(a).unwrap() = 10;
        assert!(queue.reorder(a, by_value));
        let got: Vec<u32> = queue.iter().map(|(_, v)| *v).collect();
        assert_eq!(got, vec![2, 3, 10]);
    }

    #[test]
    fn test_delete_absent_node_is_noop() {
        let mut queue: Queue<u32> = Queue::new();
        let mut other: Queue<u32> = Queue::new();
        other.insert(1, by_value);
        other.insert(2, by_value);
        let foreign = other.insert(3, by_value);

        queue.insert(1, by_value);
        assert!(queue.delete(foreign).is_ok());
        assert_eq!(queue.len(), 1);

        // Detached but live nodes are simply reclaimed.
        let id = queue.insert(4, by_value);
        queue.remove(id);
        assert!(queue.delete(id).is_ok());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_double_delete_is_rejected() {
        let mut queue = Queue::new();
        let id = queue.insert(1, by_value);
        queue.delete(id).unwrap();
        assert_eq!(queue.delete(id), Err(QueueError::AlreadyDeleted(id)));

        // The reclaimed slot is reused with a new generation.
        let fresh = queue.insert(2, by_value);
        assert_ne!(fresh, id);
        assert_eq!(queue.delete(id), Err(QueueError::AlreadyDeleted(id)));
        assert_eq!(queue.get(fresh), Some(&2));
    }

    #[test]
    fn test_double_delete_during_walk_is_rejected() {
        let mut queue = Queue::new();
        let id = queue.insert(1, by_value);
        let walk = queue.begin_walk().unwrap();
        queue.delete(id).unwrap();
        assert!(queue.delete(id).is_err());
        queue.end_walk(walk);
        assert!(queue.get(id).is_none());
    }

    #[test]
    fn test_walk_survives_deletion() {
        let mut queue = Queue::new();
        let ids: Vec<NodeId> = (0..5).map(|v| queue.insert(v, by_value)).collect();

        let mut walk = queue.begin_walk().unwrap();
        let mut visited = Vec::new();
        while let Some(id) = queue.walk_next(&mut walk) {
            visited.push(*queue.get(id).unwrap());
            if id == ids[1] {
                // Delete self, a later node and an earlier node.
                queue.delete(ids[1]).unwrap();
                queue.delete(ids[3]).unwrap();
                queue.delete(ids[0]).unwrap();
                // Still pinned.
                assert_eq!(queue.get(ids[3]), Some(&3));
            }
        }
        assert_eq!(visited, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.len(), 2);

        queue.end_walk(walk);
        assert!(queue.get(ids[3]).is_none());
        assert!(queue.get(ids[0]).is_none());
        assert_eq!(queue.get(ids[2]), Some(&2));
    }

    #[test]
    fn test_walk_ignores_insertions() {
        let mut queue = Queue::new();
        queue.insert(10, by_value);
        queue.insert(30, by_value);

        let mut walk = queue.begin_walk().unwrap();
        let mut visited = Vec::new();
        while let Some(id) = queue.walk_next(&mut walk) {
            visited.push(*queue.get(id).unwrap());
            queue.insert(20, by_value);
            queue.insert(0, by_value);
        }
        queue.end_walk(walk);

        assert_eq!(visited, vec![10, 30]);
        assert_eq!(queue.len(), 6);
    }

    #[test]
    fn test_walk_with_reorder_visits_once() {
        let mut queue = Queue::new();
        let first = queue.insert(1, by_value);
        queue.insert(2, by_value);
        queue.insert(3, by_value);

        let mut walk = queue.begin_walk().unwrap();
        let mut visited = Vec::new();
        while let Some(id) = queue.walk_next(&mut walk) {
            visited.push(*queue.get(id).unwrap());
            if id == first {
                *queue.get_mut(first).unwrap() = 99;
                queue.reorder(first, by_value);
            }
        }
        queue.end_walk(walk);

        assert_eq!(visited, vec![1, 2, 3]);
        let got: Vec<u32> = queue.iter().map(|(_, v)| *v).collect();
        assert_eq!(got, vec![2, 3, 99]);
    }

    #[test]
    fn test_interleaved_mutations_visit_snapshot_exactly_once() {
        let mut queue = Queue::new();
        let ids: Vec<NodeId> = (0..8).map(|v| queue.insert(v, by_value)).collect();

        let mut walk = queue.begin_walk().unwrap();
        let mut visits = [0u32; 8];
        let mut step = 0;
        while let Some(id) = queue.walk_next(&mut walk) {
            let v = *queue.get(id).unwrap() as usize;
            visits[v] += 1;
            match step % 3 {
                0 => {
                    let _ = queue.delete(ids[(v + 2) % 8]);
                }
                1 => {
                    queue.insert(100 + step, by_value);
                }
                _ => {
                    queue.remove(ids[(v + 5) % 8]);
                }
            }
            step += 1;
        }
        queue.end_walk(walk);

        assert!(visits.iter().all(|&n| n == 1));
        assert!(!queue.is_walking());
    }

    #[test]
    fn test_nested_walk_is_rejected() {
        let mut queue = Queue::new();
        queue.insert(1, by_value);
        let walk = queue.begin_walk().unwrap();
        assert_eq!(queue.begin_walk().unwrap_err(), QueueError::WalkInProgress);
        queue.end_walk(walk);
        let again = queue.begin_walk().unwrap();
        queue.end_walk(again);
    }
}
