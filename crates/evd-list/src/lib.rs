//! Intrusive doubly-linked lists for the evd dispatch engine.
//!
//! Nodes live in a [`ListArena`] and are addressed by generational
//! [`NodeId`] handles. Any number of lists can be threaded through the same
//! arena; each list is a sentinel root ([`ListId`]) caching its first and
//! last element. A node is linked into at most one list at a time, which is
//! what lets a dispatch context move an event between its ready queue, its
//! timer queue and its per-tick side list without reallocating it.
//!
//! # Ownership
//!
//! The arena owns every value it holds. Linking and unlinking only rewires
//! handles; a value leaves the arena through [`ListArena::take`],
//! [`ListArena::pop_value`] or [`ListArena::destroy_all`]. The last of these
//! hands each value to the node's destructor, if one was installed, so
//! forced removal always has a cleanup path.
//!
//! ```
//! use evd_list::ListArena;
//!
//! let mut arena = ListArena::new();
//! let list = arena.new_list();
//!
//! let a = arena.push_value(list, 'a');
//! let c = arena.push_value(list, 'c');
//! let b = arena.insert('b');
//! arena.insert_after(a.into(), b).unwrap();
//!
//! let order: Vec<char> = arena.iter(list).map(|(_, v)| *v).collect();
//! assert_eq!(order, ['a', 'b', 'c']);
//! assert_eq!(arena.get_last(list), Some(c));
//! ```

#![warn(missing_docs)]

use std::fmt;
use thiserror::Error;

// ============================================================================
// Handles
// ============================================================================

/// Handle to a node slot in a [`ListArena`].
///
/// Handles carry the generation of the slot they were issued for, so a
/// handle kept past [`ListArena::take`] is rejected instead of silently
/// addressing whatever node reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Slot index of this handle.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({}v{})", self.index, self.generation)
    }
}

/// Handle to a list (its sentinel root) in a [`ListArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListId(u32);

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "List({})", self.0)
    }
}

/// A position in a list: either the sentinel root or a linked node.
///
/// [`ListArena::iterator`] returns the root position. Inserting after the
/// root prepends; stepping with [`ListArena::next`] from the root yields the
/// first element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// The sentinel root of a list.
    Root(ListId),
    /// A linked element.
    Node(NodeId),
}

impl From<NodeId> for Cursor {
    fn from(node: NodeId) -> Self {
        Self::Node(node)
    }
}

impl From<ListId> for Cursor {
    fn from(list: ListId) -> Self {
        Self::Root(list)
    }
}

/// Cleanup invoked with a node's value when [`ListArena::destroy_all`]
/// force-removes it.
pub type Destructor<T> = Box<dyn FnOnce(T) + Send>;

/// Errors from list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ListError {
    /// The handle refers to a freed or foreign slot.
    #[error("stale or unknown node handle {0}")]
    StaleNode(NodeId),
    /// The node is already linked into a list.
    #[error("{node} is already linked into {list}")]
    AlreadyLinked {
        /// The node being linked.
        node: NodeId,
        /// The list currently holding it.
        list: ListId,
    },
    /// The cursor node is not linked, so it has no list to insert into.
    #[error("{0} is not linked into any list")]
    NotLinked(NodeId),
}

/// Result type for list operations.
pub type ListResult<T> = Result<T, ListError>;

// ============================================================================
// Storage
// ============================================================================

struct Node<T> {
    value: T,
    /// Owning list, `None` iff unlinked.
    root: Option<ListId>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    destructor: Option<Destructor<T>>,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Sentinel root of one list.
#[derive(Debug, Clone, Copy, Default)]
struct Sentinel {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

/// Arena of list nodes plus the sentinel roots of every list threaded
/// through it.
pub struct ListArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    roots: Vec<Sentinel>,
}

impl<T> ListArena<T> {
    /// Create an empty arena with no lists.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Create a new, empty list in this arena.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` lists are created.
    pub fn new_list(&mut self) -> ListId {
        let id = u32::try_from(self.roots.len()).expect("list count exceeds u32::MAX");
        self.roots.push(Sentinel::default());
        ListId(id)
    }

    /// Number of live nodes, linked or not.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    // ------------------------------------------------------------------
    // Node allocation
    // ------------------------------------------------------------------

    /// Allocate an unlinked node holding `value`.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` slots are allocated.
    pub fn insert(&mut self, value: T) -> NodeId {
        let node = Node {
            value,
            root: None,
            prev: None,
            next: None,
            destructor: None,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("arena exceeds u32::MAX slots");
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    /// Free a node and return its value, unlinking it first if needed.
    ///
    /// The node's destructor is discarded without running; the caller now
    /// owns the value.
    pub fn take(&mut self, node: NodeId) -> Option<T> {
        self.node(node)?;
        self.remove(node);
        let slot = &mut self.slots[node.index()];
        let taken = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(node.index);
        Some(taken.value)
    }

    /// Whether `node` refers to a live slot.
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.node(node).is_some()
    }

    /// Borrow a node's value.
    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&T> {
        self.node(node).map(|n| &n.value)
    }

    /// Mutably borrow a node's value.
    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut T> {
        self.node_mut(node).map(|n| &mut n.value)
    }

    /// The list a node is linked into, or `None` if unlinked or stale.
    #[must_use]
    pub fn root_of(&self, node: NodeId) -> Option<ListId> {
        self.node(node).and_then(|n| n.root)
    }

    /// Install the destructor run when [`destroy_all`](Self::destroy_all)
    /// force-removes this node.
    pub fn set_destructor<F>(&mut self, node: NodeId, destructor: F) -> ListResult<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        let n = self.node_mut(node).ok_or(ListError::StaleNode(node))?;
        n.destructor = Some(Box::new(destructor));
        Ok(())
    }

    /// Remove a node's destructor, if any.
    pub fn clear_destructor(&mut self, node: NodeId) {
        if let Some(n) = self.node_mut(node) {
            n.destructor = None;
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Whether the list has no elements.
    ///
    /// # Panics
    ///
    /// Panics if `list` was not created by this arena.
    #[must_use]
    pub fn is_empty(&self, list: ListId) -> bool {
        self.root(list).head.is_none()
    }

    /// Number of elements in the list.
    ///
    /// # Panics
    ///
    /// Panics if `list` was not created by this arena.
    #[must_use]
    pub fn len(&self, list: ListId) -> usize {
        self.root(list).len
    }

    /// The sentinel position of a list, the starting point for iteration.
    #[must_use]
    pub const fn iterator(&self, list: ListId) -> Cursor {
        Cursor::Root(list)
    }

    /// First element of the list.
    ///
    /// # Panics
    ///
    /// Panics if `list` was not created by this arena.
    #[must_use]
    pub fn first(&self, list: ListId) -> Option<NodeId> {
        self.root(list).head
    }

    /// Last element of the list.
    ///
    /// # Panics
    ///
    /// Panics if `list` was not created by this arena.
    #[must_use]
    pub fn get_last(&self, list: ListId) -> Option<NodeId> {
        self.root(list).tail
    }

    /// The element after `cursor`.
    ///
    /// # Panics
    ///
    /// Panics if a root cursor names a list not created by this arena.
    #[must_use]
    pub fn next(&self, cursor: Cursor) -> Option<NodeId> {
        match cursor {
            Cursor::Root(list) => self.root(list).head,
            Cursor::Node(node) => self.node(node).and_then(|n| n.next),
        }
    }

    /// Whether there is an element after `cursor`.
    #[must_use]
    pub fn has_next(&self, cursor: Cursor) -> bool {
        self.next(cursor).is_some()
    }

    /// The element before `node`; `None` for the first element.
    #[must_use]
    pub fn prev(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).and_then(|n| n.prev)
    }

    /// Iterate over the list front to back.
    ///
    /// # Panics
    ///
    /// Panics if `list` was not created by this arena.
    #[must_use]
    pub fn iter(&self, list: ListId) -> Iter<'_, T> {
        Iter {
            arena: self,
            next: self.root(list).head,
        }
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    /// Link the unlinked `node` directly after `cursor`.
    ///
    /// Inserting after the current last element moves the list's tail to
    /// `node`; inserting after the root makes `node` the first element.
    ///
    /// # Errors
    ///
    /// Fails if either handle is stale, if `node` is already linked, or if
    /// the cursor node is itself unlinked.
    pub fn insert_after(&mut self, cursor: Cursor, node: NodeId) -> ListResult<NodeId> {
        match self.node(node) {
            None => return Err(ListError::StaleNode(node)),
            Some(Node {
                root: Some(list), ..
            }) => {
                return Err(ListError::AlreadyLinked { node, list: *list });
            }
            Some(_) => {}
        }

        let (list, prev, next) = match cursor {
            Cursor::Root(list) => (list, None, self.root(list).head),
            Cursor::Node(at) => {
                let n = self.node(at).ok_or(ListError::StaleNode(at))?;
                let list = n.root.ok_or(ListError::NotLinked(at))?;
                (list, Some(at), n.next)
            }
        };

        {
            let n = self.linked_mut(node);
            n.root = Some(list);
            n.prev = prev;
            n.next = next;
        }
        match prev {
            Some(p) => self.linked_mut(p).next = Some(node),
            None => self.root_mut(list).head = Some(node),
        }
        match next {
            Some(nx) => self.linked_mut(nx).prev = Some(node),
            None => self.root_mut(list).tail = Some(node),
        }
        self.root_mut(list).len += 1;
        Ok(node)
    }

    /// Link the unlinked `node` at the tail of `list`.
    ///
    /// # Errors
    ///
    /// Fails if `node` is stale or already linked.
    pub fn push(&mut self, list: ListId, node: NodeId) -> ListResult<NodeId> {
        let at = match self.root(list).tail {
            Some(last) => Cursor::Node(last),
            None => Cursor::Root(list),
        };
        self.insert_after(at, node)
    }

    /// Unlink `node` from whatever list holds it.
    ///
    /// Returns `None` if the node is stale or not linked. The removed
    /// node's own links are cleared, so callers walking a list must read
    /// the successor before removing the current element.
    pub fn remove(&mut self, node: NodeId) -> Option<NodeId> {
        let (list, prev, next) = {
            let n = self.node_mut(node)?;
            let list = n.root.take()?;
            (list, n.prev.take(), n.next.take())
        };
        match prev {
            Some(p) => self.linked_mut(p).next = next,
            None => self.root_mut(list).head = next,
        }
        match next {
            Some(nx) => self.linked_mut(nx).prev = prev,
            None => self.root_mut(list).tail = prev,
        }
        self.root_mut(list).len -= 1;
        Some(node)
    }

    /// Unlink and return the first element of `list`.
    ///
    /// # Panics
    ///
    /// Panics if `list` was not created by this arena.
    pub fn pop(&mut self, list: ListId) -> Option<NodeId> {
        let head = self.root(list).head?;
        self.remove(head)
    }

    /// Allocate a node for `value` and link it at the tail of `list`.
    pub fn push_value(&mut self, list: ListId, value: T) -> NodeId {
        let node = self.insert(value);
        let at = match self.root(list).tail {
            Some(last) => Cursor::Node(last),
            None => Cursor::Root(list),
        };
        // A freshly allocated node is live and unlinked.
        let _ = self.insert_after(at, node);
        node
    }

    /// Unlink and free the first element of `list`, returning its value.
    pub fn pop_value(&mut self, list: ListId) -> Option<T> {
        let node = self.pop(list)?;
        self.take(node)
    }

    /// Force-remove every element of `list`.
    ///
    /// Each element is unlinked and freed; its value is passed to its
    /// destructor if one was installed and dropped otherwise. The list is
    /// empty afterwards.
    pub fn destroy_all(&mut self, list: ListId) {
        while let Some(node) = self.pop(list) {
            let slot = &mut self.slots[node.index()];
            let Some(taken) = slot.node.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(node.index);
            match taken.destructor {
                Some(destructor) => destructor(taken.value),
                None => drop(taken.value),
            }
        }
        *self.root_mut(list) = Sentinel::default();
    }

    // ------------------------------------------------------------------
    // Internal access
    // ------------------------------------------------------------------

    fn node(&self, id: NodeId) -> Option<&Node<T>> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    /// Access a node reached through list links, which are always live.
    fn linked_mut(&mut self, id: NodeId) -> &mut Node<T> {
        self.node_mut(id).expect("list links only reference live nodes")
    }

    fn root(&self, list: ListId) -> &Sentinel {
        self.roots
            .get(list.0 as usize)
            .expect("list id belongs to a different arena")
    }

    fn root_mut(&mut self, list: ListId) -> &mut Sentinel {
        self.roots
            .get_mut(list.0 as usize)
            .expect("list id belongs to a different arena")
    }
}

impl<T> Default for ListArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for ListArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lists = f.debug_map();
        for (i, _) in self.roots.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let list = ListId(i as u32);
            lists.entry(&list, &self.iter(list).map(|(_, v)| v).collect::<Vec<_>>());
        }
        lists.finish()
    }
}

/// Front-to-back iterator over one list.
pub struct Iter<'a, T> {
    arena: &'a ListArena<T>,
    next: Option<NodeId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let node = self.arena.node(id)?;
        self.next = node.next;
        Some((id, &node.value))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn forward(arena: &ListArena<u32>, list: ListId) -> Vec<u32> {
        arena.iter(list).map(|(_, v)| *v).collect()
    }

    fn backward(arena: &ListArena<u32>, list: ListId) -> Vec<u32> {
        let mut out = Vec::new();
        let mut at = arena.get_last(list);
        while let Some(node) = at {
            out.push(*arena.get(node).unwrap());
            at = arena.prev(node);
        }
        out
    }

    #[test]
    fn test_push_and_count_both_ways() {
        let mut arena = ListArena::new();
        let list = arena.new_list();
        let e: Vec<_> = (0..3).map(|i| arena.push_value(list, i)).collect();

        assert_eq!(forward(&arena, list), [0, 1, 2]);
        assert_eq!(backward(&arena, list), [2, 1, 0]);

        arena.remove(e[1]).unwrap();
        assert_eq!(forward(&arena, list), [0, 2]);
        assert_eq!(backward(&arena, list), [2, 0]);

        arena.insert_after(e[0].into(), e[1]).unwrap();
        assert_eq!(forward(&arena, list), [0, 1, 2]);
        assert_eq!(backward(&arena, list), [2, 1, 0]);

        arena.remove(e[0]).unwrap();
        assert_eq!(forward(&arena, list), [1, 2]);
        assert_eq!(backward(&arena, list), [2, 1]);

        arena.insert_after(arena.iterator(list), e[0]).unwrap();
        assert_eq!(forward(&arena, list), [0, 1, 2]);
        assert_eq!(backward(&arena, list), [2, 1, 0]);
        assert_eq!(arena.len(list), 3);
    }

    #[test]
    fn test_insert_after_last_moves_tail() {
        let mut arena = ListArena::new();
        let list = arena.new_list();
        let a = arena.push_value(list, 1);
        let b = arena.insert(2);
        arena.insert_after(a.into(), b).unwrap();
        assert_eq!(arena.get_last(list), Some(b));
        assert_eq!(arena.prev(b), Some(a));
        assert!(!arena.has_next(b.into()));
    }

    #[test]
    fn test_remove_unlinked_is_noop() {
        let mut arena = ListArena::new();
        let list = arena.new_list();
        let a = arena.push_value(list, 7);
        assert_eq!(arena.remove(a), Some(a));
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.root_of(a), None);
        assert!(arena.is_empty(list));
        assert_eq!(arena.first(list), None);
        assert_eq!(arena.get_last(list), None);
    }

    #[test]
    fn test_pop_drains_in_order() {
        let mut arena = ListArena::new();
        let list = arena.new_list();
        for i in 0..5 {
            arena.push_value(list, i);
        }
        let drained: Vec<_> = std::iter::from_fn(|| arena.pop_value(list)).collect();
        assert_eq!(drained, [0, 1, 2, 3, 4]);
        assert_eq!(arena.node_count(), 0);
    }

    #[test]
    fn test_node_moves_between_lists() {
        let mut arena = ListArena::new();
        let ready = arena.new_list();
        let side = arena.new_list();
        let n = arena.push_value(ready, 1);

        assert_eq!(
            arena.push(side, n),
            Err(ListError::AlreadyLinked {
                node: n,
                list: ready
            })
        );
        arena.remove(n);
        arena.push(side, n).unwrap();
        assert_eq!(arena.root_of(n), Some(side));
        assert!(arena.is_empty(ready));
    }

    #[test]
    fn test_insert_after_unlinked_cursor_fails() {
        let mut arena = ListArena::new();
        let _list = arena.new_list();
        let a = arena.insert(1);
        let b = arena.insert(2);
        assert_eq!(arena.insert_after(a.into(), b), Err(ListError::NotLinked(a)));
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut arena = ListArena::new();
        let list = arena.new_list();
        let a = arena.push_value(list, 1);
        assert_eq!(arena.take(a), Some(1));
        let b = arena.insert(2);
        assert_eq!(a.index(), b.index());
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.push(list, a), Err(ListError::StaleNode(a)));
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn test_destroy_all_runs_destructors_once() {
        let mut arena = ListArena::new();
        let list = arena.new_list();
        let ran = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let node = arena.push_value(list, i);
            if i % 2 == 0 {
                let ran = Arc::clone(&ran);
                arena
                    .set_destructor(node, move |_| {
                        ran.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        }

        arena.destroy_all(list);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(arena.is_empty(list));
        assert_eq!(arena.get_last(list), None);
        assert_eq!(arena.node_count(), 0);

        arena.destroy_all(list);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_take_discards_destructor() {
        let mut arena = ListArena::new();
        let list = arena.new_list();
        let ran = Arc::new(AtomicUsize::new(0));
        let node = arena.push_value(list, 0);
        let counter = Arc::clone(&ran);
        arena
            .set_destructor(node, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(arena.take(node), Some(0));
        arena.destroy_all(list);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
