//! Arena-backed forest of timeout nodes.

use crate::TimeoutId;
use std::collections::HashMap;
use tracing::debug;

/// Clears (cancels) the timer behind a node.
pub type ClearFn = Box<dyn FnOnce() + Send + 'static>;

struct Node {
    id: TimeoutId,
    clear_fn: Option<ClearFn>,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Forest of timeout nodes stored in an arena.
///
/// Nodes live in `slots`; freed slots are recycled through `free`, and `index`
/// maps ids to slots. The forest never runs clear functions itself: every
/// clearing operation hands them back so the caller can run them after
/// releasing whatever lock guards the forest.
#[derive(Default)]
pub struct TimeoutForest {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<TimeoutId, usize>,
}

impl TimeoutForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &TimeoutId) -> bool {
        self.index.contains_key(id)
    }

    pub fn parent(&self, id: &TimeoutId) -> Option<&TimeoutId> {
        let node = self.node(*self.index.get(id)?);
        node.parent.map(|slot| &self.node(slot).id)
    }

    pub fn children(&self, id: &TimeoutId) -> Vec<TimeoutId> {
        match self.index.get(id) {
            Some(&slot) => self
                .node(slot)
                .children
                .iter()
                .map(|&child| self.node(child).id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_children(&self, id: &TimeoutId) -> bool {
        self.index
            .get(id)
            .is_some_and(|&slot| !self.node(slot).children.is_empty())
    }

    /// Ids of all nodes without a parent.
    pub fn roots(&self) -> Vec<TimeoutId> {
        self.slots
            .iter()
            .flatten()
            .filter(|node| node.parent.is_none())
            .map(|node| node.id.clone())
            .collect()
    }

    /// Register a node.
    ///
    /// An unknown `parent` registers the node as a root. Re-registering an
    /// existing id clears the previous node's subtree first; the displaced
    /// clear functions are returned.
    pub fn register(
        &mut self,
        id: TimeoutId,
        clear_fn: Option<ClearFn>,
        parent: Option<&TimeoutId>,
    ) -> Vec<ClearFn> {
        let displaced = if self.contains(&id) {
            debug!(timeout_id = %id, "Re-registering timeout; clearing previous node");
            self.clear_subtree(&id)
        } else {
            Vec::new()
        };

        let parent_slot = parent.and_then(|parent_id| {
            let slot = self.index.get(parent_id).copied();
            if slot.is_none() {
                debug!(timeout_id = %id, parent_id = %parent_id, "Parent not registered; registering as root");
            }
            slot
        });

        let slot = self.alloc(Node {
            id: id.clone(),
            clear_fn,
            parent: parent_slot,
            children: Vec::new(),
        });
        if let Some(parent_slot) = parent_slot {
            self.node_mut(parent_slot).children.push(slot);
        }
        self.index.insert(id, slot);
        displaced
    }

    /// Attach a clear function to an already registered node.
    ///
    /// Hands the function back if the node is gone.
    pub fn set_clear_fn(&mut self, id: &TimeoutId, clear_fn: ClearFn) -> Result<(), ClearFn> {
        match self.index.get(id) {
            Some(&slot) => {
                self.node_mut(slot).clear_fn = Some(clear_fn);
                Ok(())
            }
            None => Err(clear_fn),
        }
    }

    /// Remove a node without running its clear function.
    ///
    /// Its children are kept and become roots. Returns whether the node existed.
    pub fn unregister(&mut self, id: &TimeoutId) -> bool {
        let Some(slot) = self.index.remove(id) else {
            return false;
        };
        let Some(node) = self.slots[slot].take() else {
            return false;
        };
        self.free.push(slot);

        if let Some(parent) = node.parent {
            self.node_mut(parent).children.retain(|&child| child != slot);
        }
        for child in node.children {
            self.node_mut(child).parent = None;
        }
        true
    }

    /// Remove a node and its descendants, depth-first: children, then the
    /// node itself, then its link in the parent. Returns the clear functions
    /// of every removed node in removal order.
    pub fn clear_subtree(&mut self, id: &TimeoutId) -> Vec<ClearFn> {
        let Some(&slot) = self.index.get(id) else {
            return Vec::new();
        };
        let parent = self.node(slot).parent;

        let mut cleared = Vec::new();
        self.remove_recursive(slot, &mut cleared);

        if let Some(parent) = parent {
            self.node_mut(parent).children.retain(|&child| child != slot);
        }
        cleared
    }

    /// Clear every root and thus every node.
    pub fn clear_all(&mut self) -> Vec<ClearFn> {
        let mut cleared = Vec::new();
        for root in self.roots() {
            cleared.extend(self.clear_subtree(&root));
        }
        cleared
    }

    fn remove_recursive(&mut self, slot: usize, cleared: &mut Vec<ClearFn>) {
        let children = std::mem::take(&mut self.node_mut(slot).children);
        for child in children {
            self.remove_recursive(child, cleared);
        }
        if let Some(node) = self.slots[slot].take() {
            self.index.remove(&node.id);
            self.free.push(slot);
            if let Some(clear_fn) = node.clear_fn {
                cleared.push(clear_fn);
            }
        }
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn node(&self, slot: usize) -> &Node {
        self.slots[slot].as_ref().expect("slot referenced by live node")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        self.slots[slot].as_mut().expect("slot referenced by live node")
    }
}

impl std::fmt::Debug for TimeoutForest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutForest")
            .field("nodes", &self.len())
            .field("free_slots", &self.free.len())
            .finish()
    }
}
