//! Hierarchical mutation tracking for decoded objects.
//!
//! Nodes live in an arena and refer to their parent by index. A tree is
//! usually rooted at the packet buffer a set of objects was decoded from; every
//! decoded object gets its own child node. Marking a node dirty walks up the
//! parent chain, so a node reports dirty whenever it or anything below it was
//! mutated since decode.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
struct Node {
    parent: Option<usize>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct Arena {
    nodes: Vec<Node>,
}

/// Handle to one node of a tracker tree.
///
/// Cloning the handle does not create a new node; use [`create_child`] for
/// that.
///
/// [`create_child`]: DirtyTracker::create_child
#[derive(Clone)]
pub struct DirtyTracker {
    arena: Arc<Mutex<Arena>>,
    index: usize,
}

impl DirtyTracker {
    /// Creates a new tree and returns its clean root node.
    pub fn root() -> Self {
        let arena = Arena {
            nodes: vec![Node {
                parent: None,
                dirty: false,
            }],
        };
        Self {
            arena: Arc::new(Mutex::new(arena)),
            index: 0,
        }
    }

    fn with_arena<R>(&self, f: impl FnOnce(&mut Arena) -> R) -> R {
        let mut arena = self.arena.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut arena)
    }

    /// Returns a fresh, clean node whose parent is `self`.
    pub fn create_child(&self) -> Self {
        let index = self.with_arena(|arena| {
            arena.nodes.push(Node {
                parent: Some(self.index),
                dirty: false,
            });
            arena.nodes.len() - 1
        });
        Self {
            arena: Arc::clone(&self.arena),
            index,
        }
    }

    /// Flags this node and every ancestor.
    pub fn mark_dirty(&self) {
        self.with_arena(|arena| {
            let mut current = Some(self.index);
            while let Some(index) = current {
                let node = &mut arena.nodes[index];
                // An already dirty node has dirty ancestors.
                if node.dirty {
                    break;
                }
                node.dirty = true;
                current = node.parent;
            }
        });
    }

    pub fn is_dirty(&self) -> bool {
        self.with_arena(|arena| arena.nodes[self.index].dirty)
    }
}

impl fmt::Debug for DirtyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirtyTracker")
            .field("index", &self.index)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
