//! Graph Store
//!
//! The store owns every node in the graph, keyed by ID, and implements the
//! algorithms that only need topology and colors: symmetric edge upkeep,
//! the mark phase, and the sweep phase. Anything that touches values or
//! invokes user closures lives in the engine instead.
//!
//! # Mark and sweep
//!
//! A write to an atom triggers two traversals of its descendants:
//!
//! - `mark` colors every currently-consistent (White or Red) descendant
//!   Black and collects the reactions it discovers, in discovery order.
//!   Hitting an already-Black node stops the walk: that subtree was marked
//!   by an earlier write in the same cycle.
//! - `sweep` runs after reactions have been notified. Red nodes reconcile
//!   back to White. A node still Black at sweep time was pulled by nobody,
//!   which means no active reaction depends on it anymore: it is detached
//!   from its parents and reset to Green, so future writes never traverse
//!   into it. Its own children are left to their own sweep or next read.

use std::collections::{HashMap, VecDeque};

use indexmap::IndexSet;
use smallvec::SmallVec;
use tracing::debug;

use super::node::{Color, Node, NodeId};

/// Arena of all nodes in one engine's dependency graph.
pub(crate) struct GraphStore {
    nodes: HashMap<NodeId, Node>,
}

/// What one mark traversal did to the graph.
pub(crate) struct MarkOutcome {
    /// Reactions discovered, in discovery order.
    pub reactions: Vec<NodeId>,
    /// Nodes this traversal recolored Black, with the color each had
    /// before. A deferred write keeps these so an aborted window can put
    /// the colors back.
    pub blackened: Vec<(NodeId, Color)>,
}

impl GraphStore {
    pub(crate) fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Add a node to the graph, returning its fresh ID.
    pub(crate) fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId::new();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node and every edge involving it. Returns the node so the
    /// caller can drop its payload outside any store borrow.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        for parent in &node.parents {
            if let Some(parent) = self.nodes.get_mut(parent) {
                parent.children.shift_remove(&id);
            }
        }
        for child in &node.children {
            if let Some(child) = self.nodes.get_mut(child) {
                child.parents.shift_remove(&id);
            }
        }
        Some(node)
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(&id).expect("node missing from dependency graph")
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(&id).expect("node missing from dependency graph")
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Establish the edge `parent -> child` on both sides.
    pub(crate) fn link(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.insert(child);
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parents.insert(parent);
        }
    }

    /// Drop every parent edge of `id`, on both sides. Called before a
    /// re-evaluation rebuilds the parent set from scratch.
    pub(crate) fn unlink_parents(&mut self, id: NodeId) {
        let parents: SmallVec<[NodeId; 4]> = match self.nodes.get_mut(&id) {
            Some(node) => node.parents.drain(..).collect(),
            None => return,
        };
        for parent in parents {
            if let Some(parent) = self.nodes.get_mut(&parent) {
                parent.children.shift_remove(&id);
            }
        }
    }

    /// Disconnect `id` from its parents and reset it to Green. Its child
    /// links are left in place; each child re-resolves independently the
    /// next time something reads it.
    pub(crate) fn detach(&mut self, id: NodeId) {
        self.unlink_parents(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            debug_assert!(
                Color::transition_allowed(node.color, Color::Green),
                "illegal color transition {:?} -> Green",
                node.color,
            );
            node.color = Color::Green;
        }
    }

    /// Forget everything about `id`'s evaluation state: drop its parent
    /// links and return it to Green regardless of current color. Used by
    /// transaction rollback, which restores state outside the normal
    /// transition protocol.
    pub(crate) fn reset(&mut self, id: NodeId) {
        self.unlink_parents(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.color = Color::Green;
        }
    }

    /// Recolor `id`, asserting the transition is legal.
    pub(crate) fn set_color(&mut self, id: NodeId, color: Color) {
        if let Some(node) = self.nodes.get_mut(&id) {
            debug_assert!(
                Color::transition_allowed(node.color, color),
                "illegal color transition {:?} -> {:?}",
                node.color,
                color,
            );
            node.color = color;
        }
    }

    /// Mark phase: walk the descendants of the written atoms, coloring
    /// consistent nodes Black and collecting reactions in discovery order.
    pub(crate) fn mark(&mut self, sources: &[NodeId]) -> MarkOutcome {
        let mut reactions: IndexSet<NodeId> = IndexSet::new();
        let mut blackened: Vec<(NodeId, Color)> = Vec::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();

        for source in sources {
            if let Some(node) = self.nodes.get(source) {
                queue.extend(node.children.iter().copied());
            }
        }

        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if node.is_reaction() {
                reactions.insert(id);
                continue;
            }
            match node.color {
                Color::White | Color::Red => {
                    blackened.push((id, node.color));
                    node.color = Color::Black;
                    queue.extend(node.children.iter().copied());
                }
                // Already marked by an earlier write in this cycle; its
                // subtree is queued transitively.
                Color::Black => {}
                // Green nodes have no parents and can never be reached here.
                Color::Green => {}
            }
        }

        MarkOutcome {
            reactions: reactions.into_iter().collect(),
            blackened,
        }
    }

    /// Sweep phase: reconcile colors below one written atom and detach the
    /// branches no reaction pulled during the notify phase.
    pub(crate) fn sweep(&mut self, source: NodeId) {
        let mut stack: SmallVec<[NodeId; 16]> = match self.nodes.get_mut(&source) {
            Some(node) => {
                if node.color == Color::Red {
                    node.color = Color::White;
                }
                node.children.iter().rev().copied().collect()
            }
            None => return,
        };

        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if node.is_reaction() {
                continue;
            }
            match node.color {
                // Already consistent; children unaffected.
                Color::White | Color::Green => {}
                Color::Red => {
                    node.color = Color::White;
                    stack.extend(node.children.iter().rev().copied());
                }
                Color::Black => {
                    debug!(node = id.raw(), "detaching unobserved branch");
                    self.detach(id);
                }
            }
        }
    }
}
