//! Graph Nodes
//!
//! This module defines the node records that live in the dependency graph:
//! the unique node identifier, the four-color lifecycle, and the closed set
//! of payloads a node can carry.
//!
//! # Colors
//!
//! Every node is in exactly one of four states:
//!
//! - **Green**: disconnected. The node has no parent links and must be fully
//!   evaluated before its value means anything. Derivations start here.
//! - **White**: the cached value is current.
//! - **Red**: the cached value is current and changed during the active
//!   propagation cycle.
//! - **Black**: the cached value may be stale; the truth is unknown until
//!   the node's parents have been checked.
//!
//! Atoms are never Green or Black; they only move between White and Red.
//! Reaction nodes keep their construction color — the mark and sweep phases
//! switch on the payload kind and never recolor or detach them.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::reactive::reaction::ErasedReactor;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A mutable source. Roots of the graph: no parents, only children.
    Atom,

    /// A memoized pure computation over upstream nodes. Lens reads are
    /// derivations as well; the lens write path lives outside the graph.
    Derivation,

    /// A side-effecting observer of exactly one upstream node. Leaves of
    /// the graph: never read by anything.
    Reaction,
}

/// Lifecycle color of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Disconnected; must be (re)evaluated before the value means anything.
    Green,

    /// The cached value is current.
    White,

    /// The cached value changed during the active propagation cycle.
    Red,

    /// The cached value may be stale; parents must be checked.
    Black,
}

impl Color {
    /// Whether moving from `from` to `to` is a legal lifecycle transition.
    ///
    /// Staying in place is always legal. The directed transitions are:
    /// Green→White and Green→Red (evaluation), White→Black and Red→Black
    /// (marking), Black→White and Black→Red (re-evaluation), Black→Green
    /// (sweep detachment), Red→White (sweep reconciliation), and White→Red
    /// (an atom write).
    pub fn transition_allowed(from: Color, to: Color) -> bool {
        use Color::{Black, Green, Red, White};
        matches!(
            (from, to),
            (Green, White)
                | (Green, Red)
                | (White, Black)
                | (Red, Black)
                | (Black, White)
                | (Black, Red)
                | (Black, Green)
                | (Red, White)
                | (White, Red)
        ) || from == to
    }
}

/// A type-erased node value.
pub(crate) type Value = Rc<dyn Any>;

/// A type-erased equality function over node values.
pub(crate) type EqFn = Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>;

/// A type-erased deriving function.
pub(crate) type Recipe = Rc<dyn Fn() -> Value>;

/// Kind-specific state carried by a node.
pub(crate) enum Payload {
    Atom {
        value: Value,
        eq: EqFn,
    },
    Derivation {
        /// Cached result of the last evaluation. `None` until the recipe
        /// has run at least once.
        value: Option<Value>,
        recipe: Recipe,
        eq: EqFn,
    },
    Reaction(ReactionState),
}

/// Mutable state of a reaction node.
pub(crate) struct ReactionState {
    /// The single upstream node, fixed at construction.
    pub parent: NodeId,
    pub active: bool,
    pub reactor: Rc<RefCell<dyn ErasedReactor>>,
    /// Reaction that adopted this one, if any.
    pub owner: Option<NodeId>,
    /// Reactions this one has adopted.
    pub owned: SmallVec<[NodeId; 2]>,
    /// Clone of the parent handle, so the upstream chain stays alive for
    /// as long as the reaction node does.
    #[allow(dead_code)]
    pub keepalive: Box<dyn Any>,
}

/// A node in the dependency graph.
pub(crate) struct Node {
    pub color: Color,
    /// Nodes this node read during its last evaluation, in read order.
    pub parents: IndexSet<NodeId>,
    /// Nodes that read this node, in the order the links were established.
    /// Non-owning back-references: used only for traversal, rebuilt on
    /// every evaluation of the child.
    pub children: IndexSet<NodeId>,
    /// Number of live external handles pointing at this node. The node is
    /// removed from the arena when this reaches zero.
    pub handles: usize,
    pub payload: Payload,
}

impl Node {
    /// Create an atom node. Atoms start White with the given value.
    pub(crate) fn atom(value: Value, eq: EqFn) -> Self {
        Self {
            color: Color::White,
            parents: IndexSet::new(),
            children: IndexSet::new(),
            handles: 1,
            payload: Payload::Atom { value, eq },
        }
    }

    /// Create a derivation node. Derivations start Green and disconnected.
    pub(crate) fn derivation(recipe: Recipe, eq: EqFn) -> Self {
        Self {
            color: Color::Green,
            parents: IndexSet::new(),
            children: IndexSet::new(),
            handles: 1,
            payload: Payload::Derivation {
                value: None,
                recipe,
                eq,
            },
        }
    }

    /// Create a reaction node. Reactions start Green and inactive.
    pub(crate) fn reaction(state: ReactionState) -> Self {
        Self {
            color: Color::Green,
            parents: IndexSet::new(),
            children: IndexSet::new(),
            handles: 1,
            payload: Payload::Reaction(state),
        }
    }

    pub(crate) fn kind(&self) -> NodeKind {
        match self.payload {
            Payload::Atom { .. } => NodeKind::Atom,
            Payload::Derivation { .. } => NodeKind::Derivation,
            Payload::Reaction(_) => NodeKind::Reaction,
        }
    }

    pub(crate) fn is_reaction(&self) -> bool {
        matches!(self.payload, Payload::Reaction(_))
    }
}
