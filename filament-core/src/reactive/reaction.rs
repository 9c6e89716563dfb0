//! Reactions: side effects at the edge of the graph.
//!
//! A reaction observes exactly one node and runs a user-supplied body
//! whenever a propagation cycle changes that node's value. Reactions are
//! leaves: nothing reads them, and the mark phase queues them for
//! notification instead of recoloring them.

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::graph::node::{Node, ReactionState};
use crate::reactive::derivation::Derivable;
use crate::reactive::engine::NodeGuard;

/// The body of a reaction, with optional lifecycle hooks.
///
/// Any `FnMut(&T)` closure is a `Reactor` with no-op hooks; implement the
/// trait directly when start/stop bookkeeping is needed.
pub trait Reactor<T> {
    /// Called with the observed node's value whenever it changes during a
    /// propagation cycle, and once on [`Reaction::force`].
    fn react(&mut self, value: &T);

    /// Called when the reaction starts observing.
    fn on_start(&mut self) {}

    /// Called when the reaction stops observing.
    fn on_stop(&mut self) {}
}

impl<T, F: FnMut(&T)> Reactor<T> for F {
    fn react(&mut self, value: &T) {
        self(value)
    }
}

/// Object-safe form of [`Reactor`] stored in reaction nodes.
pub(crate) trait ErasedReactor {
    fn react(&mut self, value: &dyn Any);
    fn on_start(&mut self);
    fn on_stop(&mut self);
}

struct Erased<T, R> {
    reactor: R,
    _marker: PhantomData<fn(&T)>,
}

impl<T: 'static, R: Reactor<T>> ErasedReactor for Erased<T, R> {
    fn react(&mut self, value: &dyn Any) {
        if let Some(value) = value.downcast_ref::<T>() {
            self.reactor.react(value);
        }
    }

    fn on_start(&mut self) {
        self.reactor.on_start();
    }

    fn on_stop(&mut self) {
        self.reactor.on_stop();
    }
}

/// Handle to a reaction node.
///
/// Most code obtains one through [`Derivable::react`], which also starts
/// the reaction and runs it once. [`Reaction::new`] builds one in the
/// stopped state for manual lifecycle control. Dropping the last handle to
/// an active reaction stops it and removes its node.
pub struct Reaction {
    guard: NodeGuard,
}

impl Reaction {
    /// Create a stopped reaction observing `source`. It runs nothing until
    /// [`start`](Self::start) is called.
    pub fn new<T, S, R>(source: &S, reactor: R) -> Self
    where
        T: Clone + 'static,
        S: Derivable<T>,
        R: Reactor<T> + 'static,
    {
        let state = ReactionState {
            parent: source.guard().id(),
            active: false,
            reactor: Rc::new(RefCell::new(Erased {
                reactor,
                _marker: PhantomData,
            })),
            owner: None,
            owned: SmallVec::new(),
            keepalive: source.keepalive(),
        };
        let engine = source.guard().engine();
        Self {
            guard: engine.new_node(Node::reaction(state)),
        }
    }

    /// Begin observing. The observed node is brought up to date (so a lazy
    /// chain is connected and evaluated), `on_start` fires, and future
    /// propagation cycles will notify this reaction. Starting an active
    /// reaction is a no-op.
    pub fn start(&self) {
        self.guard.engine().start_reaction(self.guard.id());
    }

    /// Stop observing: the reaction is disconnected from its parent and
    /// `on_stop` fires. Reactions this one adopted are stopped as well.
    /// Stopping an inactive reaction is a no-op.
    pub fn stop(&self) {
        self.guard.engine().stop_reaction(self.guard.id());
    }

    /// Run the body once, immediately, with the observed node's current
    /// value, outside any propagation cycle.
    pub fn force(&self) {
        self.guard.engine().force_reaction(self.guard.id());
    }

    pub fn is_active(&self) -> bool {
        self.guard.engine().reaction_active(self.guard.id())
    }

    /// Tie `child`'s lifecycle to this reaction: when this reaction stops,
    /// `child` is stopped too. A reaction has at most one owner; adopting
    /// an already-owned reaction transfers it.
    pub fn adopt(&self, child: &Reaction) {
        self.guard
            .engine()
            .adopt_reaction(self.guard.id(), child.guard.id());
    }

    /// Detach this reaction from its owner, if it has one.
    pub fn orphan(&self) {
        self.guard.engine().orphan_reaction(self.guard.id());
    }
}

impl Clone for Reaction {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
        }
    }
}

impl Drop for Reaction {
    fn drop(&mut self) {
        // Last handle: run the stop lifecycle before the node goes away.
        if self.guard.handle_count() == Some(1) && self.is_active() {
            self.stop();
        }
    }
}

impl std::fmt::Debug for Reaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaction")
            .field("node", &self.guard.id().raw())
            .finish()
    }
}
