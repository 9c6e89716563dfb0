//! Propagation Engine
//!
//! The engine is the central coordinator that owns the dependency graph and
//! runs its two halves:
//!
//! - the **pull** half: lazy, memoized evaluation of derivations, driven by
//!   node color and the capture context that records what a deriving
//!   function reads;
//! - the **push** half: the mark/notify/sweep cycle triggered by atom
//!   writes, optionally deferred by a transaction or ticker.
//!
//! # Borrow discipline
//!
//! All graph state lives behind one `RefCell`. User closures (deriving
//! functions, equality functions, reaction bodies, lifecycle hooks) re-enter
//! the engine through the handles they captured, so the core borrow is
//! always released before any user closure runs. Every method here works in
//! short borrow/release steps for that reason.
//!
//! # Reentrancy rules
//!
//! Writing to an atom while a deriving function or reaction body is on the
//! call stack is rejected with [`Error::CyclicWrite`] before any state is
//! touched. A derivation that directly or transitively reads itself panics
//! with [`Error::DependencyCycle`]. A panicking deriving function leaves the
//! derivation Green and disconnected, so a later read simply retries.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::error::Error;
use crate::graph::node::{Color, EqFn, Node, NodeId, Payload, Recipe, Value};
use crate::graph::store::{GraphStore, MarkOutcome};
use crate::reactive::atom::Atom;
use crate::reactive::derivation::Derivation;
use crate::reactive::ticker::Ticker;

/// A propagation engine instance: one dependency graph plus the machinery
/// that keeps it consistent.
///
/// The engine is single-threaded and fully synchronous. It is the sole
/// strong owner of the graph; handles hold weak references, so dropping the
/// last `Engine` clone frees every node.
pub struct Engine {
    core: Rc<RefCell<EngineCore>>,
}

/// One frame of the parent-capture context: the derivation currently being
/// evaluated and the nodes its deriving function has read so far, in order.
struct CaptureFrame {
    node: NodeId,
    reads: IndexSet<NodeId>,
}

/// Pre-write state of an atom staged inside a transaction or ticker window,
/// kept for rollback.
struct StagedWrite {
    value: Value,
    color: Color,
}

pub(crate) struct EngineCore {
    store: GraphStore,
    /// Parent-capture stack; one frame per derivation evaluation in flight.
    capture: Vec<CaptureFrame>,
    /// Nodes currently being resolved on the pull path; guards against
    /// cycles that evaluation frames alone cannot see.
    resolving: IndexSet<NodeId>,
    /// Number of reaction bodies currently executing.
    react_depth: usize,
    /// Reentrant transaction nesting depth.
    txn_depth: usize,
    /// Atoms written inside the open transaction window, with their
    /// pre-window state. Populated only at the outermost level.
    txn_staged: IndexMap<NodeId, StagedWrite>,
    /// Reactions discovered by in-window marking, awaiting commit.
    txn_reactions: IndexSet<NodeId>,
    /// Nodes blackened by in-window marking, with their pre-mark colors,
    /// keyed by node with the earliest color winning. Rollback restores
    /// these so an aborted window leaves no Black residue for the next
    /// cycle's mark to stop at (and its sweep to detach).
    txn_marked: IndexMap<NodeId, Color>,
    /// Derivations evaluated inside the open transaction window. They may
    /// have cached values computed from staged writes, so rollback resets
    /// them rather than trusting their caches.
    txn_evaluated: IndexSet<NodeId>,
    /// Atoms written while a ticker is alive, awaiting the next tick.
    tick_staged: IndexMap<NodeId, StagedWrite>,
    /// Reactions discovered while a ticker is alive, awaiting the next tick.
    tick_reactions: IndexSet<NodeId>,
    /// Pre-mark colors for nodes blackened during the ticker window. Tick
    /// windows never abort on their own, but their pending state can fold
    /// into a transaction that does.
    tick_marked: IndexMap<NodeId, Color>,
    /// Number of live tickers.
    tickers: usize,
    /// Engine-wide default equality, when overridden.
    default_eq: Option<EqFn>,
}

impl Engine {
    /// Create an engine with the default equality policy: values compare
    /// with `PartialEq`, and writes of an equal value are no-ops.
    pub fn new() -> Self {
        Self {
            core: Rc::new(RefCell::new(EngineCore {
                store: GraphStore::new(),
                capture: Vec::new(),
                resolving: IndexSet::new(),
                react_depth: 0,
                txn_depth: 0,
                txn_staged: IndexMap::new(),
                txn_reactions: IndexSet::new(),
                txn_marked: IndexMap::new(),
                txn_evaluated: IndexSet::new(),
                tick_staged: IndexMap::new(),
                tick_reactions: IndexSet::new(),
                tick_marked: IndexMap::new(),
                tickers: 0,
                default_eq: None,
            })),
        }
    }

    /// Create a fresh engine whose nodes default to the given type-erased
    /// equality function instead of `PartialEq`. Existing engines are not
    /// affected. Per-node equality (`atom_with_eq`, `derivation_with_eq`)
    /// still takes precedence.
    pub fn with_equality(eq: impl Fn(&dyn Any, &dyn Any) -> bool + 'static) -> Self {
        let engine = Self::new();
        engine.core.borrow_mut().default_eq = Some(Rc::new(eq));
        engine
    }

    pub(crate) fn from_core(core: Rc<RefCell<EngineCore>>) -> Self {
        Self { core }
    }

    /// Create a mutable source holding `value`.
    pub fn atom<T: Clone + PartialEq + 'static>(&self, value: T) -> Atom<T> {
        let eq = self.equality_for::<T>();
        Atom::from_guard(self.new_node(Node::atom(Rc::new(value), eq)))
    }

    /// Create a mutable source with its own equality function.
    pub fn atom_with_eq<T: Clone + 'static>(
        &self,
        value: T,
        eq: impl Fn(&T, &T) -> bool + 'static,
    ) -> Atom<T> {
        Atom::from_guard(self.new_node(Node::atom(Rc::new(value), erase_eq(eq))))
    }

    /// Create a lazy derived value. The deriving function does not run
    /// until something reads the derivation.
    pub fn derivation<T: Clone + PartialEq + 'static>(
        &self,
        recipe: impl Fn() -> T + 'static,
    ) -> Derivation<T> {
        let eq = self.equality_for::<T>();
        Derivation::from_guard(self.new_node(Node::derivation(erase_recipe(recipe), eq)))
    }

    /// Create a lazy derived value with its own equality function.
    pub fn derivation_with_eq<T: Clone + 'static>(
        &self,
        recipe: impl Fn() -> T + 'static,
        eq: impl Fn(&T, &T) -> bool + 'static,
    ) -> Derivation<T> {
        Derivation::from_guard(self.new_node(Node::derivation(erase_recipe(recipe), erase_eq(eq))))
    }

    /// Run `f` as a transaction: atom writes inside it are staged and
    /// propagated together as one cycle when the outermost `transact`
    /// returns. If `f` panics, every staged write is rolled back to its
    /// pre-transaction value and color before the panic resumes.
    pub fn transact<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = self.begin_txn();
        let out = f();
        guard.commit();
        out
    }

    /// Like [`transact`](Self::transact), but the body is fallible: an
    /// `Err` from the outermost body rolls the window back exactly like a
    /// panic, and the error is returned to the caller.
    pub fn try_transact<R, E>(&self, f: impl FnOnce() -> Result<R, E>) -> Result<R, E> {
        let guard = self.begin_txn();
        match f() {
            Ok(out) => {
                guard.commit();
                Ok(out)
            }
            Err(err) => {
                guard.abort();
                Err(err)
            }
        }
    }

    /// Run `f` inside the current transaction if one is open, otherwise as
    /// its own transaction. Lets reusable functions be transaction-safe
    /// without stacking redundant boundaries.
    pub fn atomically<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.in_transaction() {
            f()
        } else {
            self.transact(f)
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.core.borrow().txn_depth > 0
    }

    /// Create a ticker. While any ticker is alive, plain atom writes
    /// accumulate instead of running reactions; `tick` flushes them as one
    /// combined cycle.
    pub fn ticker(&self) -> Ticker {
        self.core.borrow_mut().tickers += 1;
        Ticker::new(Rc::downgrade(&self.core))
    }

    /// Number of nodes currently in the graph.
    pub fn node_count(&self) -> usize {
        self.core.borrow().store.len()
    }

    // ------------------------------------------------------------------
    // Node construction
    // ------------------------------------------------------------------

    pub(crate) fn new_node(&self, node: Node) -> NodeGuard {
        let kind = node.kind();
        let id = self.core.borrow_mut().store.add(node);
        trace!(node = id.raw(), ?kind, "node created");
        NodeGuard {
            core: Rc::downgrade(&self.core),
            id,
        }
    }

    fn equality_for<T: PartialEq + 'static>(&self) -> EqFn {
        match &self.core.borrow().default_eq {
            Some(eq) => eq.clone(),
            None => Rc::new(|a: &dyn Any, b: &dyn Any| {
                match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }),
        }
    }

    // ------------------------------------------------------------------
    // Pull: resolution and evaluation
    // ------------------------------------------------------------------

    /// Read the value of `id`, resolving it first if needed. A tracked read
    /// inside an active capture frame records `id` as a parent of the
    /// derivation being evaluated.
    pub(crate) fn read_value(&self, id: NodeId, tracked: bool) -> Value {
        if tracked {
            let mut core = self.core.borrow_mut();
            if let Some(frame) = core.capture.last_mut() {
                frame.reads.insert(id);
            }
        }
        self.resolve(id);
        let core = self.core.borrow();
        match &core.store.node(id).payload {
            Payload::Atom { value, .. } => value.clone(),
            Payload::Derivation { value, .. } => value
                .clone()
                .expect("resolved derivation has no cached value"),
            Payload::Reaction(_) => unreachable!("reactions hold no value"),
        }
    }

    /// Ensure `id` ends White or Red, running its deriving function only if
    /// something it depends on actually changed.
    pub(crate) fn resolve(&self, id: NodeId) {
        let (color, is_derivation) = {
            let core = self.core.borrow();
            if core.capture.iter().any(|frame| frame.node == id) {
                drop(core);
                panic!("{}", Error::DependencyCycle);
            }
            let node = core.store.node(id);
            (node.color, matches!(node.payload, Payload::Derivation { .. }))
        };
        if !is_derivation || matches!(color, Color::White | Color::Red) {
            return;
        }

        {
            let mut core = self.core.borrow_mut();
            if !core.resolving.insert(id) {
                drop(core);
                panic!("{}", Error::DependencyCycle);
            }
        }
        let _resolving = ResolveGuard {
            core: &self.core,
            id,
        };

        match color {
            Color::Green => self.evaluate(id),
            Color::Black => {
                let parents: SmallVec<[NodeId; 4]> = {
                    self.core.borrow().store.node(id).parents.iter().copied().collect()
                };
                if parents.iter().any(|&p| self.color_of(p) == Color::Red) {
                    self.evaluate(id);
                    return;
                }
                for &parent in &parents {
                    if matches!(self.color_of(parent), Color::Black | Color::Green) {
                        self.resolve(parent);
                    }
                }
                if parents.iter().any(|&p| self.color_of(p) == Color::Red) {
                    self.evaluate(id);
                } else {
                    // No parent changed, so this value cannot have changed.
                    self.core.borrow_mut().store.set_color(id, Color::White);
                }
            }
            Color::White | Color::Red => {}
        }
    }

    /// Run the deriving function of `id` under a fresh capture frame,
    /// rebuild its parent set from what it read, and recolor by comparing
    /// the fresh value with the cached one.
    fn evaluate(&self, id: NodeId) {
        let recipe: Recipe = {
            let mut core = self.core.borrow_mut();
            if core.capture.iter().any(|frame| frame.node == id) {
                drop(core);
                panic!("{}", Error::DependencyCycle);
            }
            core.store.unlink_parents(id);
            core.capture.push(CaptureFrame {
                node: id,
                reads: IndexSet::new(),
            });
            match &core.store.node(id).payload {
                Payload::Derivation { recipe, .. } => recipe.clone(),
                _ => unreachable!("only derivations are evaluated"),
            }
        };

        trace!(node = id.raw(), "evaluating derivation");
        let eval = EvalGuard {
            core: &self.core,
            id,
            armed: Cell::new(true),
        };
        let value = recipe();
        eval.disarm();

        let (old, eq) = {
            let mut core = self.core.borrow_mut();
            let frame = core.capture.pop().expect("capture stack underflow");
            debug_assert_eq!(frame.node, id, "capture frame mismatch");
            for &parent in &frame.reads {
                core.store.link(parent, id);
            }
            match &core.store.node(id).payload {
                Payload::Derivation { value, eq, .. } => (value.clone(), eq.clone()),
                _ => unreachable!(),
            }
        };

        let unchanged = match &old {
            Some(old) => eq(&**old, &*value),
            None => false,
        };

        let mut core = self.core.borrow_mut();
        if unchanged {
            // Keep the previous value so downstream equality checks see
            // the identical cached result.
            core.store.set_color(id, Color::White);
        } else {
            core.store.set_color(id, Color::Red);
            if let Payload::Derivation { value: slot, .. } = &mut core.store.node_mut(id).payload {
                *slot = Some(value);
            }
        }
        if core.txn_depth > 0 {
            core.txn_evaluated.insert(id);
        }
        trace!(node = id.raw(), changed = !unchanged, "derivation evaluated");
    }

    fn color_of(&self, id: NodeId) -> Color {
        self.core.borrow().store.node(id).color
    }

    // ------------------------------------------------------------------
    // Push: writes and propagation
    // ------------------------------------------------------------------

    /// Write a new value into an atom. Equal values are ignored. The write
    /// propagates immediately unless a transaction or ticker is open, in
    /// which case the notify and sweep phases are deferred to the end of
    /// the window. Deferred writes still mark their descendants right away,
    /// so reads inside the window stay self-consistent with the staged
    /// values.
    pub(crate) fn write_value(&self, id: NodeId, value: Value) -> Result<(), Error> {
        let (current, eq) = {
            let core = self.core.borrow();
            if !core.capture.is_empty() || core.react_depth > 0 {
                return Err(Error::CyclicWrite);
            }
            match &core.store.node(id).payload {
                Payload::Atom { value, eq } => (value.clone(), eq.clone()),
                _ => unreachable!("only atoms are written"),
            }
        };
        if eq(&*current, &*value) {
            trace!(node = id.raw(), "write ignored by equality");
            return Ok(());
        }

        let propagate = {
            let mut core = self.core.borrow_mut();
            let deferred = core.txn_depth > 0 || core.tickers > 0;
            if deferred {
                let staged = StagedWrite {
                    value: current,
                    color: core.store.node(id).color,
                };
                let buffer = if core.txn_depth > 0 {
                    &mut core.txn_staged
                } else {
                    &mut core.tick_staged
                };
                // Only the first write in a window records the pre-state.
                buffer.entry(id).or_insert(staged);
            }
            if let Payload::Atom { value: slot, .. } = &mut core.store.node_mut(id).payload {
                *slot = value;
            }
            core.store.set_color(id, Color::Red);
            if deferred {
                let MarkOutcome { reactions, blackened } = core.store.mark(&[id]);
                if core.txn_depth > 0 {
                    core.txn_reactions.extend(reactions);
                    for (node, prior) in blackened {
                        core.txn_marked.entry(node).or_insert(prior);
                    }
                } else {
                    core.tick_reactions.extend(reactions);
                    for (node, prior) in blackened {
                        core.tick_marked.entry(node).or_insert(prior);
                    }
                }
            }
            !deferred
        };

        if propagate {
            self.propagate(&[id]);
        }
        Ok(())
    }

    /// One full propagation cycle from the given written atoms: mark,
    /// notify, sweep.
    fn propagate(&self, sources: &[NodeId]) {
        let queue = self.core.borrow_mut().store.mark(sources).reactions;
        self.run_cycle(sources, queue);
    }

    /// The notify and sweep phases, over an already-marked graph. If a
    /// reaction panics, the remaining reactions are still notified and the
    /// sweep still runs; the first panic then resumes to the caller.
    fn run_cycle(&self, sources: &[NodeId], queue: Vec<NodeId>) {
        trace!(
            sources = sources.len(),
            reactions = queue.len(),
            "propagation cycle"
        );

        let mut panics: Vec<Box<dyn Any + Send>> = Vec::new();
        for reaction in queue {
            let Some((parent, active)) = ({
                let core = self.core.borrow();
                core.store.get(reaction).and_then(|node| match &node.payload {
                    Payload::Reaction(state) => Some((state.parent, state.active)),
                    _ => None,
                })
            }) else {
                continue;
            };
            if !active {
                continue;
            }

            self.resolve(parent);
            if self.color_of(parent) != Color::Red {
                // The parent settled White: nothing this reaction can see
                // has changed.
                continue;
            }

            if let Err(payload) = self.fire_reaction(reaction, parent, true) {
                error!(
                    reaction = reaction.raw(),
                    "reaction panicked during notify; continuing with remaining reactions"
                );
                panics.push(payload);
            }
        }

        {
            let mut core = self.core.borrow_mut();
            for &source in sources {
                core.store.sweep(source);
            }
        }

        if let Some(first) = panics.into_iter().next() {
            resume_unwind(first);
        }
    }

    /// Invoke a reaction's body with its parent's current value. With
    /// `contain` set, a panic is returned instead of unwinding.
    fn fire_reaction(
        &self,
        reaction: NodeId,
        parent: NodeId,
        contain: bool,
    ) -> Result<(), Box<dyn Any + Send>> {
        let (value, reactor) = {
            let core = self.core.borrow();
            let value = match &core.store.node(parent).payload {
                Payload::Atom { value, .. } => value.clone(),
                Payload::Derivation { value, .. } => {
                    value.clone().expect("red derivation has no cached value")
                }
                Payload::Reaction(_) => unreachable!("reactions cannot be parents"),
            };
            let reactor = match &core.store.node(reaction).payload {
                Payload::Reaction(state) => state.reactor.clone(),
                _ => unreachable!(),
            };
            (value, reactor)
        };

        let run = || {
            self.core.borrow_mut().react_depth += 1;
            let _depth = ReactDepthGuard(&self.core);
            reactor.borrow_mut().react(&*value);
        };
        if contain {
            catch_unwind(AssertUnwindSafe(run))
        } else {
            run();
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Transactions and tickers
    // ------------------------------------------------------------------

    fn begin_txn(&self) -> TxnGuard<'_> {
        let outermost = {
            let mut core = self.core.borrow_mut();
            core.txn_depth += 1;
            core.txn_depth == 1
        };
        TxnGuard {
            engine: self,
            outermost,
            done: Cell::new(false),
        }
    }

    fn commit_txn(&self) {
        let (sources, queue): (SmallVec<[NodeId; 4]>, Vec<NodeId>) = {
            let mut core = self.core.borrow_mut();
            core.txn_depth -= 1;
            if core.txn_depth > 0 {
                return;
            }
            core.txn_evaluated.clear();
            let staged = std::mem::take(&mut core.txn_staged);
            let reactions = std::mem::take(&mut core.txn_reactions);
            let marked = std::mem::take(&mut core.txn_marked);
            if core.tickers > 0 {
                // A live ticker takes over the pending writes; the earliest
                // recorded pre-state wins.
                for (id, prev) in staged {
                    core.tick_staged.entry(id).or_insert(prev);
                }
                core.tick_reactions.extend(reactions);
                for (node, prior) in marked {
                    core.tick_marked.entry(node).or_insert(prior);
                }
                return;
            }
            (staged.keys().copied().collect(), reactions.into_iter().collect())
        };
        if !sources.is_empty() {
            self.run_cycle(&sources, queue);
        }
    }

    fn abort_txn(&self, outermost: bool) {
        let mut core = self.core.borrow_mut();
        core.txn_depth -= 1;
        if !outermost {
            // Pre-states are only recorded by the outermost window; the
            // error keeps unwinding until that boundary rolls back.
            return;
        }
        let staged = std::mem::take(&mut core.txn_staged);
        let marked = std::mem::take(&mut core.txn_marked);
        let evaluated = std::mem::take(&mut core.txn_evaluated);
        core.txn_reactions.clear();
        if !staged.is_empty() {
            debug!(atoms = staged.len(), "transaction aborted; rolling back");
        }
        for (id, prev) in staged {
            if let Some(node) = core.store.get_mut(id) {
                if let Payload::Atom { value, .. } = &mut node.payload {
                    *value = prev.value;
                }
            }
            core.store.set_color(id, prev.color);
        }
        // Undo the in-window marks. A node left Black by an aborted window
        // would stop the next cycle's mark and be detached by its sweep,
        // severing the chain for good.
        for (id, prior) in marked {
            if core.store.get(id).is_some() {
                core.store.set_color(id, prior);
            }
        }
        // Derivations that ran inside the window cached values computed
        // from the rolled-back writes; disconnect them so the next read
        // recomputes from the restored state.
        for id in evaluated {
            core.store.reset(id);
        }
    }

    /// Flush writes accumulated while tickers are alive. Called by
    /// `Ticker::tick` and when the last ticker is released. Inside an open
    /// transaction the pending writes fold into the transaction window
    /// instead.
    pub(crate) fn flush_pending(&self) {
        let (sources, queue): (SmallVec<[NodeId; 4]>, Vec<NodeId>) = {
            let mut core = self.core.borrow_mut();
            let staged = std::mem::take(&mut core.tick_staged);
            let reactions = std::mem::take(&mut core.tick_reactions);
            let marked = std::mem::take(&mut core.tick_marked);
            if core.txn_depth > 0 {
                for (id, prev) in staged {
                    core.txn_staged.entry(id).or_insert(prev);
                }
                core.txn_reactions.extend(reactions);
                for (node, prior) in marked {
                    core.txn_marked.entry(node).or_insert(prior);
                }
                return;
            }
            (staged.keys().copied().collect(), reactions.into_iter().collect())
        };
        if !sources.is_empty() {
            self.run_cycle(&sources, queue);
        }
    }

    pub(crate) fn release_ticker(&self) {
        let flush = {
            let mut core = self.core.borrow_mut();
            core.tickers -= 1;
            core.tickers == 0 && !core.tick_staged.is_empty()
        };
        if flush {
            self.flush_pending();
        }
    }

    // ------------------------------------------------------------------
    // Reaction lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn start_reaction(&self, id: NodeId) {
        let (parent, reactor) = {
            let mut core = self.core.borrow_mut();
            let started = match core.store.get_mut(id).map(|node| &mut node.payload) {
                Some(Payload::Reaction(state)) if !state.active => {
                    state.active = true;
                    Some((state.parent, state.reactor.clone()))
                }
                _ => None,
            };
            let Some((parent, reactor)) = started else {
                return;
            };
            core.store.link(parent, id);
            (parent, reactor)
        };
        debug!(reaction = id.raw(), "reaction started");
        self.resolve(parent);
        reactor.borrow_mut().on_start();
    }

    pub(crate) fn stop_reaction(&self, id: NodeId) {
        let (reactor, owned) = {
            let mut core = self.core.borrow_mut();
            let stopped = match core.store.get_mut(id).map(|node| &mut node.payload) {
                Some(Payload::Reaction(state)) if state.active => {
                    state.active = false;
                    Some((state.reactor.clone(), state.owned.clone()))
                }
                _ => None,
            };
            let Some((reactor, owned)) = stopped else {
                return;
            };
            core.store.unlink_parents(id);
            (reactor, owned)
        };
        debug!(reaction = id.raw(), "reaction stopped");
        reactor.borrow_mut().on_stop();
        // Stopping an active owner force-stops the reactions it adopted.
        for child in owned {
            if self.reaction_active(child) {
                self.stop_reaction(child);
            }
        }
    }

    pub(crate) fn force_reaction(&self, id: NodeId) {
        let parent = {
            let core = self.core.borrow();
            match core.store.get(id).map(|node| &node.payload) {
                Some(Payload::Reaction(state)) => state.parent,
                _ => return,
            }
        };
        // Use the cached value when one exists so colors stay untouched; a
        // never-evaluated parent needs one untracked pull first.
        let cached = {
            let core = self.core.borrow();
            match &core.store.node(parent).payload {
                Payload::Atom { value, .. } => Some(value.clone()),
                Payload::Derivation { value, .. } => value.clone(),
                Payload::Reaction(_) => None,
            }
        };
        if cached.is_none() {
            self.read_value(parent, false);
        }
        if let Err(payload) = self.fire_reaction(id, parent, false) {
            resume_unwind(payload);
        }
    }

    pub(crate) fn reaction_active(&self, id: NodeId) -> bool {
        let core = self.core.borrow();
        matches!(
            core.store.get(id).map(|node| &node.payload),
            Some(Payload::Reaction(state)) if state.active
        )
    }

    pub(crate) fn adopt_reaction(&self, owner: NodeId, child: NodeId) {
        let mut core = self.core.borrow_mut();
        let child_active = matches!(
            core.store.get(child).map(|node| &node.payload),
            Some(Payload::Reaction(state)) if state.active
        );
        if !child_active || owner == child {
            return;
        }
        let previous = match core.store.get_mut(child).map(|node| &mut node.payload) {
            Some(Payload::Reaction(state)) => state.owner.replace(owner),
            _ => return,
        };
        if let Some(previous) = previous.filter(|&previous| previous != owner) {
            if let Some(Payload::Reaction(state)) =
                core.store.get_mut(previous).map(|node| &mut node.payload)
            {
                state.owned.retain(|id| *id != child);
            }
        }
        if let Some(Payload::Reaction(state)) = core.store.get_mut(owner).map(|node| &mut node.payload)
        {
            if !state.owned.contains(&child) {
                state.owned.push(child);
            }
        }
    }

    pub(crate) fn orphan_reaction(&self, id: NodeId) {
        let mut core = self.core.borrow_mut();
        let owner = match core.store.get_mut(id).map(|node| &mut node.payload) {
            Some(Payload::Reaction(state)) => state.owner.take(),
            _ => None,
        };
        if let Some(owner) = owner {
            if let Some(Payload::Reaction(state)) =
                core.store.get_mut(owner).map(|node| &mut node.payload)
            {
                state.owned.retain(|child| *child != id);
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("node_count", &self.node_count())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl EngineCore {
    /// Drop one external handle to `id`, removing the node when the last
    /// handle goes away. The payload is dropped outside the core borrow so
    /// that handles captured by its closures can release recursively.
    fn release(core: &Rc<RefCell<EngineCore>>, id: NodeId) {
        let payload = {
            let mut inner = core.borrow_mut();
            let Some(node) = inner.store.get_mut(id) else {
                return;
            };
            node.handles -= 1;
            if node.handles > 0 {
                return;
            }
            trace!(node = id.raw(), "last handle dropped; removing node");
            inner.store.remove(id).map(|node| node.payload)
        };
        drop(payload);
    }
}

/// An external reference to one node: a weak engine pointer plus the node
/// ID. Cloning and dropping guards maintains the node's handle count.
pub(crate) struct NodeGuard {
    core: Weak<RefCell<EngineCore>>,
    id: NodeId,
}

impl NodeGuard {
    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    /// The owning engine. Handles are only usable while their engine is
    /// alive; the engine is the sole strong owner of the graph.
    pub(crate) fn engine(&self) -> Engine {
        Engine::from_core(
            self.core
                .upgrade()
                .expect("engine dropped while a handle was still in use"),
        )
    }

    /// Handle count of the node, while the engine is alive.
    pub(crate) fn handle_count(&self) -> Option<usize> {
        let core = self.core.upgrade()?;
        let count = core.borrow().store.get(self.id).map(|node| node.handles);
        count
    }
}

impl Clone for NodeGuard {
    fn clone(&self) -> Self {
        if let Some(core) = self.core.upgrade() {
            if let Some(node) = core.borrow_mut().store.get_mut(self.id) {
                node.handles += 1;
            }
        }
        Self {
            core: self.core.clone(),
            id: self.id,
        }
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            EngineCore::release(&core, self.id);
        }
    }
}

/// Pops the capture frame and disconnects the derivation if its deriving
/// function panics, so a later read retries from scratch.
struct EvalGuard<'a> {
    core: &'a Rc<RefCell<EngineCore>>,
    id: NodeId,
    armed: Cell<bool>,
}

impl EvalGuard<'_> {
    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for EvalGuard<'_> {
    fn drop(&mut self) {
        if !self.armed.get() {
            return;
        }
        let mut core = self.core.borrow_mut();
        if core.capture.last().map(|frame| frame.node) == Some(self.id) {
            core.capture.pop();
        }
        // Parent links were already discarded before the recipe ran.
        core.store.set_color(self.id, Color::Green);
    }
}

/// Removes a node from the resolving set when the resolution walk leaves
/// it, including during unwinding.
struct ResolveGuard<'a> {
    core: &'a Rc<RefCell<EngineCore>>,
    id: NodeId,
}

impl Drop for ResolveGuard<'_> {
    fn drop(&mut self) {
        self.core.borrow_mut().resolving.swap_remove(&self.id);
    }
}

/// Decrements the reaction depth counter when a reaction body returns or
/// unwinds.
struct ReactDepthGuard<'a>(&'a Rc<RefCell<EngineCore>>);

impl Drop for ReactDepthGuard<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().react_depth -= 1;
    }
}

/// Commits or rolls back a transaction window; unwinding through the guard
/// aborts the window.
struct TxnGuard<'a> {
    engine: &'a Engine,
    outermost: bool,
    done: Cell<bool>,
}

impl TxnGuard<'_> {
    fn commit(self) {
        self.done.set(true);
        self.engine.commit_txn();
    }

    fn abort(self) {
        self.done.set(true);
        self.engine.abort_txn(self.outermost);
    }
}

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        if !self.done.get() {
            self.engine.abort_txn(self.outermost);
        }
    }
}

fn erase_eq<T: 'static>(eq: impl Fn(&T, &T) -> bool + 'static) -> EqFn {
    Rc::new(move |a: &dyn Any, b: &dyn Any| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => eq(a, b),
            _ => false,
        }
    })
}

fn erase_recipe<T: 'static>(recipe: impl Fn() -> T + 'static) -> Recipe {
    Rc::new(move || Rc::new(recipe()) as Value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Derivable, Writable};

    #[test]
    fn engine_starts_empty() {
        let engine = Engine::new();
        assert_eq!(engine.node_count(), 0);
        assert!(!engine.in_transaction());
    }

    #[test]
    fn nodes_are_pruned_when_handles_drop() {
        let engine = Engine::new();
        let a = engine.atom(1);
        let b = a.clone();
        assert_eq!(engine.node_count(), 1);

        drop(a);
        assert_eq!(engine.node_count(), 1);
        drop(b);
        assert_eq!(engine.node_count(), 0);
    }

    #[test]
    fn dropping_a_derivation_releases_captured_handles() {
        let engine = Engine::new();
        let a = engine.atom(1);
        let d = engine.derivation({
            let a = a.clone();
            move || a.get() + 1
        });
        assert_eq!(d.get(), 2);
        assert_eq!(engine.node_count(), 2);

        // The derivation's recipe holds a clone of `a`; dropping the
        // external atom handle alone must not remove the atom.
        drop(a);
        assert_eq!(engine.node_count(), 2);
        drop(d);
        assert_eq!(engine.node_count(), 0);
    }

    #[test]
    fn in_transaction_reflects_nesting() {
        let engine = Engine::new();
        engine.transact(|| {
            assert!(engine.in_transaction());
            engine.transact(|| assert!(engine.in_transaction()));
            assert!(engine.in_transaction());
        });
        assert!(!engine.in_transaction());
    }

    #[test]
    fn atomically_joins_an_open_transaction() {
        let engine = Engine::new();
        let a = engine.atom(0);
        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let _r = {
            let fired = fired.clone();
            a.react(move |_: &i32| fired.set(fired.get() + 1))
        };
        assert_eq!(fired.get(), 1);

        engine.transact(|| {
            engine.atomically(|| a.set(1));
            engine.atomically(|| a.set(2));
        });
        // One combined propagation, not one per atomically block.
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn custom_engine_equality_applies_to_new_nodes() {
        // Never-equal engine: every write propagates, even of equal values.
        let engine = Engine::with_equality(|_, _| false);
        let a = engine.atom(1);
        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let _r = {
            let fired = fired.clone();
            a.react(move |_: &i32| fired.set(fired.get() + 1))
        };
        assert_eq!(fired.get(), 1);

        a.set(1);
        assert_eq!(fired.get(), 2);
    }
}
