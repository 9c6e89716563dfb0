//! Filament Core
//!
//! This crate implements a reactive value-propagation engine: a directed
//! acyclic graph of mutable sources (atoms), pure derived computations
//! (derivations), and side-effecting observers (reactions). Writing to an
//! atom consistently updates exactly the observers that depend on it, while
//! everything unobserved stays lazy and is eventually pruned from the graph.
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `graph`: the node records, the four-color state machine, and the
//!   topology-only mark/sweep algorithms
//! - `reactive`: the engine, the typed handles (`Atom`, `Derivation`,
//!   `Reaction`, `Lens`), transactions, and tickers
//!
//! # How propagation works
//!
//! Every node carries a color. White means the cached value is current, Red
//! means it changed during the active propagation cycle, Black means it may
//! be stale, and Green means the node is disconnected and must be evaluated
//! from scratch before its value means anything.
//!
//! A write to an atom runs three phases before it returns:
//!
//! 1. **Mark**: descendants that were current are colored Black; reactions
//!    discovered along the way are queued in discovery order.
//! 2. **Notify**: each queued reaction pulls its parent. The pull walks Black
//!    ancestors, re-running a deriving function only when one of its parents
//!    actually changed. The reaction fires only if its parent ended Red.
//! 3. **Sweep**: Red nodes are reconciled back to White; Black nodes that no
//!    reaction pulled are detached from the graph entirely (colored Green),
//!    so branches nobody observes stop being traversed at all.
//!
//! Derivations that are never read never run. Transactions batch several
//! writes into a single cycle with rollback on failure.
//!
//! # Example
//!
//! ```rust
//! use filament_core::{Derivable, Engine, Writable};
//!
//! let engine = Engine::new();
//! let count = engine.atom(1);
//!
//! let doubled = engine.derivation({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//!
//! let _watch = doubled.react(|value: &i32| {
//!     println!("doubled is now {value}");
//! });
//! // prints: "doubled is now 2"
//!
//! count.set(5);
//! // prints: "doubled is now 10"
//! ```

pub mod error;
pub mod graph;
pub mod reactive;

pub use error::Error;
pub use reactive::{
    Atom, Derivable, Derivation, Engine, Lens, Reaction, Reactor, Ticker, Writable,
};
