//! Reactive Primitives
//!
//! The public face of the crate: the engine plus the typed handles that
//! applications hold.
//!
//! - [`Atom`]: a mutable source value.
//! - [`Derivation`]: a lazy, memoized pure computation over other nodes.
//! - [`Reaction`]: a side-effecting observer of one node.
//! - [`Lens`]: a writable bidirectional view into part of another value.
//! - [`Ticker`]: manual control over when accumulated writes propagate.
//!
//! Handles are cheap to clone and reference-counted per node; a node is
//! removed from the graph when its last handle is dropped. All handles are
//! single-threaded, like the engine that issued them.

pub mod atom;
pub mod derivation;
pub mod engine;
pub mod lens;
pub mod reaction;
pub mod ticker;

pub use atom::Atom;
pub use derivation::{Derivable, Derivation};
pub use engine::Engine;
pub use lens::{Lens, Writable};
pub use reaction::{Reaction, Reactor};
pub use ticker::Ticker;
