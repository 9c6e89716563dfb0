//! Error types for the propagation engine.
//!
//! Only operations that reject misuse surface an error value; a panicking
//! deriving function or reaction body unwinds through the engine with the
//! graph left in a consistent state (see the module docs on `reactive`).

use thiserror::Error;

/// Errors produced by graph operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// An atom write was attempted while a deriving function or a reaction
    /// body was executing on the call stack. The write is rejected before
    /// any state is touched.
    #[error("atom written while a derivation or reaction is executing")]
    CyclicWrite,

    /// A derivation directly or transitively read itself during evaluation.
    #[error("dependency cycle detected while evaluating a derivation")]
    DependencyCycle,
}
