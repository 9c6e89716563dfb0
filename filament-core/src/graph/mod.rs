//! Dependency Graph
//!
//! This module defines the node records that live in the dependency graph
//! and the topology-only algorithms that run over them: edge upkeep, the
//! mark phase, and the sweep phase. Values and user closures never appear
//! here; those belong to the `reactive` module.

pub mod node;
pub mod store;

pub use node::{Color, NodeId, NodeKind};
