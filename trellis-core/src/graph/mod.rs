//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between cells, computed nodes and sinks.
//!
//! # Overview
//!
//! The dependency graph is a directed graph where:
//!
//! - Nodes are cells (sources), computed nodes (derivations) or sinks (leaves)
//! - Edges represent reads: if A read B during its last evaluation, there is
//!   an edge from B to A
//!
//! When a batch of cell writes commits, we traverse the graph to find all
//! affected nodes and mark them dirty. Nothing recomputes at that point;
//! dirty nodes re-evaluate when they are next read.
//!
//! # Design Decisions
//!
//! 1. The graph is centralized and owned by one session rather than spread
//!    across handles, which keeps invalidation a single walk and lets several
//!    sessions coexist without shared global state.
//!
//! 2. Nodes are indexed by ID for O(1) lookups.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to enable efficient traversal in both directions. Dependencies carry
//!    the version stamp each source had when it was last read.

mod node;
mod scheduler;

pub use node::{NodeId, NodeKind, NodeState};

pub(crate) use node::{AnyValue, Evaluator, Node, Payload, Validator, ValueType};
pub(crate) use scheduler::Scheduler;
