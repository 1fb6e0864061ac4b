//! Reactive Primitives
//!
//! This module implements the typed surface of the reactive core: cells,
//! computed nodes and sinks, all registered on a session-scoped [`Graph`].
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for externally mutable state. When a cell is read
//! while a computed node or sink is evaluating, the cell is recorded as a
//! dependency of that node. When the cell is written, every transitive
//! dependent is marked dirty.
//!
//! ## Computed Nodes
//!
//! A Computed node is a derived value that caches its result. It re-evaluates
//! only when one of its dependencies changed, and only when it is read again.
//! Failures are cached the same way values are.
//!
//! ## Sinks
//!
//! A Sink is a terminal subscriber producing an artifact for the display
//! layer. It renders when asked (pull) or once the batch that invalidated it
//! settles (push).
//!
//! # Implementation Notes
//!
//! Each graph keeps its own evaluation stack. Reading a source pushes the
//! read into the frame on top of the stack, so dependencies are discovered
//! from what an evaluator actually reads rather than declared up front.

mod context;
mod cell;
mod computed;
mod runtime;
mod sink;

pub use cell::{Cell, CellSpec};
pub use computed::Computed;
pub use runtime::{Graph, Settled, Source};
pub use sink::{Emission, RenderTicket, Sink, Trigger};
