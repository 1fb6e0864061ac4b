//! Trellis Core
//!
//! This crate provides the reactive computation core behind Trellis
//! dashboards. It implements:
//!
//! - Cells: named, validated, externally mutable values
//! - Computed nodes: memoized derivations with dynamic dependency tracking
//! - Sinks: renderers that turn sources into artifacts, on request or on change
//! - A scheduler that batches writes and invalidates each dependent once
//!
//! The core never renders, loads data or lays out controls. Those belong to
//! the functions and values callers register with it.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: node storage, version stamps, batching and dirty marking
//! - `reactive`: the typed handles and the [`Graph`] entry point
//! - `session`: a thread-safe wrapper serializing access to one graph
//! - `config`: [`GraphConfig`], loadable from JSON
//! - `snapshot`: serializable views of the graph for debugging
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{CellSpec, Graph};
//!
//! let graph = Graph::new();
//!
//! let attribute = graph
//!     .define_cell(CellSpec::new("attribute", "bill_length_mm".to_string()).one_of([
//!         "bill_length_mm".to_string(),
//!         "flipper_length_mm".to_string(),
//!     ]))
//!     .unwrap();
//! let bins = graph
//!     .define_cell(CellSpec::new("bins", 20_i64).between(2, 100))
//!     .unwrap();
//!
//! let histogram = graph
//!     .define_sink("histogram", [attribute.id(), bins.id()], move |g| {
//!         Ok(format!("{} in {} bins", g.get(&attribute)?, g.get(&bins)?))
//!     })
//!     .unwrap();
//!
//! assert_eq!(graph.render(&histogram).unwrap(), "bill_length_mm in 20 bins");
//!
//! graph.set(&bins, 30).unwrap();
//! assert_eq!(graph.render(&histogram).unwrap(), "bill_length_mm in 30 bins");
//!
//! // Out-of-range writes are rejected and leave the cell untouched.
//! assert!(graph.set(&bins, 0).is_err());
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod session;
pub mod snapshot;

pub use config::{ConfigError, GraphConfig};
pub use error::{BoxError, ReactiveError, Result, SharedError};
pub use graph::{NodeId, NodeKind, NodeState};
pub use reactive::{
    Cell, CellSpec, Computed, Emission, Graph, RenderTicket, Settled, Sink, Source, Trigger,
};
pub use session::Session;
pub use snapshot::{GraphSnapshot, NodeSnapshot};
