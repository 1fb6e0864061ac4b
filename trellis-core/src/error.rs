//! Error Types
//!
//! Every fallible operation on the graph returns [`ReactiveError`]. The enum is
//! `Clone` because evaluation failures are cached on the node that produced
//! them and handed out again to every later reader.

use std::sync::Arc;

use thiserror::Error;

/// Boxed error accepted from user evaluators and render functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared, cloneable error source.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Result alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

/// Errors produced by the reactive core.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A cell write violated the cell's declared type or constraints.
    /// The cell is left untouched.
    #[error("invalid input for cell `{cell}`: {reason}")]
    InvalidInput { cell: String, reason: String },

    /// Evaluating a node re-entered that same node before it completed.
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// An evaluator or render function failed. `node` is where the failure
    /// was first captured; readers further downstream see the same value.
    #[error("evaluation of `{node}` failed: {source}")]
    Evaluation {
        node: String,
        #[source]
        source: SharedError,
    },

    /// A tracked read was requested with no evaluation in progress.
    #[error("`{node}` was read outside of any tracking evaluation")]
    StaleRead { node: String },

    #[error("no node registered as `{0}`")]
    UnknownNode(String),

    #[error("`{0}` is already registered")]
    DuplicateId(String),

    #[error("`{node}` holds `{actual}`, not `{expected}`")]
    TypeMismatch {
        node: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A sink was used where a readable source is required.
    #[error("`{0}` is a sink and cannot be read as a source")]
    NotASource(String),

    #[error("cell `{cell}` cannot be written while `{node}` is evaluating")]
    WriteDuringEvaluation { cell: String, node: String },

    #[error("batches cannot be opened or closed while `{node}` is evaluating")]
    BatchDuringEvaluation { node: String },

    #[error("end_batch called with no open batch")]
    NoOpenBatch,

    #[error("evaluation nested deeper than {0} levels")]
    DepthExceeded(usize),

    /// Raw failure raised by user code; attributed to a node once captured.
    #[error("{0}")]
    Failed(SharedError),
}

impl ReactiveError {
    /// Build a failure from anything convertible into a boxed error,
    /// including plain strings.
    ///
    /// ```
    /// use trellis_core::ReactiveError;
    ///
    /// let err = ReactiveError::failed("bin count must be at least 2");
    /// assert_eq!(err.to_string(), "bin count must be at least 2");
    /// ```
    pub fn failed(error: impl Into<BoxError>) -> Self {
        Self::Failed(Arc::from(error.into()))
    }

    /// Whether this error must not be cached on the node that saw it.
    pub(crate) fn is_structural(&self) -> bool {
        matches!(self, Self::Cycle { .. } | Self::DepthExceeded(_))
    }

    /// Attribute a failure to the node whose evaluation produced it.
    ///
    /// Failures already attributed upstream pass through unchanged.
    pub(crate) fn attribute(self, node: &str) -> Self {
        match self {
            Self::Failed(source) => Self::Evaluation {
                node: node.to_string(),
                source,
            },
            err @ Self::Evaluation { .. } => err,
            other => Self::Evaluation {
                node: node.to_string(),
                source: Arc::new(other),
            },
        }
    }

    /// The node a captured failure originated from, if any.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::Evaluation { node, .. } => Some(node),
            _ => None,
        }
    }
}
