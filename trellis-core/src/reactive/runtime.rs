//! Reactive Graph
//!
//! [`Graph`] is the session-scoped object that owns every cell, computed
//! node and sink, together with the scheduler and the evaluation stack.
//! It is the single entry point for registration, reads, writes and batches.
//!
//! # How It Works
//!
//! 1. Cells, computed nodes and sinks are registered on the graph and come
//!    back as typed handles ([`Cell`](super::Cell), [`Computed`](super::Computed),
//!    [`Sink`](super::Sink)).
//!
//! 2. Reading a source while an evaluator runs records it in the evaluator's
//!    frame. When the evaluator returns, those reads become its dependencies.
//!
//! 3. Writing a cell stages the value in a batch. When the outermost batch
//!    closes, the scheduler commits every staged write and marks dependents
//!    dirty; push sinks then render.
//!
//! 4. Dirty computed nodes and pull sinks recompute when they are next read.
//!
//! # Thread Safety
//!
//! A graph is single-threaded: interior state lives in `RefCell`s and the
//! graph is `Send` but not `Sync`. To share one between threads, wrap it in a
//! [`Session`](crate::Session), which serializes the whole
//! mutate-propagate-evaluate cycle behind one lock.

use std::any::type_name;
use std::cell::RefCell;

use tokio::sync::broadcast;
use tracing::debug;

use super::context::EvalStack;
use super::sink::Emission;
use crate::config::{ConfigError, GraphConfig};
use crate::error::{ReactiveError, Result};
use crate::graph::{AnyValue, NodeId, NodeKind, NodeState, Payload, Scheduler, ValueType};

/// A readable reactive source producing values of type `T`.
///
/// Implemented by [`Cell`](super::Cell) and [`Computed`](super::Computed).
pub trait Source<T> {
    /// The graph node backing this source.
    fn node_id(&self) -> NodeId;
}

/// Report returned when a batch closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settled {
    /// False when only an inner level of nested batches closed.
    pub committed: bool,
    /// Cells whose staged writes were committed.
    pub changed: Vec<NodeId>,
    /// Nodes marked dirty, each listed once.
    pub invalidated: Vec<NodeId>,
    /// Push sinks rendered after the batch settled.
    pub rendered: Vec<NodeId>,
}

/// The dependency graph of one session.
pub struct Graph {
    pub(crate) config: GraphConfig,
    pub(crate) scheduler: RefCell<Scheduler>,
    pub(crate) stack: RefCell<EvalStack>,
    pub(crate) emissions: broadcast::Sender<Emission>,
}

impl Graph {
    /// Create an empty graph with the default configuration.
    pub fn new() -> Self {
        Self::build(GraphConfig::default())
    }

    /// Create an empty graph with an explicit configuration, which must pass
    /// [`GraphConfig::validate`].
    pub fn with_config(config: GraphConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: GraphConfig) -> Self {
        let (emissions, _) = broadcast::channel(config.emission_capacity);
        Self {
            config,
            scheduler: RefCell::new(Scheduler::new()),
            stack: RefCell::new(EvalStack::default()),
            emissions,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Subscribe to notifications emitted whenever a push sink renders.
    pub fn subscribe(&self) -> broadcast::Receiver<Emission> {
        self.emissions.subscribe()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read a source.
    ///
    /// Inside an evaluator or render function this records `source` as a
    /// dependency of the node being evaluated. Reading a dirty computed node
    /// re-evaluates it first; a node whose last evaluation failed returns
    /// the cached failure.
    pub fn get<T: Clone + 'static>(&self, source: &impl Source<T>) -> Result<T> {
        let id = source.node_id();
        let value = self.read(id, true)?;
        self.downcast(id, value)
    }

    /// Read a source without recording a dependency.
    pub fn get_untracked<T: Clone + 'static>(&self, source: &impl Source<T>) -> Result<T> {
        let id = source.node_id();
        let value = self.read(id, false)?;
        self.downcast(id, value)
    }

    /// Read a source, requiring an evaluation in progress.
    ///
    /// Fails with [`ReactiveError::StaleRead`] when called from outside any
    /// evaluator, for code that relies on the read being tracked.
    pub fn tracked<T: Clone + 'static>(&self, source: &impl Source<T>) -> Result<T> {
        if !self.stack.borrow().is_active() {
            let node = self.scheduler.borrow().label_of(source.node_id());
            return Err(ReactiveError::StaleRead { node });
        }
        self.get(source)
    }

    pub(crate) fn read(&self, id: NodeId, track: bool) -> Result<AnyValue> {
        let kind = self.scheduler.borrow().node(id)?.kind();
        match kind {
            NodeKind::Sink => {
                let label = self.scheduler.borrow().label_of(id);
                Err(ReactiveError::NotASource(label))
            }
            NodeKind::Cell => {
                if track {
                    self.stack.borrow_mut().track(id);
                }
                self.cell_value(id)
            }
            NodeKind::Computed => {
                if track {
                    self.stack.borrow_mut().track(id);
                }
                self.evaluate(id)
            }
        }
    }

    fn cell_value(&self, id: NodeId) -> Result<AnyValue> {
        let scheduler = self.scheduler.borrow();
        let node = scheduler.node(id)?;
        match &node.payload {
            Payload::Cell(slot) => Ok(slot.value.clone()),
            _ => Err(ReactiveError::TypeMismatch {
                node: node.label().to_string(),
                expected: "cell",
                actual: kind_name(node.kind()),
            }),
        }
    }

    pub(crate) fn downcast<T: Clone + 'static>(&self, id: NodeId, value: AnyValue) -> Result<T> {
        match value.downcast_ref::<T>() {
            Some(value) => Ok(value.clone()),
            None => {
                let scheduler = self.scheduler.borrow();
                let node = scheduler.node(id)?;
                Err(ReactiveError::TypeMismatch {
                    node: node.label().to_string(),
                    expected: type_name::<T>(),
                    actual: node.value_type().name,
                })
            }
        }
    }

    /// Resolve `label` to a node of `kind` producing `value_type`.
    pub(crate) fn lookup_typed(
        &self,
        label: &str,
        kind: NodeKind,
        value_type: ValueType,
    ) -> Result<NodeId> {
        let scheduler = self.scheduler.borrow();
        let id = scheduler.lookup(label)?;
        let node = scheduler.node(id)?;
        if node.kind() != kind {
            return Err(ReactiveError::TypeMismatch {
                node: label.to_string(),
                expected: kind_name(kind),
                actual: kind_name(node.kind()),
            });
        }
        if node.value_type().id != value_type.id {
            return Err(ReactiveError::TypeMismatch {
                node: label.to_string(),
                expected: value_type.name,
                actual: node.value_type().name,
            });
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Open a batch. Batches nest; only the outermost close commits.
    ///
    /// Batch boundaries belong to the caller, so this fails while an
    /// evaluator or render function is running.
    pub fn begin_batch(&self) -> Result<()> {
        self.check_outside_evaluation()?;
        self.scheduler.borrow_mut().open_batch();
        Ok(())
    }

    /// Close a batch. Closing the outermost batch commits every staged
    /// write, marks each affected node dirty once and renders push sinks.
    pub fn end_batch(&self) -> Result<Settled> {
        self.check_outside_evaluation()?;
        let commit = self.scheduler.borrow_mut().close_batch()?;
        let Some(commit) = commit else {
            return Ok(Settled::default());
        };
        debug!(
            changed = commit.changed.len(),
            invalidated = commit.invalidated.len(),
            push = commit.push.len(),
            "batch committed"
        );

        let rendered = self.flush_push(&commit.push);
        Ok(Settled {
            committed: true,
            changed: commit.changed,
            invalidated: commit.invalidated,
            rendered,
        })
    }

    /// Run `f` inside a batch.
    ///
    /// If `f` fails and this call opened the outermost batch, every write
    /// staged in it is discarded and nothing is committed.
    pub fn batch<R>(&self, f: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        let outermost = !self.in_batch();
        self.begin_batch()?;
        match f(self) {
            Ok(value) => {
                self.end_batch()?;
                Ok(value)
            }
            Err(err) => {
                if outermost {
                    let dropped = self.scheduler.borrow_mut().discard_batch();
                    debug!(dropped, error = %err, "batch aborted");
                } else {
                    self.scheduler.borrow_mut().close_batch()?;
                }
                Err(err)
            }
        }
    }

    pub fn in_batch(&self) -> bool {
        self.scheduler.borrow().in_batch()
    }

    fn check_outside_evaluation(&self) -> Result<()> {
        match self.stack.borrow().current() {
            Some(active) => Err(ReactiveError::BatchDuringEvaluation {
                node: self.scheduler.borrow().label_of(active),
            }),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn version(&self, id: NodeId) -> Result<u64> {
        Ok(self.scheduler.borrow().node(id)?.version())
    }

    pub fn state(&self, id: NodeId) -> Result<NodeState> {
        Ok(self.scheduler.borrow().node(id)?.state())
    }

    pub fn kind(&self, id: NodeId) -> Result<NodeKind> {
        Ok(self.scheduler.borrow().node(id)?.kind())
    }

    pub fn label(&self, id: NodeId) -> Result<String> {
        Ok(self.scheduler.borrow().node(id)?.label().to_string())
    }

    /// Sources the node read during its last evaluation.
    pub fn dependencies(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let scheduler = self.scheduler.borrow();
        Ok(scheduler.node(id)?.dependencies().keys().copied().collect())
    }

    /// Nodes that read this node during their last evaluation.
    pub fn dependents(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let scheduler = self.scheduler.borrow();
        Ok(scheduler.node(id)?.dependents().iter().copied().collect())
    }

    pub fn node_count(&self) -> usize {
        self.scheduler.borrow().node_count()
    }

    /// Discard every node. Handles obtained earlier fail with
    /// [`ReactiveError::UnknownNode`] from now on.
    pub fn clear(&self) -> usize {
        let removed = self.scheduler.borrow_mut().clear();
        debug!(removed, "graph cleared");
        removed
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.node_count())
            .field("in_batch", &self.in_batch())
            .field("config", &self.config)
            .finish()
    }
}

pub(crate) fn kind_name(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Cell => "cell",
        NodeKind::Computed => "computed",
        NodeKind::Sink => "sink",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::CellSpec;

    #[test]
    fn graph_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Graph>();
    }

    #[test]
    fn reads_outside_evaluation_are_not_tracked() {
        let graph = Graph::new();
        let bins = graph.define_cell(CellSpec::new("bins", 20_i64)).unwrap();

        assert_eq!(graph.get(&bins).unwrap(), 20);
        assert!(graph.dependents(bins.id()).unwrap().is_empty());
    }

    #[test]
    fn tracked_read_outside_evaluation_is_stale() {
        let graph = Graph::new();
        let bins = graph.define_cell(CellSpec::new("bins", 20_i64)).unwrap();

        let err = graph.tracked(&bins).unwrap_err();
        assert!(matches!(err, ReactiveError::StaleRead { node } if node == "bins"));
    }

    #[test]
    fn batch_error_discards_staged_writes() {
        let graph = Graph::new();
        let a = graph.define_cell(CellSpec::new("a", 1_i64)).unwrap();
        let b = graph
            .define_cell(CellSpec::new("b", 1_i64).between(0, 10))
            .unwrap();

        let result = graph.batch(|g| {
            g.set(&a, 5)?;
            g.set(&b, 50)
        });

        assert!(matches!(result, Err(ReactiveError::InvalidInput { .. })));
        assert!(!graph.in_batch());
        assert_eq!(graph.get(&a).unwrap(), 1);
        assert_eq!(graph.version(a.id()).unwrap(), 0);
    }

    #[test]
    fn end_batch_without_begin_fails() {
        let graph = Graph::new();
        assert!(matches!(graph.end_batch(), Err(ReactiveError::NoOpenBatch)));
    }

    #[test]
    fn nested_end_batch_reports_uncommitted() {
        let graph = Graph::new();
        let a = graph.define_cell(CellSpec::new("a", 1_i64)).unwrap();

        graph.begin_batch().unwrap();
        graph.begin_batch().unwrap();
        graph.set(&a, 2).unwrap();

        let inner = graph.end_batch().unwrap();
        assert!(!inner.committed);
        assert_eq!(graph.get(&a).unwrap(), 1);

        let outer = graph.end_batch().unwrap();
        assert!(outer.committed);
        assert_eq!(outer.changed, vec![a.id()]);
        assert_eq!(graph.get(&a).unwrap(), 2);
    }

    #[test]
    fn config_is_validated() {
        let err = Graph::with_config(GraphConfig {
            max_depth: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_depth", .. }));

        let graph = Graph::with_config(GraphConfig {
            emission_capacity: 8,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(graph.config().emission_capacity, 8);
    }

    #[test]
    fn clear_invalidates_handles() {
        let graph = Graph::new();
        let a = graph.define_cell(CellSpec::new("a", 1_i64)).unwrap();

        assert_eq!(graph.clear(), 1);
        assert!(matches!(graph.get(&a), Err(ReactiveError::UnknownNode(_))));
    }
}
