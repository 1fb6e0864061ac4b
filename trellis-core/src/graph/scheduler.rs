//! Scheduler
//!
//! The scheduler owns every node of a session and is the only thing that
//! mutates edges. It stages cell writes while a batch is open, commits them
//! when the outermost batch closes and marks every transitive dependent
//! dirty exactly once per batch.
//!
//! # Algorithm
//!
//! 1. `set` validates and stages the new value in the open batch.
//! 2. Closing the outermost batch writes every staged value and bumps each
//!    written cell's version.
//! 3. A breadth-first walk from all written cells, sharing one visited set,
//!    marks dependents dirty. Fan-in never marks a node twice.
//! 4. Nothing is recomputed here: dirty nodes re-evaluate when next read,
//!    and push sinks are handed back to the caller to render on settle.
//!
//! After every evaluation the evaluated node's edges are rebuilt from the
//! sources it actually read, so stale edges never linger.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};
use tracing::trace;

use super::node::{AnyValue, Evaluator, Node, NodeId, NodeState, Payload};
use crate::error::{ReactiveError, Result};
use crate::reactive::Trigger;

/// Writes staged by an open batch.
#[derive(Default)]
struct Batch {
    depth: usize,
    staged: IndexMap<NodeId, AnyValue>,
    push: IndexSet<NodeId>,
}

/// What closing the outermost batch changed.
#[derive(Debug, Default)]
pub(crate) struct Commit {
    /// Cells whose staged value was written.
    pub changed: Vec<NodeId>,
    /// Nodes marked dirty, each listed once.
    pub invalidated: Vec<NodeId>,
    /// Push-triggered sinks to render now that the batch has settled.
    pub push: Vec<NodeId>,
}

/// The scheduler manages the dependency graph and coordinates invalidation.
pub(crate) struct Scheduler {
    /// All nodes in the graph, indexed by ID.
    nodes: IndexMap<NodeId, Node>,

    labels: HashMap<String, NodeId>,

    batch: Option<Batch>,
}

impl Scheduler {
    /// Create a new empty scheduler.
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            labels: HashMap::new(),
            batch: None,
        }
    }

    /// Add a node to the graph. Labels are unique per graph.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        if self.labels.contains_key(node.label()) {
            return Err(ReactiveError::DuplicateId(node.label().to_string()));
        }
        let id = node.id();
        self.labels.insert(node.label().to_string(), id);
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Drop every node and any open batch. Returns how many nodes were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.nodes.len();
        self.nodes.clear();
        self.labels.clear();
        self.batch = None;
        count
    }

    pub fn node(&self, node_id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| ReactiveError::UnknownNode(node_id.to_string()))
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&node_id)
            .ok_or_else(|| ReactiveError::UnknownNode(node_id.to_string()))
    }

    pub fn lookup(&self, label: &str) -> Result<NodeId> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| ReactiveError::UnknownNode(label.to_string()))
    }

    /// Label of a node, falling back to its raw id once it is gone.
    pub fn label_of(&self, node_id: NodeId) -> String {
        self.nodes
            .get(&node_id)
            .map(|node| node.label().to_string())
            .unwrap_or_else(|| node_id.to_string())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Replace the dependencies of `dependent` with `reads`, stamping each
    /// with its current version, and fix up the reverse edges.
    pub fn rewire(&mut self, dependent: NodeId, reads: impl IntoIterator<Item = NodeId>) {
        let stamped: IndexMap<NodeId, u64> = reads
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|node| (id, node.version())))
            .collect();

        let Some(node) = self.nodes.get_mut(&dependent) else {
            return;
        };
        let previous = node.replace_dependencies(stamped.clone());

        for dep_id in previous.keys().filter(|id| !stamped.contains_key(*id)) {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(dependent);
                trace!(source = dep.label(), %dependent, "dropped stale edge");
            }
        }
        for dep_id in stamped.keys() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.add_dependent(dependent);
            }
        }
    }

    /// Whether the cached outcome of a computed node or sink can be served
    /// without running it: it is not dirty, something is cached, and every
    /// recorded dependency still has the version it was stamped with.
    pub fn is_current(&self, node_id: NodeId) -> bool {
        let Some(node) = self.nodes.get(&node_id) else {
            return false;
        };
        matches!(node.state(), NodeState::Clean | NodeState::Errored)
            && node.cached().is_some()
            && node.dependencies().iter().all(|(dep_id, stamp)| {
                self.nodes
                    .get(dep_id)
                    .is_some_and(|dep| dep.version() == *stamp)
            })
    }

    /// Flag `node_id` as evaluating and hand out its evaluator.
    pub fn begin_evaluation(&mut self, node_id: NodeId) -> Result<Evaluator> {
        let node = self.node_mut(node_id)?;
        let evaluator = node
            .evaluator()
            .ok_or_else(|| ReactiveError::UnknownNode(node.label().to_string()))?;
        node.set_state(NodeState::Evaluating);
        Ok(evaluator)
    }

    /// Record the outcome of an evaluation: rebuild edges from `reads` (plus
    /// a sink's declared sources), cache the value or the attributed failure,
    /// and bump the node's version.
    pub fn finish_evaluation(
        &mut self,
        node_id: NodeId,
        reads: impl IntoIterator<Item = NodeId>,
        outcome: Result<AnyValue>,
    ) -> Result<AnyValue> {
        match outcome {
            Ok(value) => {
                self.record(node_id, reads, Ok(value.clone()));
                Ok(value)
            }
            Err(err) => Err(self.record_failure(node_id, reads, err)),
        }
    }

    /// Record a failed evaluation and return the error readers will see.
    ///
    /// Cycles and depth overflows are not cached; the node goes back to
    /// dirty so the next read tries again.
    pub fn record_failure(
        &mut self,
        node_id: NodeId,
        reads: impl IntoIterator<Item = NodeId>,
        err: ReactiveError,
    ) -> ReactiveError {
        if err.is_structural() {
            self.abandon(node_id);
            return err;
        }
        let err = err.attribute(&self.label_of(node_id));
        self.record(node_id, reads, Err(err.clone()));
        err
    }

    fn record(
        &mut self,
        node_id: NodeId,
        reads: impl IntoIterator<Item = NodeId>,
        outcome: Result<AnyValue>,
    ) {
        self.rewire_with_declared(node_id, reads);

        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        let state = if outcome.is_ok() {
            NodeState::Clean
        } else {
            NodeState::Errored
        };
        node.store(outcome);
        node.record_evaluation();
        node.set_state(state);
    }

    /// Like [`rewire`](Self::rewire), keeping a sink's declared sources.
    pub fn rewire_with_declared(&mut self, node_id: NodeId, reads: impl IntoIterator<Item = NodeId>) {
        let declared: Vec<NodeId> = self
            .nodes
            .get(&node_id)
            .and_then(|node| node.declared())
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        self.rewire(node_id, declared.into_iter().chain(reads));
    }

    /// Store an artifact produced outside the graph, unless the sink was
    /// invalidated after `epoch` was taken. Returns `Ok(None)` when stale.
    pub fn commit_artifact(
        &mut self,
        node_id: NodeId,
        epoch: u64,
        outcome: Result<AnyValue>,
    ) -> Result<Option<AnyValue>> {
        let node = self.node_mut(node_id)?;
        if node.epoch() != epoch {
            return Ok(None);
        }
        let outcome = outcome.map_err(|err| err.attribute(node.label()));
        node.store(outcome.clone());
        node.record_evaluation();
        node.set_state(if outcome.is_ok() {
            NodeState::Clean
        } else {
            NodeState::Errored
        });
        outcome.map(Some)
    }

    /// Return a node to dirty without caching anything.
    pub fn abandon(&mut self, node_id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.set_state(NodeState::Dirty);
        }
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    pub fn open_batch(&mut self) {
        self.batch.get_or_insert_with(Batch::default).depth += 1;
    }

    pub fn in_batch(&self) -> bool {
        self.batch.is_some()
    }

    /// Stage a cell write. Later writes to the same cell replace earlier ones.
    pub fn stage(&mut self, cell: NodeId, value: AnyValue) -> Result<()> {
        let batch = self.batch.as_mut().ok_or(ReactiveError::NoOpenBatch)?;
        batch.staged.insert(cell, value);
        Ok(())
    }

    /// The value staged for `cell` in the open batch, if any.
    pub fn staged(&self, cell: NodeId) -> Option<AnyValue> {
        self.batch.as_ref()?.staged.get(&cell).cloned()
    }

    /// Queue a push sink to be rendered when the open batch settles.
    pub fn queue_push(&mut self, sink: NodeId) -> Result<()> {
        let batch = self.batch.as_mut().ok_or(ReactiveError::NoOpenBatch)?;
        batch.push.insert(sink);
        Ok(())
    }

    /// Close one level of batching. When the outermost level closes, the
    /// staged writes are applied and propagated.
    pub fn close_batch(&mut self) -> Result<Option<Commit>> {
        let batch = self.batch.as_mut().ok_or(ReactiveError::NoOpenBatch)?;
        batch.depth -= 1;
        if batch.depth > 0 {
            return Ok(None);
        }
        let Some(batch) = self.batch.take() else {
            return Ok(None);
        };

        let mut changed = Vec::with_capacity(batch.staged.len());
        for (cell_id, value) in batch.staged {
            let Some(node) = self.nodes.get_mut(&cell_id) else {
                continue;
            };
            if let Payload::Cell(slot) = &mut node.payload {
                slot.value = value;
            } else {
                continue;
            }
            node.bump_version();
            changed.push(cell_id);
        }

        let (invalidated, mut push) = self.mark_changed(&changed);
        for sink in batch.push {
            if !push.contains(&sink) {
                push.push(sink);
            }
        }

        Ok(Some(Commit {
            changed,
            invalidated,
            push,
        }))
    }

    /// Drop the open batch and everything staged in it.
    pub fn discard_batch(&mut self) -> usize {
        self.batch.take().map_or(0, |batch| batch.staged.len())
    }

    /// Mark every transitive dependent of `sources` dirty.
    ///
    /// Returns the invalidated nodes (each once, however many paths reach
    /// it) and the push-triggered sinks among them.
    fn mark_changed(&mut self, sources: &[NodeId]) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut invalidated = Vec::new();
        let mut push = Vec::new();
        let mut visited = HashSet::new();

        let mut queue: VecDeque<NodeId> = sources
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .flat_map(|source| source.dependents().iter().copied())
            .collect();

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.invalidate();
                trace!(node = node.label(), "marked dirty");
                invalidated.push(node_id);

                if node.trigger() == Some(Trigger::Push) {
                    push.push(node_id);
                }
                queue.extend(node.dependents().iter().copied());
            }
        }

        (invalidated, push)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
