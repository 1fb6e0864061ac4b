//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.
//! A node carries its topology (dependencies with their version stamps and
//! dependents), its lifecycle state and a type-erased payload holding the
//! cell value, the evaluator or the render function.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reactive::{Graph, Trigger};

/// Type-erased value stored in a node.
pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// Type-erased evaluator or render function.
pub(crate) type Evaluator = Arc<dyn Fn(&Graph) -> Result<AnyValue> + Send + Sync>;

/// Type-erased constraint check for cell writes.
pub(crate) type Validator =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> std::result::Result<(), String> + Send + Sync>;

/// Unique identifier for a node in the dependency graph.
///
/// Ids are unique across every graph in the process, so a handle used
/// against the wrong graph fails with an unknown-node error instead of
/// aliasing a different node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// An externally mutable value. Roots of the graph: dependents only.
    Cell,

    /// A memoized derivation. Has dependencies and may have dependents.
    Computed,

    /// A terminal subscriber producing an artifact. Dependencies only.
    Sink,
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// The cached value (or artifact) is up to date.
    Clean,

    /// An upstream change invalidated the cache; re-evaluate on next read.
    Dirty,

    /// The evaluator is currently running.
    Evaluating,

    /// The last evaluation failed; the failure is cached until an upstream
    /// change re-dirties the node.
    Errored,
}

/// Runtime description of the Rust type a node produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValueType {
    pub id: TypeId,
    pub name: &'static str,
}

impl ValueType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

pub(crate) struct CellSlot {
    pub value: AnyValue,
    pub validator: Validator,
}

pub(crate) struct ComputedSlot {
    pub evaluator: Evaluator,
    pub cached: Option<Result<AnyValue>>,
}

pub(crate) struct SinkSlot {
    pub render: Evaluator,
    pub artifact: Option<Result<AnyValue>>,
    pub trigger: Trigger,
    /// Sources named at registration. Always kept as dependencies, in
    /// addition to whatever the render function reads.
    pub declared: IndexSet<NodeId>,
    /// Bumped on every invalidation; in-flight renders stamped with an
    /// older epoch are discarded.
    pub epoch: u64,
}

pub(crate) enum Payload {
    Cell(CellSlot),
    Computed(ComputedSlot),
    Sink(SinkSlot),
}

/// A node in the dependency graph.
pub(crate) struct Node {
    id: NodeId,
    label: String,
    value_type: ValueType,
    state: NodeState,

    /// Bumped on every committed write (cells) or every finished
    /// evaluation (computed nodes and sinks).
    version: u64,

    /// Sources read during the last evaluation, each with the version it
    /// had when that evaluation finished.
    dependencies: IndexMap<NodeId, u64>,

    /// Nodes that read this node during their last evaluation.
    dependents: IndexSet<NodeId>,

    evaluations: u64,
    invalidations: u64,

    pub(crate) payload: Payload,
}

impl Node {
    fn new(label: String, value_type: ValueType, state: NodeState, payload: Payload) -> Self {
        Self {
            id: NodeId::new(),
            label,
            value_type,
            state,
            version: 0,
            dependencies: IndexMap::new(),
            dependents: IndexSet::new(),
            evaluations: 0,
            invalidations: 0,
            payload,
        }
    }

    /// Create a cell node holding `value`.
    pub fn cell(
        label: impl Into<String>,
        value_type: ValueType,
        value: AnyValue,
        validator: Validator,
    ) -> Self {
        Self::new(
            label.into(),
            value_type,
            NodeState::Clean,
            Payload::Cell(CellSlot { value, validator }),
        )
    }

    /// Create a computed node. It starts dirty so the first read evaluates.
    pub fn computed(label: impl Into<String>, value_type: ValueType, evaluator: Evaluator) -> Self {
        Self::new(
            label.into(),
            value_type,
            NodeState::Dirty,
            Payload::Computed(ComputedSlot {
                evaluator,
                cached: None,
            }),
        )
    }

    /// Create a sink node. It starts dirty with nothing rendered.
    pub fn sink(
        label: impl Into<String>,
        value_type: ValueType,
        render: Evaluator,
        trigger: Trigger,
        declared: IndexSet<NodeId>,
    ) -> Self {
        Self::new(
            label.into(),
            value_type,
            NodeState::Dirty,
            Payload::Sink(SinkSlot {
                render,
                artifact: None,
                trigger,
                declared,
                epoch: 0,
            }),
        )
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> NodeKind {
        match self.payload {
            Payload::Cell(_) => NodeKind::Cell,
            Payload::Computed(_) => NodeKind::Computed,
            Payload::Sink(_) => NodeKind::Sink,
        }
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations
    }

    /// Record a finished evaluation (successful or failed).
    pub fn record_evaluation(&mut self) {
        self.evaluations += 1;
        self.version += 1;
    }

    /// Mark the node dirty after an upstream change. Sinks also advance
    /// their epoch so in-flight renders become stale.
    pub fn invalidate(&mut self) {
        self.invalidations += 1;
        if self.state != NodeState::Evaluating {
            self.state = NodeState::Dirty;
        }
        if let Payload::Sink(slot) = &mut self.payload {
            slot.epoch += 1;
        }
    }

    /// Dependencies with their recorded version stamps.
    pub fn dependencies(&self) -> &IndexMap<NodeId, u64> {
        &self.dependencies
    }

    /// Replace the dependency set, returning the previous one.
    pub fn replace_dependencies(&mut self, deps: IndexMap<NodeId, u64>) -> IndexMap<NodeId, u64> {
        std::mem::replace(&mut self.dependencies, deps)
    }

    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }

    /// Cached evaluation outcome for computed nodes, artifact for sinks.
    pub fn cached(&self) -> Option<&Result<AnyValue>> {
        match &self.payload {
            Payload::Cell(_) => None,
            Payload::Computed(slot) => slot.cached.as_ref(),
            Payload::Sink(slot) => slot.artifact.as_ref(),
        }
    }

    pub fn store(&mut self, outcome: Result<AnyValue>) {
        match &mut self.payload {
            Payload::Cell(_) => {}
            Payload::Computed(slot) => slot.cached = Some(outcome),
            Payload::Sink(slot) => slot.artifact = Some(outcome),
        }
    }

    /// The function run to (re)compute this node, if it has one.
    pub fn evaluator(&self) -> Option<Evaluator> {
        match &self.payload {
            Payload::Cell(_) => None,
            Payload::Computed(slot) => Some(slot.evaluator.clone()),
            Payload::Sink(slot) => Some(slot.render.clone()),
        }
    }

    pub fn trigger(&self) -> Option<Trigger> {
        match &self.payload {
            Payload::Sink(slot) => Some(slot.trigger),
            _ => None,
        }
    }

    pub fn epoch(&self) -> u64 {
        match &self.payload {
            Payload::Sink(slot) => slot.epoch,
            _ => 0,
        }
    }

    /// Sources a sink declared at registration; `None` for other kinds.
    pub fn declared(&self) -> Option<&IndexSet<NodeId>> {
        match &self.payload {
            Payload::Sink(slot) => Some(&slot.declared),
            _ => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kind", &self.kind())
            .field("state", &self.state)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("dependents", &self.dependents)
            .finish()
    }
}
