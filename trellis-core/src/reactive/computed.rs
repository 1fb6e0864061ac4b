//! Computed Implementation
//!
//! A Computed node is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computed Nodes Work
//!
//! 1. On first read, the node runs its evaluator and caches the result.
//!
//! 2. When read again, if it is not dirty and every dependency still has the
//!    version recorded at the last evaluation, the cached result is returned
//!    without running the evaluator.
//!
//! 3. When a dependency changes, the scheduler marks the node dirty. Nothing
//!    runs until the node is read again.
//!
//! 4. Every evaluation records exactly the sources it read. A branch that
//!    stops reading a source drops that dependency.
//!
//! 5. A failing evaluator caches its failure. Readers get the same error
//!    back, without re-running the evaluator, until an upstream change
//!    re-dirties the node.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};

use super::context::EvalGuard;
use super::runtime::{Graph, Source};
use crate::error::{ReactiveError, Result};
use crate::graph::{AnyValue, Evaluator, Node, NodeId, NodeKind, ValueType};

/// Typed handle to a computed node registered on a [`Graph`].
pub struct Computed<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Computed<T> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Computed<T> {}

impl<T> Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Computed").field(&self.id).finish()
    }
}

impl<T> Source<T> for Computed<T> {
    fn node_id(&self) -> NodeId {
        self.id
    }
}

impl Graph {
    /// Register a computed node.
    ///
    /// The evaluator is not run now; the node starts dirty and evaluates on
    /// first read.
    ///
    /// # Example
    ///
    /// ```rust
    /// use trellis_core::{CellSpec, Graph};
    ///
    /// let graph = Graph::new();
    /// let count = graph.define_cell(CellSpec::new("count", 2_i64)).unwrap();
    /// let doubled = graph
    ///     .define_computed("doubled", move |g| Ok(g.get(&count)? * 2))
    ///     .unwrap();
    ///
    /// assert_eq!(graph.get(&doubled).unwrap(), 4);
    /// graph.set(&count, 5).unwrap();
    /// assert_eq!(graph.get(&doubled).unwrap(), 10);
    /// ```
    pub fn define_computed<T, F>(&self, label: impl Into<String>, f: F) -> Result<Computed<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Graph) -> Result<T> + Send + Sync + 'static,
    {
        let evaluator: Evaluator =
            Arc::new(move |graph: &Graph| f(graph).map(|value| Arc::new(value) as AnyValue));
        let node = Node::computed(label, ValueType::of::<T>(), evaluator);
        let label = node.label().to_string();

        let id = self.scheduler.borrow_mut().add_node(node)?;
        debug!(node = %label, %id, "computed defined");
        Ok(Computed::new(id))
    }

    /// Look up a computed node by label, checking its value type.
    pub fn computed<T: 'static>(&self, label: &str) -> Result<Computed<T>> {
        self.lookup_typed(label, NodeKind::Computed, ValueType::of::<T>())
            .map(Computed::new)
    }

    /// Number of times the node's evaluator (or render function) has run to
    /// completion.
    pub fn evaluations(&self, id: NodeId) -> Result<u64> {
        Ok(self.scheduler.borrow().node(id)?.evaluations())
    }

    /// Serve the cached outcome if it is still valid, otherwise evaluate.
    pub(crate) fn evaluate(&self, id: NodeId) -> Result<AnyValue> {
        self.check_reentry(id)?;
        {
            let scheduler = self.scheduler.borrow();
            if scheduler.is_current(id) {
                if let Some(cached) = scheduler.node(id)?.cached() {
                    return cached.clone();
                }
            }
        }
        self.run(id)
    }

    /// Fail with a cycle error if `id` is already being evaluated.
    ///
    /// Every frame on the cycle is poisoned, so the whole chain fails even
    /// if an evaluator in the middle swallows the error.
    fn check_reentry(&self, id: NodeId) -> Result<()> {
        let mut stack = self.stack.borrow_mut();
        let Some(position) = stack.position(id) else {
            return Ok(());
        };

        let scheduler = self.scheduler.borrow();
        let mut path: Vec<String> = stack
            .nodes_from(position)
            .into_iter()
            .map(|node| scheduler.label_of(node))
            .collect();
        path.push(scheduler.label_of(id));
        stack.poison_from(position, &path);

        warn!(cycle = %path.join(" -> "), "dependency cycle detected");
        Err(ReactiveError::Cycle { path })
    }

    /// Run a computed node's evaluator (or a sink's render function) in a
    /// fresh frame and record the outcome.
    pub(crate) fn run(&self, id: NodeId) -> Result<AnyValue> {
        let depth = self.stack.borrow().depth();
        if depth >= self.config.max_depth {
            return Err(ReactiveError::DepthExceeded(self.config.max_depth));
        }
        self.settle_declared(id)?;

        let evaluator = self.scheduler.borrow_mut().begin_evaluation(id)?;
        let guard = EvalGuard::enter(self, id);
        let outcome = evaluator(self);
        let frame = guard.finish();

        let mut scheduler = self.scheduler.borrow_mut();
        let result = match frame.cycle {
            Some(path) => Err(scheduler.record_failure(id, frame.reads, ReactiveError::Cycle { path })),
            None => scheduler.finish_evaluation(id, frame.reads, outcome),
        };
        debug!(
            node = %scheduler.label_of(id),
            ok = result.is_ok(),
            "evaluated"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::graph::NodeState;
    use crate::reactive::CellSpec;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (count.clone(), count)
    }

    #[test]
    fn computed_evaluates_on_first_read() {
        let graph = Graph::new();
        let (calls, calls_clone) = counter();

        let answer = graph
            .define_computed("answer", move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(42_i64)
            })
            .unwrap();

        // Not evaluated yet
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(graph.state(answer.id()).unwrap(), NodeState::Dirty);

        assert_eq!(graph.get(&answer).unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(graph.state(answer.id()).unwrap(), NodeState::Clean);
    }

    #[test]
    fn computed_caches_value_when_clean() {
        let graph = Graph::new();
        let (calls, calls_clone) = counter();

        let answer = graph
            .define_computed("answer", move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(42_i64)
            })
            .unwrap();

        assert_eq!(graph.get(&answer).unwrap(), 42);
        assert_eq!(graph.get(&answer).unwrap(), 42);
        assert_eq!(graph.get(&answer).unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn computed_recomputes_after_upstream_write() {
        let graph = Graph::new();
        let (calls, calls_clone) = counter();
        let count = graph.define_cell(CellSpec::new("count", 1_i64)).unwrap();

        let doubled = graph
            .define_computed("doubled", move |g| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(g.get(&count)? * 2)
            })
            .unwrap();

        assert_eq!(graph.get(&doubled).unwrap(), 2);
        let version = graph.version(doubled.id()).unwrap();

        graph.set(&count, 5).unwrap();
        assert_eq!(graph.state(doubled.id()).unwrap(), NodeState::Dirty);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(graph.get(&doubled).unwrap(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(graph.version(doubled.id()).unwrap() > version);
    }

    #[test]
    fn computed_depends_on_computed() {
        let graph = Graph::new();
        let base = graph.define_cell(CellSpec::new("base", 5_i64)).unwrap();
        let doubled = graph
            .define_computed("doubled", move |g| Ok(g.get(&base)? * 2))
            .unwrap();
        let plus_ten = graph
            .define_computed("plus_ten", move |g| Ok(g.get(&doubled)? + 10))
            .unwrap();

        assert_eq!(graph.get(&plus_ten).unwrap(), 20);

        graph.set(&base, 10).unwrap();
        assert_eq!(graph.get(&plus_ten).unwrap(), 30);
        assert_eq!(graph.dependencies(plus_ten.id()).unwrap(), vec![doubled.id()]);
    }

    #[test]
    fn failure_is_cached_until_upstream_changes() {
        let graph = Graph::new();
        let (calls, calls_clone) = counter();
        let bins = graph.define_cell(CellSpec::new("bins", 0_i64)).unwrap();

        let edges = graph
            .define_computed("edges", move |g| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                let bins = g.get(&bins)?;
                if bins < 2 {
                    return Err(ReactiveError::failed("need at least 2 bins"));
                }
                Ok(bins + 1)
            })
            .unwrap();

        let first = graph.get(&edges).unwrap_err();
        let second = graph.get(&edges).unwrap_err();
        assert_eq!(first.origin(), Some("edges"));
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(graph.state(edges.id()).unwrap(), NodeState::Errored);

        // The dependency was still recorded, so fixing the input recovers.
        graph.set(&bins, 4).unwrap();
        assert_eq!(graph.get(&edges).unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn self_read_is_a_cycle() {
        let graph = Graph::new();
        let me = graph
            .define_computed("me", |g| {
                let me = g.computed::<i64>("me")?;
                g.get(&me)
            })
            .unwrap();

        let err = graph.get(&me).unwrap_err();
        assert!(matches!(err, ReactiveError::Cycle { ref path } if path == &["me", "me"]));
        assert_eq!(graph.state(me.id()).unwrap(), NodeState::Dirty);
    }

    #[test]
    fn swallowed_cycle_still_fails() {
        let graph = Graph::new();
        let a = graph
            .define_computed("a", |g| {
                let b = g.computed::<i64>("b")?;
                g.get(&b)
            })
            .unwrap();
        graph
            .define_computed("b", |g| {
                let a = g.computed::<i64>("a")?;
                // Substituting a fallback must not hide the cycle.
                Ok(g.get(&a).unwrap_or(0))
            })
            .unwrap();

        let err = graph.get(&a).unwrap_err();
        assert!(matches!(err, ReactiveError::Cycle { ref path } if path == &["a", "b", "a"]));
    }

    #[test]
    fn depth_limit_is_enforced() {
        let graph = Graph::with_config(crate::GraphConfig {
            max_depth: 2,
            ..Default::default()
        })
        .unwrap();
        let x = graph.define_cell(CellSpec::new("x", 1_i64)).unwrap();
        let a = graph.define_computed("a", move |g| g.get(&x)).unwrap();
        let b = graph.define_computed("b", move |g| g.get(&a)).unwrap();
        let c = graph.define_computed("c", move |g| g.get(&b)).unwrap();

        assert!(matches!(graph.get(&c), Err(ReactiveError::DepthExceeded(2))));
        assert_eq!(graph.state(c.id()).unwrap(), NodeState::Dirty);
        assert_eq!(graph.get(&b).unwrap(), 1);
    }

    #[test]
    fn writes_inside_evaluators_are_rejected() {
        let graph = Graph::new();
        let x = graph.define_cell(CellSpec::new("x", 1_i64)).unwrap();
        let sneaky = graph
            .define_computed("sneaky", move |g| {
                g.set(&x, 2)?;
                Ok(0_i64)
            })
            .unwrap();

        let err = graph.get(&sneaky).unwrap_err();
        assert_eq!(err.origin(), Some("sneaky"));
        assert!(err.to_string().contains("cannot be written while `sneaky` is evaluating"));
        assert_eq!(graph.get(&x).unwrap(), 1);
    }

    #[test]
    fn batch_boundaries_inside_evaluators_are_rejected() {
        let graph = Graph::new();
        let x = graph.define_cell(CellSpec::new("x", 1_i64)).unwrap();
        let scaled = graph
            .define_computed("scaled", move |g| {
                let value = g.get(&x)? * 10;
                g.end_batch()?;
                Ok(value)
            })
            .unwrap();

        graph.begin_batch().unwrap();
        graph.set(&x, 2).unwrap();
        let err = graph.get(&scaled).unwrap_err();
        assert!(err.to_string().contains("cannot be opened or closed while `scaled` is evaluating"));

        // The caller's batch is still open and still holds the write.
        assert!(graph.in_batch());
        assert_eq!(graph.get(&x).unwrap(), 1);
        graph.end_batch().unwrap();

        assert_eq!(graph.get(&x).unwrap(), 2);
        let err = graph.get(&scaled).unwrap_err();
        assert_eq!(err.origin(), Some("scaled"));

        let opener = graph
            .define_computed("opener", move |g| {
                g.begin_batch()?;
                g.get(&x)
            })
            .unwrap();
        assert!(graph.get(&opener).is_err());
        assert!(!graph.in_batch());
    }

    #[test]
    fn panicking_evaluator_leaves_graph_usable() {
        let graph = Graph::new();
        let boom = graph
            .define_computed::<i64, _>("boom", |_| panic!("evaluator panicked"))
            .unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| graph.get(&boom)));
        assert!(outcome.is_err());
        assert_eq!(graph.state(boom.id()).unwrap(), NodeState::Dirty);
        assert!(!graph.stack.borrow().is_active());
    }
}
