//! Sink Implementation
//!
//! A Sink is a terminal subscriber: it reads cells and computed nodes, runs a
//! render function and keeps the resulting artifact. Nothing can read a sink.
//!
//! # How Sinks Work
//!
//! 1. A sink is registered with the sources it consumes. Those stay
//!    dependencies for its whole life; anything else the render function
//!    reads is tracked per render like a computed node's reads.
//!
//! 2. A pull sink renders only when asked through [`Graph::render`]. The
//!    artifact is cached and served until an upstream change dirties it.
//!
//! 3. A push sink also renders automatically once the batch that dirtied it
//!    settles, and announces each render on the graph's emission channel.
//!
//! 4. A render that fails caches the failure on that sink only. Sinks that
//!    do not depend on the failing node keep rendering normally.
//!
//! # Asynchronous Renders
//!
//! Renders that do slow work outside the graph are split in two:
//! [`Graph::prepare_render`] reads the inputs under tracking and stamps a
//! [`RenderTicket`] with the sink's invalidation epoch, and
//! [`Graph::commit_render`] stores the finished artifact only if the sink
//! was not invalidated in between. A stale result is dropped, never cached.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::context::EvalGuard;
use super::runtime::Graph;
use crate::error::{ReactiveError, Result};
use crate::graph::{AnyValue, Evaluator, Node, NodeId, NodeKind, ValueType};

/// When a sink re-renders after its inputs change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Only when the display layer asks for the artifact.
    #[default]
    Pull,

    /// Automatically, once the batch that invalidated it settles.
    Push,
}

/// Notification sent when a push sink renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Emission {
    /// Label of the sink that rendered.
    pub sink: String,
    /// The sink's invalidation epoch at render time.
    pub epoch: u64,
    /// Whether the render produced an artifact rather than a failure.
    pub ok: bool,
}

/// Typed handle to a sink producing artifacts of type `A`.
pub struct Sink<A> {
    id: NodeId,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Sink<A> {
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

impl<A> Clone for Sink<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for Sink<A> {}

impl<A> Debug for Sink<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sink").field(&self.id).finish()
    }
}

/// Proof that a sink's inputs were read at a given invalidation epoch.
///
/// Returned by [`Graph::prepare_render`] and consumed by
/// [`Graph::commit_render`].
pub struct RenderTicket<A> {
    sink: NodeId,
    epoch: u64,
    _marker: PhantomData<fn() -> A>,
}

impl<A> RenderTicket<A> {
    pub fn sink(&self) -> NodeId {
        self.sink
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl<A> Debug for RenderTicket<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTicket")
            .field("sink", &self.sink)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Graph {
    /// Register a sink using the configured default trigger.
    pub fn define_sink<A, F>(
        &self,
        label: impl Into<String>,
        sources: impl IntoIterator<Item = NodeId>,
        render: F,
    ) -> Result<Sink<A>>
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(&Graph) -> Result<A> + Send + Sync + 'static,
    {
        let trigger = self.config.default_trigger;
        self.define_sink_with(label, sources, trigger, render)
    }

    /// Register a sink with an explicit trigger.
    ///
    /// Every id in `sources` must name a cell or computed node. A push sink
    /// renders right away, or when the enclosing batch settles if one is
    /// open.
    pub fn define_sink_with<A, F>(
        &self,
        label: impl Into<String>,
        sources: impl IntoIterator<Item = NodeId>,
        trigger: Trigger,
        render: F,
    ) -> Result<Sink<A>>
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(&Graph) -> Result<A> + Send + Sync + 'static,
    {
        let label = label.into();
        let declared: IndexSet<NodeId> = sources.into_iter().collect();

        let evaluator: Evaluator =
            Arc::new(move |graph: &Graph| render(graph).map(|artifact| Arc::new(artifact) as AnyValue));

        let id = {
            let mut scheduler = self.scheduler.borrow_mut();
            for source in &declared {
                if scheduler.node(*source)?.kind() == NodeKind::Sink {
                    return Err(ReactiveError::NotASource(scheduler.label_of(*source)));
                }
            }
            let node = Node::sink(
                label.clone(),
                ValueType::of::<A>(),
                evaluator,
                trigger,
                declared.clone(),
            );
            let id = scheduler.add_node(node)?;
            scheduler.rewire(id, declared);
            id
        };
        debug!(sink = %label, %id, ?trigger, "sink defined");

        if trigger == Trigger::Push {
            if self.in_batch() {
                self.scheduler.borrow_mut().queue_push(id)?;
            } else {
                self.flush_push(&[id]);
            }
        }
        Ok(Sink::new(id))
    }

    /// Look up a sink by label, checking its artifact type.
    pub fn sink<A: 'static>(&self, label: &str) -> Result<Sink<A>> {
        self.lookup_typed(label, NodeKind::Sink, ValueType::of::<A>())
            .map(Sink::new)
    }

    /// Produce the sink's artifact, rendering only if the cached one is
    /// stale. A cached failure is returned as is.
    pub fn render<A: Clone + 'static>(&self, sink: &Sink<A>) -> Result<A> {
        let artifact = self.render_node(sink.id())?;
        self.downcast(sink.id(), artifact)
    }

    /// The last artifact (or failure) the sink produced, without rendering.
    pub fn artifact<A: Clone + 'static>(&self, sink: &Sink<A>) -> Option<Result<A>> {
        let cached = self
            .scheduler
            .borrow()
            .node(sink.id())
            .ok()?
            .cached()
            .cloned()?;
        Some(cached.and_then(|artifact| self.downcast(sink.id(), artifact)))
    }

    pub(crate) fn render_node(&self, id: NodeId) -> Result<AnyValue> {
        let node_kind = self.scheduler.borrow().node(id)?.kind();
        if node_kind != NodeKind::Sink {
            return Err(ReactiveError::TypeMismatch {
                node: self.scheduler.borrow().label_of(id),
                expected: "sink",
                actual: super::runtime::kind_name(node_kind),
            });
        }
        self.evaluate(id)
    }

    /// Render each push sink in `sinks` and announce the result.
    ///
    /// Returns the sinks that were rendered. A failing render is cached on
    /// its sink and reported with `ok: false`; it does not stop the others.
    /// Bring a sink's declared computed sources up to date before it renders,
    /// without recording them as reads. Only cycle and depth failures stop
    /// the render; other failures stay cached on the source.
    pub(crate) fn settle_declared(&self, id: NodeId) -> Result<()> {
        let pending: Vec<NodeId> = {
            let scheduler = self.scheduler.borrow();
            let Some(declared) = scheduler.node(id)?.declared() else {
                return Ok(());
            };
            let pending = declared
                .iter()
                .copied()
                .filter(|dep| {
                    scheduler
                        .node(*dep)
                        .is_ok_and(|node| node.kind() == NodeKind::Computed)
                        && !scheduler.is_current(*dep)
                })
                .collect();
            pending
        };
        for dep in pending {
            if let Err(err) = self.evaluate(dep) {
                if err.is_structural() {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn flush_push(&self, sinks: &[NodeId]) -> Vec<NodeId> {
        let mut rendered = Vec::with_capacity(sinks.len());
        for &id in sinks {
            let outcome = self.render_node(id);
            let Ok((label, epoch)) = self
                .scheduler
                .borrow()
                .node(id)
                .map(|node| (node.label().to_string(), node.epoch()))
            else {
                continue;
            };

            if let Err(err) = &outcome {
                debug!(sink = %label, error = %err, "push render failed");
            } else {
                debug!(sink = %label, epoch, "push render");
            }

            // No receivers is not an error.
            let _ = self.emissions.send(Emission {
                sink: label,
                epoch,
                ok: outcome.is_ok(),
            });
            rendered.push(id);
        }
        rendered
    }

    /// First half of an asynchronous render.
    ///
    /// Runs `prepare` as the sink's render step, tracking what it reads,
    /// and returns its output together with a ticket stamped with the
    /// sink's current invalidation epoch. Hand the ticket to
    /// [`commit_render`](Self::commit_render) once the slow work is done.
    ///
    /// A failing `prepare` is cached on the sink like any render failure.
    pub fn prepare_render<A, I, F>(&self, sink: &Sink<A>, prepare: F) -> Result<(RenderTicket<A>, I)>
    where
        F: FnOnce(&Graph) -> Result<I>,
    {
        let id = sink.id();
        let node_kind = self.scheduler.borrow().node(id)?.kind();
        if node_kind != NodeKind::Sink {
            return Err(ReactiveError::NotASource(self.scheduler.borrow().label_of(id)));
        }

        self.settle_declared(id)?;
        let guard = EvalGuard::enter(self, id);
        let outcome = prepare(self);
        let frame = guard.finish();

        let mut scheduler = self.scheduler.borrow_mut();
        match outcome {
            Ok(input) => {
                scheduler.rewire_with_declared(id, frame.reads);
                let epoch = scheduler.node(id)?.epoch();
                debug!(sink = %scheduler.label_of(id), epoch, "render prepared");
                let ticket = RenderTicket {
                    sink: id,
                    epoch,
                    _marker: PhantomData,
                };
                Ok((ticket, input))
            }
            Err(err) => Err(scheduler.record_failure(id, frame.reads, err)),
        }
    }

    /// Second half of an asynchronous render.
    ///
    /// Stores `outcome` as the sink's artifact and returns it, unless the
    /// sink was invalidated after the ticket was issued. In that case the
    /// result is discarded and `Ok(None)` is returned; the sink stays dirty.
    pub fn commit_render<A>(&self, ticket: RenderTicket<A>, outcome: Result<A>) -> Result<Option<A>>
    where
        A: Clone + Send + Sync + 'static,
    {
        let outcome = outcome.map(|artifact| Arc::new(artifact) as AnyValue);
        let committed = self
            .scheduler
            .borrow_mut()
            .commit_artifact(ticket.sink, ticket.epoch, outcome)?;

        match committed {
            Some(artifact) => self.downcast(ticket.sink, artifact).map(Some),
            None => {
                debug!(
                    sink = %self.scheduler.borrow().label_of(ticket.sink),
                    epoch = ticket.epoch,
                    "stale render discarded"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::graph::NodeState;
    use crate::reactive::CellSpec;

    #[test]
    fn pull_sink_renders_on_request_only() {
        let graph = Graph::new();
        let renders = Arc::new(AtomicUsize::new(0));
        let renders_clone = renders.clone();

        let bins = graph.define_cell(CellSpec::new("bins", 20_i64)).unwrap();
        let hist = graph
            .define_sink("hist", [bins.id()], move |g| {
                renders_clone.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{} bins", g.get(&bins)?))
            })
            .unwrap();

        assert_eq!(renders.load(Ordering::SeqCst), 0);
        assert_eq!(graph.render(&hist).unwrap(), "20 bins");
        assert_eq!(graph.render(&hist).unwrap(), "20 bins");
        assert_eq!(renders.load(Ordering::SeqCst), 1);

        graph.set(&bins, 30).unwrap();
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(graph.state(hist.id()).unwrap(), NodeState::Dirty);
        assert_eq!(graph.render(&hist).unwrap(), "30 bins");
        assert_eq!(renders.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn declared_sources_stay_dependencies() {
        let graph = Graph::new();
        let data = graph.define_cell(CellSpec::new("data", vec![1_i64, 2, 3])).unwrap();
        let table = graph.define_sink("table", [data.id()], |_| Ok(0_usize)).unwrap();

        assert_eq!(graph.dependencies(table.id()).unwrap(), vec![data.id()]);
        graph.render(&table).unwrap();
        assert_eq!(graph.dependencies(table.id()).unwrap(), vec![data.id()]);

        graph.set(&data, vec![4]).unwrap();
        assert_eq!(graph.state(table.id()).unwrap(), NodeState::Dirty);
    }

    #[test]
    fn sinks_cannot_be_sources() {
        let graph = Graph::new();
        let table = graph.define_sink("table", [], |_| Ok(0_usize)).unwrap();

        let err = graph
            .define_sink("grid", [table.id()], |_| Ok(0_usize))
            .unwrap_err();
        assert!(matches!(err, ReactiveError::NotASource(label) if label == "table"));
        assert!(graph.sink::<usize>("grid").is_err());
    }

    #[test]
    fn push_sink_renders_at_registration_and_settle() {
        let graph = Graph::new();
        let mut emissions = graph.subscribe();
        let bins = graph.define_cell(CellSpec::new("bins", 20_i64)).unwrap();
        let hist = graph
            .define_sink_with("hist", [bins.id()], Trigger::Push, move |g| g.get(&bins))
            .unwrap();

        assert_eq!(graph.artifact(&hist).unwrap().unwrap(), 20);
        let first = emissions.try_recv().unwrap();
        assert_eq!(first.sink, "hist");
        assert!(first.ok);

        graph.set(&bins, 25).unwrap();
        assert_eq!(graph.artifact(&hist).unwrap().unwrap(), 25);
        let second = emissions.try_recv().unwrap();
        assert_eq!(second.epoch, first.epoch + 1);
    }

    #[test]
    fn push_sink_defined_in_batch_renders_at_settle() {
        let graph = Graph::new();
        let bins = graph.define_cell(CellSpec::new("bins", 20_i64)).unwrap();

        graph.begin_batch().unwrap();
        let hist = graph
            .define_sink_with("hist", [bins.id()], Trigger::Push, move |g| g.get(&bins))
            .unwrap();
        graph.set(&bins, 40).unwrap();
        assert!(graph.artifact(&hist).is_none());

        let settled = graph.end_batch().unwrap();
        assert_eq!(settled.rendered, vec![hist.id()]);
        assert_eq!(graph.artifact(&hist).unwrap().unwrap(), 40);
    }

    #[test]
    fn failing_render_is_isolated() {
        let graph = Graph::new();
        let bins = graph.define_cell(CellSpec::new("bins", 0_i64)).unwrap();
        let broken = graph
            .define_sink("broken", [bins.id()], |_| -> Result<String> {
                Err(ReactiveError::failed("renderer crashed"))
            })
            .unwrap();
        let fine = graph.define_sink("fine", [], |_| Ok("ok".to_string())).unwrap();

        let err = graph.render(&broken).unwrap_err();
        assert_eq!(err.origin(), Some("broken"));
        assert_eq!(graph.state(broken.id()).unwrap(), NodeState::Errored);
        assert!(graph.artifact(&broken).unwrap().is_err());
        assert_eq!(graph.render(&fine).unwrap(), "ok");
    }

    #[test]
    fn commit_after_invalidation_is_discarded() {
        let graph = Graph::new();
        let bins = graph.define_cell(CellSpec::new("bins", 20_i64)).unwrap();
        let hist = graph.define_sink("hist", [bins.id()], move |g| g.get(&bins)).unwrap();

        let (ticket, input) = graph.prepare_render(&hist, |g| g.get(&bins)).unwrap();
        assert_eq!(input, 20);

        graph.set(&bins, 30).unwrap();
        assert_eq!(graph.commit_render(ticket, Ok(input)).unwrap(), None);
        assert!(graph.artifact(&hist).is_none());
        assert_eq!(graph.state(hist.id()).unwrap(), NodeState::Dirty);

        let (ticket, input) = graph.prepare_render(&hist, |g| g.get(&bins)).unwrap();
        assert_eq!(graph.commit_render(ticket, Ok(input)).unwrap(), Some(30));
        assert_eq!(graph.render(&hist).unwrap(), 30);
    }
}
