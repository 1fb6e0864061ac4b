//! Sessions
//!
//! A [`Session`] is a cloneable, thread-safe handle to one [`Graph`]. Every
//! operation takes the session lock for its whole mutate-propagate-evaluate
//! cycle, so no thread ever observes graph mutation interleaved with
//! evaluation.
//!
//! Asynchronous renders are the one place the lock is released mid-way:
//! [`Session::render_async`] reads the sink's inputs under the lock, drops
//! it while the async job runs, then retakes it to commit. If a write
//! reached the sink in the meantime, the job's result is discarded.

use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::{ConfigError, GraphConfig};
use crate::error::Result;
use crate::reactive::{Emission, Graph, Settled, Sink};

/// Shared handle to a session-scoped graph.
#[derive(Clone)]
pub struct Session {
    graph: Arc<Mutex<Graph>>,
}

impl Session {
    pub fn new(config: GraphConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self::from_graph(Graph::with_config(config)?))
    }

    fn from_graph(graph: Graph) -> Self {
        Self {
            graph: Arc::new(Mutex::new(graph)),
        }
    }

    /// Lock the graph for direct use. Hold the guard for as long as a
    /// sequence of calls must not interleave with other threads.
    pub fn lock(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock()
    }

    /// Run `f` as one batch under the session lock and report what settled.
    pub fn batch<R>(&self, f: impl FnOnce(&Graph) -> Result<R>) -> Result<(R, Settled)> {
        let graph = self.graph.lock();
        let outermost = !graph.in_batch();
        graph.begin_batch()?;
        let value = match f(&graph) {
            Ok(value) => value,
            Err(err) if outermost => {
                let dropped = graph.scheduler.borrow_mut().discard_batch();
                debug!(dropped, error = %err, "session batch aborted");
                return Err(err);
            }
            Err(err) => {
                graph.end_batch()?;
                return Err(err);
            }
        };
        let settled = graph.end_batch()?;
        Ok((value, settled))
    }

    pub fn render<A: Clone + 'static>(&self, sink: &Sink<A>) -> Result<A> {
        self.graph.lock().render(sink)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Emission> {
        self.graph.lock().subscribe()
    }

    /// Render a sink whose artifact is produced by async work.
    ///
    /// `prepare` runs under the lock with tracking, exactly like a render
    /// function, and its output is passed to `job`. The lock is not held
    /// while `job` runs. Returns `Ok(None)` if the sink was invalidated
    /// before `job` finished; the stale artifact is not cached.
    pub async fn render_async<A, I, P, J, Fut>(
        &self,
        sink: &Sink<A>,
        prepare: P,
        job: J,
    ) -> Result<Option<A>>
    where
        A: Clone + Send + Sync + 'static,
        P: FnOnce(&Graph) -> Result<I>,
        J: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<A>>,
    {
        let (ticket, input) = self.graph.lock().prepare_render(sink, prepare)?;
        let outcome = job(input).await;
        self.graph.lock().commit_render(ticket, outcome)
    }

    /// Discard every node of the session. Handles created before teardown
    /// fail with an unknown-node error afterwards, including those held by
    /// other clones of this session.
    pub fn teardown(self) -> usize {
        let removed = self.graph.lock().clear();
        debug!(removed, "session torn down");
        removed
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::from_graph(Graph::new())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.graph.try_lock() {
            Some(graph) => f.debug_tuple("Session").field(&*graph).finish(),
            None => f.debug_tuple("Session").field(&"<locked>").finish(),
        }
    }
}
