//! Evaluation Context
//!
//! The evaluation context tracks which node is currently being evaluated.
//! This enables automatic dependency tracking: when a source is read, it is
//! recorded in the frame on top of the stack.
//!
//! # Implementation
//!
//! Each graph owns its own stack, so independent sessions never see each
//! other's evaluations. Before a node's evaluator runs we push a fresh frame;
//! when it returns we pop it and the recorded reads become the node's new
//! dependency set.
//!
//! This design supports nested evaluations (e.g., a computed node that reads
//! another computed node), and it is how re-entry is detected: a node that is
//! already on the stack is being evaluated, so reading it again is a cycle.

use smallvec::SmallVec;

use super::Graph;
use crate::graph::NodeId;

/// An entry in the evaluation stack.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    /// The node being evaluated.
    pub node: NodeId,
    /// Sources read so far, in first-read order, without duplicates.
    pub reads: SmallVec<[NodeId; 8]>,
    /// Set when this evaluation turned out to be part of a cycle. The
    /// evaluation then fails even if the evaluator swallowed the error.
    pub cycle: Option<Vec<String>>,
}

/// Stack of in-progress evaluations for one graph.
#[derive(Debug, Default)]
pub(crate) struct EvalStack {
    frames: Vec<Frame>,
}

impl EvalStack {
    pub fn push(&mut self, node: NodeId) {
        self.frames.push(Frame {
            node,
            reads: SmallVec::new(),
            cycle: None,
        });
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Check if any evaluation is in progress.
    pub fn is_active(&self) -> bool {
        !self.frames.is_empty()
    }

    /// The node currently being evaluated, if any.
    pub fn current(&self) -> Option<NodeId> {
        self.frames.last().map(|frame| frame.node)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Record a read of `source` in the innermost frame.
    pub fn track(&mut self, source: NodeId) {
        if let Some(frame) = self.frames.last_mut() {
            if !frame.reads.contains(&source) {
                frame.reads.push(source);
            }
        }
    }

    /// Stack position of `node`'s frame if it is being evaluated.
    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.frames.iter().position(|frame| frame.node == node)
    }

    /// Nodes from `position` to the top of the stack.
    pub fn nodes_from(&self, position: usize) -> Vec<NodeId> {
        self.frames[position..].iter().map(|frame| frame.node).collect()
    }

    /// Mark every frame from `position` upwards as part of `path`.
    pub fn poison_from(&mut self, position: usize, path: &[String]) {
        for frame in &mut self.frames[position..] {
            frame.cycle.get_or_insert_with(|| path.to_vec());
        }
    }
}

/// Guard that pops the frame when dropped.
///
/// On the normal path [`finish`](EvalGuard::finish) hands the frame back.
/// If the evaluator panics, the drop pops the frame and returns the node to
/// dirty so the graph is left consistent.
pub(crate) struct EvalGuard<'g> {
    graph: &'g Graph,
    node: NodeId,
    armed: bool,
}

impl<'g> EvalGuard<'g> {
    /// Push a fresh frame for `node` onto the graph's stack.
    pub fn enter(graph: &'g Graph, node: NodeId) -> Self {
        graph.stack.borrow_mut().push(node);
        Self {
            graph,
            node,
            armed: true,
        }
    }

    /// Pop the frame, returning what it recorded.
    pub fn finish(mut self) -> Frame {
        self.armed = false;
        let frame = self.graph.stack.borrow_mut().pop();
        match frame {
            Some(frame) => {
                debug_assert_eq!(
                    frame.node, self.node,
                    "EvalGuard mismatch: expected {:?}, got {:?}",
                    self.node, frame.node
                );
                frame
            }
            None => Frame {
                node: self.node,
                reads: SmallVec::new(),
                cycle: None,
            },
        }
    }
}

impl Drop for EvalGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut stack) = self.graph.stack.try_borrow_mut() {
            stack.pop();
        }
        if let Ok(mut scheduler) = self.graph.scheduler.try_borrow_mut() {
            scheduler.abandon(self.node);
        }
    }
}
