//! Graph Snapshots
//!
//! A serializable picture of a graph's topology and node states, for
//! debugging tools and tests. Edges are listed by label.

use serde::{Deserialize, Serialize};

use crate::graph::{NodeKind, NodeState};
use crate::reactive::{Graph, Trigger};

/// One node as seen by [`Graph::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: u64,
    pub label: String,
    pub kind: NodeKind,
    pub state: NodeState,
    pub version: u64,
    /// Labels of the sources read during the last evaluation.
    pub dependencies: Vec<String>,
    /// Labels of the nodes that read this one.
    pub dependents: Vec<String>,
    pub evaluations: u64,
    pub invalidations: u64,
    /// Set for sinks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
}

/// Every node of a graph, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeSnapshot>,
}

impl GraphSnapshot {
    /// Parse a snapshot from a JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Find a node by label.
    pub fn node(&self, label: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|node| node.label == label)
    }
}

impl Graph {
    /// Capture the current topology and node states.
    pub fn snapshot(&self) -> GraphSnapshot {
        let scheduler = self.scheduler.borrow();
        let nodes = scheduler
            .nodes()
            .map(|node| NodeSnapshot {
                id: node.id().raw(),
                label: node.label().to_string(),
                kind: node.kind(),
                state: node.state(),
                version: node.version(),
                dependencies: node
                    .dependencies()
                    .keys()
                    .map(|id| scheduler.label_of(*id))
                    .collect(),
                dependents: node
                    .dependents()
                    .iter()
                    .map(|id| scheduler.label_of(*id))
                    .collect(),
                evaluations: node.evaluations(),
                invalidations: node.invalidations(),
                trigger: node.trigger(),
            })
            .collect();
        GraphSnapshot { nodes }
    }
}
