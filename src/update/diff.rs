//! Diffing requested edge mutations against stored edge lists

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cache::{DirectEdge, Direction, GraphNodeResult, NodeEdges};
use crate::graph::{Graph, GraphEdge};
use crate::storage::Attributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    Put,
    Delete,
}

/// Requested mutation layered onto a structural edge
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEdge {
    pub context: String,
    pub action: UpdateAction,
    pub payload: Option<Attributes>,
}

/// Working state of one node while an update is planned
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateNode {
    pub forward: NodeEdges,
    pub back: NodeEdges,
    pub needs_forward_update: bool,
    pub needs_forward_invalidate: bool,
    pub needs_back_update: bool,
    pub needs_back_invalidate: bool,
}

impl UpdateNode {
    pub fn row(&self, direction: Direction) -> &NodeEdges {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Back => &self.back,
        }
    }

    pub fn needs_update(&self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.needs_forward_update,
            Direction::Back => self.needs_back_update,
        }
    }

    pub fn needs_invalidate(&self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.needs_forward_invalidate,
            Direction::Back => self.needs_back_invalidate,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.needs_forward_update || self.needs_back_update
    }

    /// Apply one mutation to the row of `direction`, flagging it when its
    /// edge list changed and flagging invalidation when its target set did.
    /// Returns whether anything changed.
    fn apply(&mut self, direction: Direction, edge: DirectEdge, action: UpdateAction) -> bool {
        let row = match direction {
            Direction::Forward => &mut self.forward,
            Direction::Back => &mut self.back,
        };
        let target_set_changed = match action {
            UpdateAction::Put => {
                if row.contains(&edge) {
                    return false;
                }
                let had_target = row.edges.iter().any(|e| e.target == edge.target);
                row.edges.push(edge);
                !had_target
            }
            UpdateAction::Delete => {
                if !row.contains(&edge) {
                    return false;
                }
                row.edges.retain(|e| *e != edge);
                !row.edges.iter().any(|e| e.target == edge.target)
            }
        };

        match direction {
            Direction::Forward => {
                self.needs_forward_update = true;
                self.needs_forward_invalidate |= target_set_changed;
            }
            Direction::Back => {
                self.needs_back_update = true;
                self.needs_back_invalidate |= target_set_changed;
            }
        }
        true
    }
}

pub type GraphOfUpdates = Graph<UpdateNode, UpdateEdge>;

/// One directed edge mutation as requested by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeMutation {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub context: String,
    pub action: UpdateAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Attributes>,
}

impl EdgeMutation {
    pub fn put(from: impl Into<String>, to: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            context: context.into(),
            action: UpdateAction::Put,
            payload: None,
        }
    }

    pub fn delete(from: impl Into<String>, to: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            action: UpdateAction::Delete,
            ..Self::put(from, to, context)
        }
    }

    pub fn with_payload(mut self, payload: Attributes) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Mutations in request order as a graph of updates
pub fn graph_of_updates(mutations: impl IntoIterator<Item = EdgeMutation>) -> GraphOfUpdates {
    let mut graph = Graph::new(true);
    for mutation in mutations {
        graph.add_edge(GraphEdge::new(
            mutation.from,
            mutation.to,
            UpdateEdge {
                context: mutation.context,
                action: mutation.action,
                payload: mutation.payload,
            },
        ));
    }
    graph
}

/// Replay the requested edges, in order, over the current rows of their
/// endpoints. The result keeps only edges that change at least one side,
/// plus puts carrying a payload, and the nodes they touch with their
/// updated rows and flags.
pub fn diff_updates(graph: &GraphOfUpdates, current: &[GraphNodeResult]) -> GraphOfUpdates {
    let mut nodes: BTreeMap<String, UpdateNode> = current
        .iter()
        .map(|result| {
            (
                result.key.clone(),
                UpdateNode {
                    forward: result.forward.clone(),
                    back: result.back.clone(),
                    ..UpdateNode::default()
                },
            )
        })
        .collect();

    let mut kept = Vec::new();
    for edge in graph.edges() {
        let forward_changed = nodes.entry(edge.from.clone()).or_default().apply(
            Direction::Forward,
            DirectEdge::new(edge.to.clone(), edge.data.context.clone()),
            edge.data.action,
        );
        let back_changed = nodes.entry(edge.to.clone()).or_default().apply(
            Direction::Back,
            DirectEdge::new(edge.from.clone(), edge.data.context.clone()),
            edge.data.action,
        );
        let payload_write = edge.data.action == UpdateAction::Put && edge.data.payload.is_some();
        if forward_changed || back_changed || payload_write {
            kept.push(edge.clone());
        }
    }

    let touched: BTreeSet<String> = kept
        .iter()
        .flat_map(|e: &GraphEdge<UpdateEdge>| [e.from.clone(), e.to.clone()])
        .collect();
    let nodes = nodes.into_iter().filter(|(key, _)| touched.contains(key));
    Graph::from_parts(nodes, kept, true)
}
