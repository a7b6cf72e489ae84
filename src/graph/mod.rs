//! In-memory graph structure shared by the caches, the cascade engine and
//! the update orchestrator.
//!
//! Nodes live in a map keyed by their string identifier and edges in a flat
//! list, so cycles need no special representation: every reference between
//! nodes is a key lookup.

pub mod cascade;
pub mod partition;
pub mod traversal;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

pub use cascade::{CascadeGraph, CascadeNode, CascadePrior, CircularArgs, ProcessArgs};
pub use partition::{karger_stein, Partition, RandomSource, RngSource};
pub use traversal::{bfs, WalkResult, WalkStep};

/// Edge between two nodes carrying typed data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge<E> {
    pub from: String,
    pub to: String,
    pub data: E,
}

impl<E> GraphEdge<E> {
    pub fn new(from: impl Into<String>, to: impl Into<String>, data: E) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            data,
        }
    }

    /// Does this edge touch `key` at either end
    pub fn touches(&self, key: &str) -> bool {
        self.from == key || self.to == key
    }
}

/// Read-only view of a node together with its incident edges
#[derive(Debug)]
pub struct NodeView<'a, N, E> {
    pub key: &'a str,
    pub data: &'a N,
    /// Outgoing edges. For non-directional graphs: every edge touching the node.
    pub edges: Vec<&'a GraphEdge<E>>,
    /// Incoming edges. For non-directional graphs: every edge touching the node.
    pub back_edges: Vec<&'a GraphEdge<E>>,
}

/// Adjacency-list graph keyed by string identifiers
#[derive(Debug, Clone)]
pub struct Graph<N, E> {
    nodes: BTreeMap<String, N>,
    edges: Vec<GraphEdge<E>>,
    directional: bool,

    // Generation order is computed lazily and dropped on every structural change
    generations: OnceLock<Vec<Vec<Vec<String>>>>,
}

impl<N, E> Default for Graph<N, E> {
    fn default() -> Self {
        Self::new(true)
    }
}

impl<N, E> Graph<N, E> {
    pub fn new(directional: bool) -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            directional,
            generations: OnceLock::new(),
        }
    }

    /// Build a graph from raw parts. Edges may reference keys that are not in
    /// `nodes`; ordering operations report those as `NodeNotFound`.
    pub fn from_parts(
        nodes: impl IntoIterator<Item = (String, N)>,
        edges: Vec<GraphEdge<E>>,
        directional: bool,
    ) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            edges,
            directional,
            generations: OnceLock::new(),
        }
    }

    pub fn is_directional(&self) -> bool {
        self.directional
    }

    pub fn nodes(&self) -> &BTreeMap<String, N> {
        &self.nodes
    }

    pub fn edges(&self) -> &[GraphEdge<E>] {
        &self.edges
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Combined node + edge count, the unit transaction limits are measured in
    pub fn size(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn node_data(&self, key: &str) -> Option<&N> {
        self.nodes.get(key)
    }

    pub fn get_node(&self, key: &str) -> Option<NodeView<'_, N, E>> {
        let (key, data) = self.nodes.get_key_value(key)?;
        let (edges, back_edges) = if self.directional {
            (
                self.edges.iter().filter(|e| e.from == *key).collect(),
                self.edges.iter().filter(|e| e.to == *key).collect(),
            )
        } else {
            let touching: Vec<_> = self.edges.iter().filter(|e| e.touches(key)).collect();
            (touching.clone(), touching)
        };
        Some(NodeView {
            key,
            data,
            edges,
            back_edges,
        })
    }

    /// Keys reachable in one hop from `key` (following edge direction when
    /// the graph is directional).
    pub fn successors(&self, key: &str) -> Vec<&str> {
        let mut out = Vec::new();
        for edge in &self.edges {
            if edge.from == key {
                out.push(edge.to.as_str());
            } else if !self.directional && edge.to == key {
                out.push(edge.from.as_str());
            }
        }
        out
    }

    /// Keys with an edge into `key`
    pub fn predecessors(&self, key: &str) -> Vec<&str> {
        let mut out = Vec::new();
        for edge in &self.edges {
            if edge.to == key {
                out.push(edge.from.as_str());
            } else if !self.directional && edge.from == key {
                out.push(edge.to.as_str());
            }
        }
        out
    }

    /// Insert or replace a node's data
    pub fn insert_node(&mut self, key: impl Into<String>, data: N) {
        self.nodes.insert(key.into(), data);
        self.generations = OnceLock::new();
    }

    pub fn remove_edges_where(&mut self, mut predicate: impl FnMut(&GraphEdge<E>) -> bool) {
        self.edges.retain(|e| !predicate(e));
        self.generations = OnceLock::new();
    }

    /// Same edges pointing the other way
    pub fn reverse(&self) -> Self
    where
        N: Clone,
        E: Clone,
    {
        Self {
            nodes: self.nodes.clone(),
            edges: self
                .edges
                .iter()
                .map(|e| GraphEdge {
                    from: e.to.clone(),
                    to: e.from.clone(),
                    data: e.data.clone(),
                })
                .collect(),
            directional: self.directional,
            generations: OnceLock::new(),
        }
    }

    /// Induced subgraph over `keys`: those nodes plus every edge whose both
    /// endpoints are among them.
    pub fn filter<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> Self
    where
        N: Clone,
        E: Clone,
    {
        let keep: HashSet<&str> = keys.into_iter().collect();
        Self {
            nodes: self
                .nodes
                .iter()
                .filter(|(k, _)| keep.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            edges: self
                .edges
                .iter()
                .filter(|e| keep.contains(e.from.as_str()) && keep.contains(e.to.as_str()))
                .cloned()
                .collect(),
            directional: self.directional,
            generations: OnceLock::new(),
        }
    }
}

impl<N: Default, E> Graph<N, E> {
    /// Merge-patch a node, creating it with default data first if absent
    pub fn set_node(&mut self, key: &str, patch: impl FnOnce(&mut N)) {
        if !self.nodes.contains_key(key) {
            self.generations = OnceLock::new();
        }
        patch(self.nodes.entry(key.to_string()).or_default());
    }

    /// Add an edge, creating default nodes for endpoints not yet present
    pub fn add_edge(&mut self, edge: GraphEdge<E>) {
        self.nodes.entry(edge.from.clone()).or_default();
        self.nodes.entry(edge.to.clone()).or_default();
        self.edges.push(edge);
        self.generations = OnceLock::new();
    }
}

impl<N: Clone + Default, E: Clone + PartialEq> Graph<N, E> {
    /// Union of node sets plus deduplicated union of edges (including
    /// `connecting` edges). Earlier graphs win on node data conflicts.
    pub fn merge(graphs: impl IntoIterator<Item = Self>, connecting: Vec<GraphEdge<E>>) -> Self {
        let mut merged: Option<Self> = None;
        for graph in graphs {
            match merged.as_mut() {
                None => merged = Some(graph),
                Some(target) => {
                    for (key, data) in graph.nodes {
                        target.nodes.entry(key).or_insert(data);
                    }
                    for edge in graph.edges {
                        target.push_unique(edge);
                    }
                }
            }
        }
        let mut merged = merged.unwrap_or_default();
        for edge in connecting {
            merged.nodes.entry(edge.from.clone()).or_default();
            merged.nodes.entry(edge.to.clone()).or_default();
            merged.push_unique(edge);
        }
        merged.generations = OnceLock::new();
        merged
    }

    fn push_unique(&mut self, edge: GraphEdge<E>) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }
}

impl<N, E> Graph<N, E> {
    /// Keys of every node appearing as a node or an edge endpoint
    pub fn all_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self.nodes.keys().cloned().collect();
        for edge in &self.edges {
            keys.insert(edge.from.clone());
            keys.insert(edge.to.clone());
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Graph<u32, &'static str> {
        let mut graph = Graph::new(true);
        graph.add_edge(GraphEdge::new("A", "B", "ab"));
        graph.add_edge(GraphEdge::new("B", "C", "bc"));
        graph
    }

    #[test]
    fn test_add_edge_creates_default_nodes() {
        let graph = chain();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.node_data("C"), Some(&0));
        assert_eq!(graph.size(), 5);
    }

    #[test]
    fn test_get_node_directional() {
        let graph = chain();
        let b = graph.get_node("B").unwrap();
        assert_eq!(b.edges.len(), 1);
        assert_eq!(b.edges[0].to, "C");
        assert_eq!(b.back_edges.len(), 1);
        assert_eq!(b.back_edges[0].from, "A");
        assert!(graph.get_node("Z").is_none());
    }

    #[test]
    fn test_get_node_non_directional_ignores_orientation() {
        let mut graph: Graph<u32, ()> = Graph::new(false);
        graph.add_edge(GraphEdge::new("A", "B", ()));
        graph.add_edge(GraphEdge::new("C", "B", ()));

        let b = graph.get_node("B").unwrap();
        assert_eq!(b.edges.len(), 2);
        assert_eq!(b.back_edges.len(), 2);
        let a = graph.get_node("A").unwrap();
        assert_eq!(a.back_edges.len(), 1);
    }

    #[test]
    fn test_set_node_merge_patch() {
        let mut graph = chain();
        graph.set_node("B", |n| *n += 5);
        graph.set_node("B", |n| *n += 1);
        graph.set_node("D", |n| *n = 9);
        assert_eq!(graph.node_data("B"), Some(&6));
        assert_eq!(graph.node_data("D"), Some(&9));
    }

    #[test]
    fn test_merge_deduplicates_edges() {
        let left = chain();
        let mut right: Graph<u32, &'static str> = Graph::new(true);
        right.add_edge(GraphEdge::new("B", "C", "bc"));
        right.add_edge(GraphEdge::new("C", "D", "cd"));

        let merged = Graph::merge(vec![left, right], vec![GraphEdge::new("D", "E", "de")]);
        assert_eq!(merged.node_count(), 5);
        assert_eq!(merged.edge_count(), 4);
    }

    #[test]
    fn test_filter_induced_subgraph() {
        let graph = chain();
        let sub = graph.filter(["A", "B"]);
        assert_eq!(sub.node_count(), 2);
        assert_eq!(sub.edge_count(), 1);
        assert_eq!(sub.edges()[0].data, "ab");
    }

    #[test]
    fn test_reverse() {
        let reversed = chain().reverse();
        assert_eq!(reversed.successors("C"), vec!["B"]);
        assert_eq!(reversed.predecessors("A"), vec!["B"]);
    }
}
