//! Read-through caches over the graph rows of a store

pub mod deferred;
pub mod edge_data;
pub mod graph_data;
pub mod node_data;

pub use deferred::DeferredCache;
pub use edge_data::{DependencyEdge, EdgeKey, GraphEdgeData};
pub use graph_data::{FetchOptions, GraphCacheData};
pub use node_data::{CacheEdge, DirectEdge, Direction, GraphNodeData, GraphNodeResult, NodeEdges};
