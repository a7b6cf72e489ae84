//! Graph store facade: node, edge and transitive caches over one handler

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cache::{
    DependencyEdge, Direction, EdgeKey, FetchOptions, GraphCacheData, GraphEdgeData, GraphNodeData, GraphNodeResult,
};
use crate::config::GraphConfig;
use crate::error::Result;
use crate::graph::{Graph, GraphEdge, RandomSource, RngSource};
use crate::storage::StoreHandler;

/// Entry point for reading and updating the dependency graph. All caches
/// share one store handle, so a write through `update_graph_storage` is
/// visible to later reads without a round trip.
pub struct GraphStore {
    pub(crate) store: Arc<dyn StoreHandler>,
    pub(crate) nodes: Arc<GraphNodeData>,
    pub(crate) edges: Arc<GraphEdgeData>,
    pub(crate) graph: GraphCacheData,
    pub(crate) config: GraphConfig,
    pub(crate) random: Mutex<Box<dyn RandomSource + Send>>,
}

impl GraphStore {
    pub fn new(store: Arc<dyn StoreHandler>, config: GraphConfig) -> Result<Self> {
        Self::with_random_source(store, config, Box::new(RngSource(StdRng::from_entropy())))
    }

    /// Same as `new`, with the partitioning choices drawn from `random`
    pub fn with_random_source(
        store: Arc<dyn StoreHandler>,
        config: GraphConfig,
        random: Box<dyn RandomSource + Send>,
    ) -> Result<Self> {
        config.validate()?;
        let nodes = Arc::new(GraphNodeData::new(Arc::clone(&store), config.cache_ttl));
        let edges = Arc::new(GraphEdgeData::new(Arc::clone(&store), config.cache_ttl));
        let graph = GraphCacheData::new(Arc::clone(&store), Arc::clone(&nodes), Arc::clone(&edges));
        tracing::info!(
            threshold = config.transaction_threshold,
            max_retries = config.max_retries,
            "graph store ready"
        );
        Ok(Self {
            store,
            nodes,
            edges,
            graph,
            config,
            random: Mutex::new(random),
        })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn handler(&self) -> &Arc<dyn StoreHandler> {
        &self.store
    }

    pub fn nodes(&self) -> &GraphNodeData {
        &self.nodes
    }

    pub fn edges(&self) -> &GraphEdgeData {
        &self.edges
    }

    pub fn graph(&self) -> &GraphCacheData {
        &self.graph
    }

    pub async fn get_nodes(&self, keys: &[String]) -> Result<Vec<GraphNodeResult>> {
        self.nodes.get(keys).await
    }

    pub async fn get_edges(&self, keys: &[EdgeKey]) -> Result<Vec<GraphEdge<DependencyEdge>>> {
        self.edges.get(keys).await
    }

    /// Transitive dependencies (`Forward`) or dependents (`Back`) of `roots`
    pub async fn get_graph(
        &self,
        roots: &[String],
        direction: Direction,
        options: FetchOptions,
    ) -> Result<Graph<(), DependencyEdge>> {
        self.graph.get(roots, direction, options).await
    }

    /// Wait for background reachability cache writes
    pub async fn flush(&self) -> Result<()> {
        self.graph.flush().await
    }

    pub fn invalidate(&self, key: &str) {
        self.nodes.invalidate(key);
    }

    /// Drop every cached row
    pub fn clear(&self) {
        self.nodes.clear();
        self.edges.clear();
        tracing::info!("graph caches cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::storage::MemoryStore;

    #[test]
    fn test_rejects_invalid_config() {
        let config = GraphConfig::default().with_transaction_threshold(2);
        let result = GraphStore::new(Arc::new(MemoryStore::new()), config);
        assert!(matches!(result, Err(GraphError::InvalidThreshold(2))));
    }

    #[tokio::test]
    async fn test_clear_forces_refetch() {
        let handler = Arc::new(MemoryStore::new());
        let store = GraphStore::new(handler.clone(), GraphConfig::default()).unwrap();
        let keys = vec!["A".to_string()];

        store.get_nodes(&keys).await.unwrap();
        store.get_nodes(&keys).await.unwrap();
        assert_eq!(handler.stats().get_calls, 1);

        store.clear();
        store.get_nodes(&keys).await.unwrap();
        assert_eq!(handler.stats().get_calls, 2);
    }
}
