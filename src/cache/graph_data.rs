//! Transitive dependency fetch with reachability cache write-back
//!
//! Node rows are pulled in breadth-first waves. A row's stored reachability
//! cache, when still valid, only widens the next frontier so that whole
//! subtrees arrive in one wave; the returned edges always come from direct
//! edge lists. After the walk the closure of every root is compared with its
//! stored cache and rewritten in the background when it changed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::edge_data::{DependencyEdge, EdgeKey, GraphEdgeData};
use super::node_data::{CacheEdge, Direction, GraphNodeData, NodeEdges};
use crate::error::{GraphError, Result};
use crate::graph::{bfs, Graph, GraphEdge};
use crate::storage::{timestamp, Attributes, ItemKey, StoreHandler};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Resolve each edge's payload row
    pub fetch_edges: bool,
}

pub struct GraphCacheData {
    store: Arc<dyn StoreHandler>,
    nodes: Arc<GraphNodeData>,
    edges: Arc<GraphEdgeData>,
    write_backs: Mutex<Vec<JoinHandle<Result<()>>>>,
}

/// Orient a stored direct edge of `key` as a true `from -> to` pair
fn orient<'a>(key: &'a str, target: &'a str, direction: Direction) -> (&'a str, &'a str) {
    match direction {
        Direction::Forward => (key, target),
        Direction::Back => (target, key),
    }
}

/// Every edge reachable from `root` over the fetched rows, sorted
fn closure_of(root: &str, rows: &BTreeMap<String, NodeEdges>, direction: Direction) -> Vec<CacheEdge> {
    let reached = bfs(&[root.to_string()], usize::MAX, |key: &String| {
        rows.get(key)
            .map(|row| row.edges.iter().map(|e| e.target.clone()).collect())
            .unwrap_or_default()
    });

    let mut closure: BTreeSet<CacheEdge> = BTreeSet::new();
    for key in &reached {
        if let Some(row) = rows.get(key) {
            for edge in &row.edges {
                let (from, to) = orient(key, &edge.target, direction);
                closure.insert(CacheEdge {
                    from: from.to_string(),
                    to: to.to_string(),
                    context: edge.context.clone(),
                });
            }
        }
    }
    closure.into_iter().collect()
}

impl GraphCacheData {
    pub fn new(store: Arc<dyn StoreHandler>, nodes: Arc<GraphNodeData>, edges: Arc<GraphEdgeData>) -> Self {
        Self {
            store,
            nodes,
            edges,
            write_backs: Mutex::new(Vec::new()),
        }
    }

    /// Everything reachable from `roots` in `direction`, as a directional
    /// graph with edges in true orientation
    pub async fn get(
        &self,
        roots: &[String],
        direction: Direction,
        options: FetchOptions,
    ) -> Result<Graph<(), DependencyEdge>> {
        let computed_at = timestamp();
        let roots: Vec<String> = roots.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();

        let mut rows: BTreeMap<String, NodeEdges> = BTreeMap::new();
        let mut frontier = roots.clone();
        let mut waves = 0;
        while !frontier.is_empty() {
            waves += 1;
            let mut next: BTreeSet<String> = BTreeSet::new();
            for result in self.nodes.get(&frontier).await? {
                let row = result.direction(direction).clone();
                next.extend(row.edges.iter().map(|e| e.target.clone()));
                if let Some(cache) = row.valid_cache() {
                    for entry in cache {
                        next.insert(entry.from.clone());
                        next.insert(entry.to.clone());
                    }
                }
                rows.insert(result.key, row);
            }
            frontier = next.into_iter().filter(|key| !rows.contains_key(key)).collect();
        }
        debug!(roots = roots.len(), nodes = rows.len(), waves, ?direction, "fetched dependency graph");

        // Nodes only pulled in through a stale cache are left out
        let reachable: BTreeSet<String> = bfs(&roots, usize::MAX, |key: &String| {
            rows.get(key)
                .map(|row| row.edges.iter().map(|e| e.target.clone()).collect())
                .unwrap_or_default()
        })
        .into_iter()
        .collect();

        let mut edges: Vec<GraphEdge<DependencyEdge>> = Vec::new();
        for (key, row) in rows.iter().filter(|(key, _)| reachable.contains(*key)) {
            for edge in &row.edges {
                let (from, to) = orient(key, &edge.target, direction);
                edges.push(GraphEdge::new(
                    from,
                    to,
                    DependencyEdge {
                        context: edge.context.clone(),
                        payload: None,
                    },
                ));
            }
        }
        if options.fetch_edges {
            let keys: Vec<EdgeKey> = edges
                .iter()
                .map(|e| EdgeKey::new(e.from.clone(), e.to.clone(), e.data.context.clone()))
                .collect();
            edges = self.edges.get(&keys).await?;
        }

        for root in &roots {
            let closure = closure_of(root, &rows, direction);
            let stored = rows.get(root).and_then(|row| row.valid_cache()).unwrap_or(&[]);
            if stored != closure.as_slice() {
                self.schedule_write_back(root, direction, closure, computed_at)?;
            }
        }

        let mut graph = Graph::new(true);
        for key in reachable {
            graph.insert_node(key, ());
        }
        for edge in edges {
            graph.add_edge(edge);
        }
        Ok(graph)
    }

    /// Store `closure` as the reachability cache of `root` unless the row
    /// was re-cached or invalidated since `computed_at`
    fn schedule_write_back(
        &self,
        root: &str,
        direction: Direction,
        closure: Vec<CacheEdge>,
        computed_at: u64,
    ) -> Result<()> {
        let cache = serde_json::to_value(&closure)?;
        let store = Arc::clone(&self.store);
        let nodes = Arc::clone(&self.nodes);
        let root = root.to_string();

        let handle = tokio::spawn(async move {
            let key = ItemKey::new(root.clone(), direction.data_category());
            let reducer = move |draft: &mut Attributes| {
                let newer = |name: &str| {
                    draft
                        .get(name)
                        .and_then(Value::as_u64)
                        .map_or(false, |at| at >= computed_at)
                };
                if newer("cachedAt") || newer("invalidatedAt") {
                    return false;
                }
                draft.insert("cache".into(), cache.clone());
                draft.insert("cachedAt".into(), Value::from(computed_at));
                true
            };
            if let Some(item) = store.optimistic_update(&key, &reducer).await? {
                nodes.set(&root, direction, NodeEdges::from_attributes(&item.attributes)?);
            }
            debug!(root = %root, ?direction, "reachability cache written");
            Ok(())
        });

        let mut write_backs = self.write_backs.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap settled write-backs
        write_backs.retain_mut(|pending| {
            if !pending.is_finished() {
                return true;
            }
            match pending.now_or_never() {
                Some(Ok(Err(e))) => warn!(error = %e, "cache write-back failed"),
                Some(Err(e)) => warn!(error = %e, "cache write-back task failed"),
                _ => {}
            }
            false
        });
        write_backs.push(handle);
        Ok(())
    }

    /// Number of write-backs scheduled and not yet reaped or flushed
    pub fn pending_write_backs(&self) -> usize {
        self.write_backs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait for every pending write-back. Reports the first failure after
    /// all of them have settled; failures of already reaped write-backs were
    /// only logged.
    pub async fn flush(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.write_backs.lock().unwrap_or_else(PoisonError::into_inner));
        let mut first_error = None;
        for handle in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(GraphError::Store(format!("cache write-back task failed: {}", e))),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "cache write-back failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
