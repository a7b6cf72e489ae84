//! Transactional graph updates
//!
//! A batch of edge mutations is diffed against the stored rows of every node
//! it touches. Rows whose edge list changes are rewritten under a condition
//! on the `updatedAt` stamp that was read, together with the payload row of
//! each changed edge, in one store transaction. Batches too large for one
//! transaction are partitioned first; conflicts drop the cached rows of the
//! batch and retry it with exponential backoff.

pub mod diff;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::PoisonError;

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{DirectEdge, Direction, EdgeKey, GraphNodeResult, NodeEdges};
use crate::error::{GraphError, Result};
use crate::graph::{karger_stein, Graph};
use crate::storage::{
    next_timestamp, timestamp, validate_node_key, Attributes, Condition, Item, ItemKey, WriteRequest,
};
use crate::store::GraphStore;

pub use diff::{diff_updates, graph_of_updates, EdgeMutation, GraphOfUpdates, UpdateAction, UpdateEdge, UpdateNode};

/// Replace the edges of one node in one direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetEdgesRequest {
    pub key: String,
    #[serde(default)]
    pub direction: Direction,
    pub edges: Vec<DirectEdge>,
    /// Only replace edges carrying this context; others are left alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl SetEdgesRequest {
    pub fn new(key: impl Into<String>, direction: Direction, edges: Vec<DirectEdge>) -> Self {
        Self {
            key: key.into(),
            direction,
            edges,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    fn in_scope(&self, edge: &DirectEdge) -> bool {
        self.context.as_ref().map_or(true, |c| edge.context == *c)
    }

    fn mutation(&self, edge: &DirectEdge, action: UpdateAction) -> EdgeMutation {
        let (from, to) = match self.direction {
            Direction::Forward => (self.key.clone(), edge.target.clone()),
            Direction::Back => (edge.target.clone(), self.key.clone()),
        };
        EdgeMutation {
            from,
            to,
            context: edge.context.clone(),
            action,
            payload: None,
        }
    }
}

impl GraphStore {
    /// Apply edge mutations, keeping both halves of every edge consistent.
    /// Either every affected row is written or the call fails.
    pub async fn update_graph_storage(&self, mutations: Vec<EdgeMutation>) -> Result<()> {
        for mutation in &mutations {
            validate_node_key(&mutation.from)?;
            validate_node_key(&mutation.to)?;
        }
        if mutations.is_empty() {
            return Ok(());
        }
        self.update_graph_storage_batch(graph_of_updates(mutations)).await
    }

    /// Make the edges of each node/direction exactly the given set, issuing
    /// only the puts and deletes that differ from what is stored
    pub async fn set_edges(&self, requests: Vec<SetEdgesRequest>) -> Result<()> {
        let keys: Vec<String> = requests
            .iter()
            .map(|r| r.key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for key in &keys {
            validate_node_key(key)?;
        }

        let current: BTreeMap<String, GraphNodeResult> = self
            .nodes
            .get(&keys)
            .await?
            .into_iter()
            .map(|result| (result.key.clone(), result))
            .collect();

        let mut mutations = Vec::new();
        for request in &requests {
            if let Some(stray) = request.edges.iter().find(|e| !request.in_scope(e)) {
                return Err(GraphError::InvalidRequest(format!(
                    "edge to {} has context {:?} outside of {:?}",
                    stray.target, stray.context, request.context
                )));
            }
            let existing: BTreeSet<&DirectEdge> = current
                .get(&request.key)
                .map(|result| {
                    result
                        .direction(request.direction)
                        .edges
                        .iter()
                        .filter(|e| request.in_scope(e))
                        .collect()
                })
                .unwrap_or_default();
            let desired: BTreeSet<&DirectEdge> = request.edges.iter().collect();

            for edge in desired.difference(&existing) {
                mutations.push(request.mutation(edge, UpdateAction::Put));
            }
            for edge in existing.difference(&desired) {
                mutations.push(request.mutation(edge, UpdateAction::Delete));
            }
        }

        if mutations.is_empty() {
            debug!(requests = requests.len(), "edge sets already current");
            return Ok(());
        }
        self.update_graph_storage(mutations).await
    }

    /// Commit one graph of updates, retrying on conflict
    pub fn update_graph_storage_batch(&self, graph: GraphOfUpdates) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                match self.apply_batch(&graph).await {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_retryable() => {
                        for key in graph.all_keys() {
                            self.nodes.invalidate(&key);
                        }
                        if attempt >= self.config.max_retries {
                            warn!(attempts = attempt, error = %e, "giving up on graph update");
                            return Err(GraphError::RetriesExhausted {
                                attempts: attempt,
                                last: e.to_string(),
                            });
                        }
                        let delay = self.config.retry_delay(attempt);
                        warn!(attempt, ?delay, error = %e, "graph update conflicted, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        .boxed()
    }

    async fn apply_batch(&self, graph: &GraphOfUpdates) -> Result<()> {
        let keys: Vec<String> = graph.all_keys().into_iter().collect();
        let current = self.nodes.get(&keys).await?;
        let diffed = diff_updates(graph, &current);
        if diffed.edge_count() == 0 {
            debug!(requested = graph.edge_count(), "graph update is a no-op");
            return Ok(());
        }

        let threshold = self.config.transaction_threshold;
        if diffed.size() < threshold {
            return self.commit(&diffed).await;
        }

        let partition = {
            let mut random = self.random.lock().unwrap_or_else(PoisonError::into_inner);
            karger_stein(&diffed, threshold, self.config.partition_passes, random.as_mut())
        };

        let progress = partition.cut_set.edge_count() < diffed.edge_count()
            && partition.sub_graphs.iter().all(|g| g.size() < threshold);
        if !progress {
            // Three slots per edge always fit: the edge and both endpoints
            let per_chunk = ((threshold - 1) / 3).max(1);
            info!(
                edges = diffed.edge_count(),
                per_chunk, "update graph cannot be contracted, committing in chunks"
            );
            for chunk in diffed.edges().chunks(per_chunk) {
                let mut piece = Graph::new(true);
                for edge in chunk {
                    piece.add_edge(edge.clone());
                }
                self.update_graph_storage_batch(piece).await?;
            }
            return Ok(());
        }

        let sub_graphs = pack_sub_graphs(
            partition.sub_graphs.into_iter().filter(|g| g.edge_count() > 0),
            threshold,
        );
        info!(
            size = diffed.size(),
            sub_graphs = sub_graphs.len(),
            cut = partition.cut_set.edge_count(),
            "splitting graph update"
        );

        // Sub-graphs share no nodes; the cut set may touch any of them
        let results = join_all(sub_graphs.into_iter().map(|g| self.update_graph_storage_batch(g))).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        if partition.cut_set.edge_count() > 0 {
            self.update_graph_storage_batch(partition.cut_set).await?;
        }
        Ok(())
    }

    async fn commit(&self, diffed: &GraphOfUpdates) -> Result<()> {
        let now = timestamp();
        let mut requests = Vec::new();
        let mut rows: Vec<(String, Direction, NodeEdges)> = Vec::new();

        for (key, node) in diffed.nodes() {
            for direction in Direction::BOTH {
                if !node.needs_update(direction) {
                    continue;
                }
                let read = node.row(direction);
                let mut row = read.clone();
                let updated_at = next_timestamp(read.updated_at);
                row.updated_at = Some(updated_at);

                let mut set = Attributes::new();
                set.insert("edges".into(), serde_json::to_value(&row.edges)?);
                set.insert("updatedAt".into(), Value::from(updated_at));
                if node.needs_invalidate(direction) {
                    let invalidated_at = read.cached_at.map_or(now, |cached| cached.max(now));
                    row.invalidated_at = Some(invalidated_at);
                    set.insert("invalidatedAt".into(), Value::from(invalidated_at));
                }

                requests.push(WriteRequest::Update {
                    key: ItemKey::new(key.clone(), direction.data_category()),
                    set,
                    remove: Vec::new(),
                    conditions: vec![Condition::equals("updatedAt", read.updated_at.map(Value::from))],
                });
                rows.push((key.clone(), direction, row));
            }
        }

        for edge in diffed.edges() {
            let item_key = EdgeKey::new(edge.from.clone(), edge.to.clone(), edge.data.context.clone()).item_key();
            requests.push(match edge.data.action {
                UpdateAction::Put => {
                    WriteRequest::Put(Item::new(item_key, edge.data.payload.clone().unwrap_or_default()))
                }
                UpdateAction::Delete => WriteRequest::Delete(item_key),
            });
        }

        info!(
            rows = rows.len(),
            edges = diffed.edge_count(),
            items = requests.len(),
            "committing graph update"
        );
        self.store.transact_write(requests).await?;

        for (key, direction, row) in rows {
            self.nodes.set(&key, direction, row);
        }
        for edge in diffed.edges() {
            let key = EdgeKey::new(edge.from.clone(), edge.to.clone(), edge.data.context.clone());
            match edge.data.action {
                UpdateAction::Put => self.edges.set(key, edge.data.payload.clone().unwrap_or_default()),
                UpdateAction::Delete => self.edges.set(key, Attributes::new()),
            }
        }

        for direction in Direction::BOTH {
            let changed: Vec<String> = diffed
                .nodes()
                .iter()
                .filter(|(_, node)| node.needs_invalidate(direction))
                .map(|(key, _)| key.clone())
                .collect();
            if !changed.is_empty() {
                self.invalidate_upstream(changed, direction, now).await?;
            }
        }
        Ok(())
    }

    /// Stamp `invalidatedAt` on the `direction` row of every node whose
    /// closure in `direction` runs through one of `changed`. The rows of
    /// `changed` themselves were stamped by the commit.
    ///
    /// The walk runs over the rows as committed: an upstream node whose
    /// path was cut by this batch is still reached from the node that lost
    /// the edge.
    async fn invalidate_upstream(&self, changed: Vec<String>, direction: Direction, at: u64) -> Result<()> {
        let mut seen: BTreeSet<String> = changed.iter().cloned().collect();
        let mut frontier = changed;
        let mut upstream = Vec::new();
        while !frontier.is_empty() {
            let rows = self.nodes.get(&frontier).await?;
            frontier = rows
                .iter()
                .flat_map(|result| result.direction(direction.opposite()).edges.iter())
                .filter(|edge| seen.insert(edge.target.clone()))
                .map(|edge| edge.target.clone())
                .collect();
            upstream.extend(frontier.iter().cloned());
        }
        if upstream.is_empty() {
            return Ok(());
        }

        debug!(nodes = upstream.len(), ?direction, "invalidating upstream closures");
        let stamps = upstream.iter().map(|key| self.stamp_invalidated(key, direction, at));
        join_all(stamps).await.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Raise `invalidatedAt` to at least `at` and past `cachedAt`. Also
    /// applies to rows without a cache so that a write-back computed before
    /// `at` is declined when it lands.
    async fn stamp_invalidated(&self, key: &str, direction: Direction, at: u64) -> Result<()> {
        let item_key = ItemKey::new(key, direction.data_category());
        let reducer = |draft: &mut Attributes| {
            if draft.is_empty() {
                return false;
            }
            let stamp = draft
                .get("cachedAt")
                .and_then(Value::as_u64)
                .map_or(at, |cached| cached.max(at));
            if draft.get("invalidatedAt").and_then(Value::as_u64).map_or(false, |i| i >= stamp) {
                return false;
            }
            draft.insert("invalidatedAt".into(), Value::from(stamp));
            true
        };
        if let Some(item) = self.store.optimistic_update(&item_key, &reducer).await? {
            self.nodes.set(key, direction, NodeEdges::from_attributes(&item.attributes)?);
        }
        Ok(())
    }
}

/// First-fit decreasing: combine node-disjoint sub-graphs into as few
/// pieces as possible, each still below `threshold`
fn pack_sub_graphs(sub_graphs: impl IntoIterator<Item = GraphOfUpdates>, threshold: usize) -> Vec<GraphOfUpdates> {
    let mut sub_graphs: Vec<GraphOfUpdates> = sub_graphs.into_iter().collect();
    sub_graphs.sort_by_key(|g| std::cmp::Reverse(g.size()));

    let mut bins: Vec<(usize, Vec<GraphOfUpdates>)> = Vec::new();
    for graph in sub_graphs {
        let size = graph.size();
        match bins.iter_mut().find(|(used, _)| used + size < threshold) {
            Some((used, members)) => {
                *used += size;
                members.push(graph);
            }
            None => bins.push((size, vec![graph])),
        }
    }
    bins.into_iter()
        .map(|(_, members)| Graph::merge(members, Vec::new()))
        .collect()
}
