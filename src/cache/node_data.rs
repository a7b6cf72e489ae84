//! Cached forward/back edge rows of graph nodes

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DeferredCache;
use crate::error::Result;
use crate::storage::{Attributes, Item, ItemKey, StoreHandler, BACK_CATEGORY, FORWARD_CATEGORY};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Back,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Forward, Direction::Back];

    pub fn data_category(self) -> &'static str {
        match self {
            Direction::Forward => FORWARD_CATEGORY,
            Direction::Back => BACK_CATEGORY,
        }
    }

    pub fn from_data_category(category: &str) -> Option<Self> {
        match category {
            FORWARD_CATEGORY => Some(Direction::Forward),
            BACK_CATEGORY => Some(Direction::Back),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Forward => Direction::Back,
            Direction::Back => Direction::Forward,
        }
    }
}

/// One hop from a node in a given direction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectEdge {
    pub target: String,
    #[serde(default)]
    pub context: String,
}

impl DirectEdge {
    pub fn new(target: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            context: context.into(),
        }
    }
}

/// Entry of a reachability cache, in true edge orientation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub context: String,
}

/// Stored row for one node in one direction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEdges {
    #[serde(default)]
    pub edges: Vec<DirectEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Vec<CacheEdge>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidated_at: Option<u64>,
}

impl NodeEdges {
    pub fn from_attributes(attributes: &Attributes) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(attributes.clone()))?)
    }

    /// Reachability cache, unless it was invalidated after it was computed
    pub fn valid_cache(&self) -> Option<&[CacheEdge]> {
        let cached_at = self.cached_at?;
        if self.invalidated_at.map_or(false, |at| at >= cached_at) {
            return None;
        }
        self.cache.as_deref()
    }

    pub fn targets(&self) -> BTreeSet<&str> {
        self.edges.iter().map(|e| e.target.as_str()).collect()
    }

    pub fn contains(&self, edge: &DirectEdge) -> bool {
        self.edges.contains(edge)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphNodeResult {
    pub key: String,
    pub forward: NodeEdges,
    pub back: NodeEdges,
}

impl GraphNodeResult {
    pub fn direction(&self, direction: Direction) -> &NodeEdges {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Back => &self.back,
        }
    }
}

type NodeKey = (String, Direction);

pub struct GraphNodeData {
    store: Arc<dyn StoreHandler>,
    cache: DeferredCache<NodeKey, NodeEdges>,
}

impl GraphNodeData {
    pub fn new(store: Arc<dyn StoreHandler>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            cache: DeferredCache::new(|_| NodeEdges::default(), ttl),
        }
    }

    /// Both directions of every key, in the order given. One store read is
    /// issued for all rows not already cached or in flight.
    pub async fn get(&self, keys: &[String]) -> Result<Vec<GraphNodeResult>> {
        let store = Arc::clone(&self.store);
        self.cache.add(
            keys.iter()
                .flat_map(|key| Direction::BOTH.map(|direction| (key.clone(), direction))),
            move |rows: Vec<NodeKey>| {
                let item_keys: Vec<ItemKey> = rows
                    .iter()
                    .map(|(key, direction)| ItemKey::new(key.clone(), direction.data_category()))
                    .collect();
                async move {
                    tracing::debug!(rows = item_keys.len(), "fetching graph node rows");
                    store.get_items(&item_keys).await
                }
            },
            |items: Vec<Item>| {
                let mut rows = HashMap::with_capacity(items.len());
                for item in items {
                    if let Some(direction) = Direction::from_data_category(&item.key.data_category) {
                        let edges = NodeEdges::from_attributes(&item.attributes)?;
                        rows.insert((item.key.primary_key, direction), edges);
                    }
                }
                Ok(rows)
            },
        );

        try_join_all(keys.iter().map(|key| self.get_one(key))).await
    }

    async fn get_one(&self, key: &str) -> Result<GraphNodeResult> {
        let forward_key = (key.to_string(), Direction::Forward);
        let back_key = (key.to_string(), Direction::Back);
        let (forward, back) = futures::try_join!(self.cache.get(&forward_key), self.cache.get(&back_key))?;
        Ok(GraphNodeResult {
            key: key.to_string(),
            forward,
            back,
        })
    }

    /// Seed a row known to be current, typically right after writing it
    pub fn set(&self, key: &str, direction: Direction, value: NodeEdges) {
        self.cache.set((key.to_string(), direction), value);
    }

    /// Drop both directions of `key`
    pub fn invalidate(&self, key: &str) {
        for direction in Direction::BOTH {
            self.cache.invalidate(&(key.to_string(), direction));
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn is_cached(&self, key: &str, direction: Direction) -> bool {
        self.cache.is_cached(&(key.to_string(), direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn row(key: &str, direction: Direction, value: Value) -> Item {
        let attributes = match value {
            Value::Object(map) => map,
            _ => Attributes::new(),
        };
        Item::new(ItemKey::new(key, direction.data_category()), attributes)
    }

    #[tokio::test]
    async fn test_get_batches_uncached_rows() {
        let store = Arc::new(MemoryStore::new());
        store.put(row(
            "A",
            Direction::Forward,
            json!({ "edges": [{ "target": "B", "context": "test" }], "updatedAt": 10 }),
        ));
        store.put(row("B", Direction::Back, json!({ "edges": [{ "target": "A", "context": "test" }] })));
        let nodes = GraphNodeData::new(store.clone(), None);

        let results = nodes.get(&["A".to_string(), "B".to_string()]).await.unwrap();
        assert_eq!(results[0].forward.edges, vec![DirectEdge::new("B", "test")]);
        assert_eq!(results[0].forward.updated_at, Some(10));
        assert!(results[0].back.edges.is_empty());
        assert_eq!(results[1].back.targets().into_iter().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(store.stats().get_calls, 1);
        assert_eq!(store.stats().keys_read, 4);

        // Second read of an overlapping set only fetches the new key
        nodes.get(&["B".to_string(), "C".to_string()]).await.unwrap();
        assert_eq!(store.stats().get_calls, 2);
        assert_eq!(store.stats().keys_read, 6);
    }

    #[tokio::test]
    async fn test_unseen_key_defaults_to_empty() {
        let nodes = GraphNodeData::new(Arc::new(MemoryStore::new()), None);
        let results = nodes.get(&["nowhere".to_string()]).await.unwrap();
        assert_eq!(results[0].key, "nowhere");
        assert_eq!(results[0].forward, NodeEdges::default());
        assert_eq!(results[0].back, NodeEdges::default());
    }

    #[tokio::test]
    async fn test_set_and_invalidate() {
        let store = Arc::new(MemoryStore::new());
        let nodes = GraphNodeData::new(store.clone(), None);
        let seeded = NodeEdges {
            edges: vec![DirectEdge::new("Z", "")],
            ..NodeEdges::default()
        };
        nodes.set("A", Direction::Forward, seeded.clone());
        nodes.set("A", Direction::Back, NodeEdges::default());

        let results = nodes.get(&["A".to_string()]).await.unwrap();
        assert_eq!(results[0].forward, seeded);
        assert_eq!(store.stats().get_calls, 0);

        nodes.invalidate("A");
        assert!(!nodes.is_cached("A", Direction::Forward));
        let results = nodes.get(&["A".to_string()]).await.unwrap();
        assert!(results[0].forward.edges.is_empty());
        assert_eq!(store.stats().get_calls, 1);
    }

    #[test]
    fn test_cache_validity() {
        let mut edges = NodeEdges {
            cache: Some(vec![CacheEdge {
                from: "A".into(),
                to: "B".into(),
                context: String::new(),
            }]),
            cached_at: Some(5),
            ..NodeEdges::default()
        };
        assert!(edges.valid_cache().is_some());
        edges.invalidated_at = Some(5);
        assert!(edges.valid_cache().is_none());
        edges.cached_at = Some(6);
        assert!(edges.valid_cache().is_some());
        edges.cached_at = None;
        assert!(edges.valid_cache().is_none());
    }

    #[test]
    fn test_row_serialization_uses_camel_case() {
        let edges = NodeEdges {
            edges: vec![DirectEdge::new("B", "")],
            updated_at: Some(3),
            ..NodeEdges::default()
        };
        assert_eq!(
            serde_json::to_value(&edges).unwrap(),
            json!({ "edges": [{ "target": "B", "context": "" }], "updatedAt": 3 })
        );
    }
}
