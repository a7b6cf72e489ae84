//! Cached payloads of individual structural edges

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use super::DeferredCache;
use crate::error::Result;
use crate::graph::GraphEdge;
use crate::storage::{edge_category, Attributes, Item, ItemKey, StoreHandler};

/// Addresses one structural edge row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub context: String,
}

impl EdgeKey {
    pub fn new(from: impl Into<String>, to: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            context: context.into(),
        }
    }

    pub fn item_key(&self) -> ItemKey {
        ItemKey::new(self.from.clone(), edge_category(&self.to, &self.context))
    }
}

/// Edge data of fetched dependency graphs. `payload` is only filled when
/// edge payloads were requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Attributes>,
}

pub struct GraphEdgeData {
    store: Arc<dyn StoreHandler>,
    cache: DeferredCache<EdgeKey, Attributes>,
}

impl GraphEdgeData {
    pub fn new(store: Arc<dyn StoreHandler>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            cache: DeferredCache::new(|_| Attributes::new(), ttl),
        }
    }

    /// Payload of each edge, empty for edges with no stored row
    pub async fn get(&self, keys: &[EdgeKey]) -> Result<Vec<GraphEdge<DependencyEdge>>> {
        let store = Arc::clone(&self.store);
        self.cache.add(
            keys.iter().cloned(),
            move |edge_keys: Vec<EdgeKey>| {
                let lookup: HashMap<ItemKey, EdgeKey> = edge_keys
                    .into_iter()
                    .map(|key| (key.item_key(), key))
                    .collect();
                async move {
                    let item_keys: Vec<ItemKey> = lookup.keys().cloned().collect();
                    tracing::debug!(rows = item_keys.len(), "fetching edge payload rows");
                    let items = store.get_items(&item_keys).await?;
                    Ok((items, lookup))
                }
            },
            |(items, lookup): (Vec<Item>, HashMap<ItemKey, EdgeKey>)| {
                Ok(items
                    .into_iter()
                    .filter_map(|item| lookup.get(&item.key).map(|key| (key.clone(), item.attributes)))
                    .collect())
            },
        );

        let payloads = try_join_all(keys.iter().map(|key| self.cache.get(key))).await?;
        Ok(keys
            .iter()
            .zip(payloads)
            .map(|(key, payload)| {
                GraphEdge::new(
                    key.from.clone(),
                    key.to.clone(),
                    DependencyEdge {
                        context: key.context.clone(),
                        payload: Some(payload),
                    },
                )
            })
            .collect())
    }

    pub fn set(&self, key: EdgeKey, payload: Attributes) {
        self.cache.set(key, payload);
    }

    pub fn invalidate(&self, key: &EdgeKey) {
        self.cache.invalidate(key);
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}
