//! Ancestry/Descent dependency trees
//!
//! The older representation keeps one row per node and tree. Edges to the
//! same node that differ only by asset are grouped into one connection
//! (keyed by target and optional `key`) listing every contributing asset.
//! Both halves of an edge are written through `optimistic_update`; nodes
//! further up the tree are told to re-process through the message bus.

pub mod bus;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub use bus::{ChannelMessageBus, ConnectionChange, DependencyMessage, MessageBus, MessageType, RecordingMessageBus};

use crate::error::{GraphError, Result};
use crate::storage::{Attributes, ItemKey, StoreHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegacyTree {
    /// Nodes that depend on this one
    Ancestry,
    /// Nodes this one depends on
    Descent,
}

impl LegacyTree {
    pub fn data_category(self) -> &'static str {
        match self {
            LegacyTree::Ancestry => "Ancestry",
            LegacyTree::Descent => "Descent",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            LegacyTree::Ancestry => LegacyTree::Descent,
            LegacyTree::Descent => LegacyTree::Ancestry,
        }
    }
}

/// Whether the full subtree below a node has been fetched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completeness {
    #[default]
    Partial,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "EphemeraId")]
    pub ephemera_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub assets: Vec<String>,
}

impl Connection {
    pub fn new(ephemera_id: impl Into<String>, key: Option<String>, assets: Vec<String>) -> Self {
        Self {
            ephemera_id: ephemera_id.into(),
            key,
            assets,
        }
    }

    fn matches(&self, ephemera_id: &str, key: Option<&str>) -> bool {
        self.ephemera_id == ephemera_id && self.key.as_deref() == key
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    #[serde(rename = "EphemeraId")]
    pub ephemera_id: String,
    #[serde(default)]
    pub completeness: Completeness,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl DependencyNode {
    pub fn new(ephemera_id: impl Into<String>) -> Self {
        Self {
            ephemera_id: ephemera_id.into(),
            ..Self::default()
        }
    }

    pub fn from_attributes(ephemera_id: &str, attributes: &Attributes) -> Result<Self> {
        let mut node: Self = serde_json::from_value(Value::Object(attributes.clone()))?;
        node.ephemera_id = ephemera_id.to_string();
        Ok(node)
    }

    pub fn to_attributes(&self) -> Result<Attributes> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Attributes::new()),
        }
    }

    pub fn connection(&self, ephemera_id: &str, key: Option<&str>) -> Option<&Connection> {
        self.connections.iter().find(|c| c.matches(ephemera_id, key))
    }

    /// Merge `connection` in, unioning assets with an existing connection to
    /// the same target and key. Returns whether anything changed.
    pub fn add_connection(&mut self, connection: Connection) -> bool {
        let existing = self
            .connections
            .iter_mut()
            .find(|c| c.matches(&connection.ephemera_id, connection.key.as_deref()));
        match existing {
            Some(existing) => {
                let mut changed = false;
                for asset in connection.assets {
                    if !existing.assets.contains(&asset) {
                        existing.assets.push(asset);
                        changed = true;
                    }
                }
                changed
            }
            None => {
                let mut connection = connection;
                let mut seen = BTreeSet::new();
                connection.assets.retain(|a| seen.insert(a.clone()));
                self.connections.push(connection);
                true
            }
        }
    }

    /// Withdraw `assets` from a connection, dropping the connection once no
    /// asset is left. An empty `assets` drops it outright.
    pub fn remove_connection(&mut self, ephemera_id: &str, key: Option<&str>, assets: &[String]) -> bool {
        let Some(index) = self.connections.iter().position(|c| c.matches(ephemera_id, key)) else {
            return false;
        };
        if assets.is_empty() {
            self.connections.remove(index);
            return true;
        }
        let connection = &mut self.connections[index];
        let before = connection.assets.len();
        connection.assets.retain(|a| !assets.contains(a));
        let changed = connection.assets.len() != before;
        if connection.assets.is_empty() {
            self.connections.remove(index);
        }
        changed
    }
}

pub struct LegacyDependencyStore {
    store: Arc<dyn StoreHandler>,
    bus: Arc<dyn MessageBus>,
}

impl LegacyDependencyStore {
    pub fn new(store: Arc<dyn StoreHandler>, bus: Arc<dyn MessageBus>) -> Self {
        Self { store, bus }
    }

    /// Rows of `ids` in `tree`; missing rows come back as empty partial nodes
    pub async fn get(&self, tree: LegacyTree, ids: &[String]) -> Result<Vec<DependencyNode>> {
        let keys: Vec<ItemKey> = ids
            .iter()
            .map(|id| ItemKey::new(id.clone(), tree.data_category()))
            .collect();
        let items = self.store.get_items(&keys).await?;
        ids.iter()
            .map(|id| match items.iter().find(|item| item.key.primary_key == *id) {
                Some(item) => DependencyNode::from_attributes(id, &item.attributes),
                None => Ok(DependencyNode::new(id.clone())),
            })
            .collect()
    }

    pub async fn set_completeness(&self, tree: LegacyTree, ephemera_id: &str, completeness: Completeness) -> Result<()> {
        self.modify(tree, ephemera_id, move |node| {
            let changed = node.completeness != completeness;
            node.completeness = completeness;
            changed
        })
        .await
        .map(|_| ())
    }

    /// Record that `ephemera_id` has `connection` in `tree`, plus the mirror
    /// connection in the opposite tree of the target. Returns whether the
    /// stored tree changed.
    pub async fn put_edge(&self, tree: LegacyTree, ephemera_id: &str, connection: Connection) -> Result<bool> {
        let mirror = Connection::new(ephemera_id, connection.key.clone(), connection.assets.clone());
        let target = connection.ephemera_id.clone();

        let added = connection.clone();
        let changed = self
            .modify(tree, ephemera_id, move |node| node.add_connection(added.clone()))
            .await?;
        self.modify(tree.opposite(), &target, move |node| node.add_connection(mirror.clone()))
            .await?;

        if changed {
            let change = ConnectionChange {
                ephemera_id: ephemera_id.to_string(),
                connection,
            };
            self.notify_antecedents(tree, ephemera_id, Some(change), None).await?;
        }
        Ok(changed)
    }

    /// Withdraw `assets` from the connection `ephemera_id -> target_id` and
    /// from its mirror
    pub async fn delete_edge(
        &self,
        tree: LegacyTree,
        ephemera_id: &str,
        target_id: &str,
        key: Option<&str>,
        assets: Vec<String>,
    ) -> Result<bool> {
        let owned_key = key.map(str::to_string);

        let (removed_key, removed_assets) = (owned_key.clone(), assets.clone());
        let target = target_id.to_string();
        let changed = self
            .modify(tree, ephemera_id, move |node| {
                node.remove_connection(&target, removed_key.as_deref(), &removed_assets)
            })
            .await?;

        let (mirror_key, mirror_assets) = (owned_key.clone(), assets.clone());
        let source = ephemera_id.to_string();
        self.modify(tree.opposite(), target_id, move |node| {
            node.remove_connection(&source, mirror_key.as_deref(), &mirror_assets)
        })
        .await?;

        if changed {
            let change = ConnectionChange {
                ephemera_id: ephemera_id.to_string(),
                connection: Connection::new(target_id, owned_key, assets),
            };
            self.notify_antecedents(tree, ephemera_id, None, Some(change)).await?;
        }
        Ok(changed)
    }

    /// Read-modify-write of one row. Returns whether `apply` changed it.
    /// A row that cannot be decoded or encoded is left as stored and the
    /// error is returned.
    async fn modify<F>(&self, tree: LegacyTree, ephemera_id: &str, apply: F) -> Result<bool>
    where
        F: Fn(&mut DependencyNode) -> bool + Send + Sync,
    {
        let key = ItemKey::new(ephemera_id, tree.data_category());
        let changed = AtomicBool::new(false);
        let failure: Mutex<Option<GraphError>> = Mutex::new(None);
        let fail = |e: GraphError| {
            *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
            false
        };

        let reducer = |draft: &mut Attributes| {
            // The store may run the reducer again after a lost race
            *failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
            changed.store(false, Ordering::SeqCst);

            let decoded = if draft.is_empty() {
                Ok(DependencyNode::new(ephemera_id))
            } else {
                DependencyNode::from_attributes(ephemera_id, draft)
            };
            let mut node = match decoded {
                Ok(node) => node,
                Err(e) => return fail(e),
            };
            if !apply(&mut node) {
                return false;
            }
            match node.to_attributes() {
                Ok(attributes) => {
                    *draft = attributes;
                    changed.store(true, Ordering::SeqCst);
                    true
                }
                Err(e) => fail(e),
            }
        };

        self.store.optimistic_update(&key, &reducer).await?;
        if let Some(e) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            warn!(ephemera_id, ?tree, error = %e, "dependency row left untouched");
            return Err(e);
        }
        Ok(changed.load(Ordering::SeqCst))
    }

    /// Every node listed in the opposite tree of `node` holds `node` inside
    /// its own `tree`, so each of them is told to re-process
    async fn notify_antecedents(
        &self,
        tree: LegacyTree,
        ephemera_id: &str,
        put_item: Option<ConnectionChange>,
        delete_item: Option<ConnectionChange>,
    ) -> Result<()> {
        let antecedents = self
            .get(tree.opposite(), &[ephemera_id.to_string()])
            .await?
            .into_iter()
            .flat_map(|n| n.connections.into_iter().map(|c| c.ephemera_id))
            .collect::<BTreeSet<_>>();

        debug!(
            ephemera_id,
            ?tree,
            antecedents = antecedents.len(),
            "notifying antecedents of dependency change"
        );
        try_join_all(antecedents.into_iter().map(|antecedent| {
            let message = DependencyMessage {
                message_type: tree.into(),
                ephemera_id: antecedent,
                put_item: put_item.clone(),
                delete_item: delete_item.clone(),
            };
            async move { self.bus.send(message) }
        }))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Item, MemoryStore};

    fn assets(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn legacy() -> (Arc<MemoryStore>, Arc<RecordingMessageBus>, LegacyDependencyStore) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(RecordingMessageBus::new());
        let legacy = LegacyDependencyStore::new(store.clone(), bus.clone());
        (store, bus, legacy)
    }

    #[test]
    fn test_duplicate_connections_union_assets() {
        let mut node = DependencyNode::new("X");
        assert!(node.add_connection(Connection::new("Y", None, assets(&["a", "a"]))));
        assert!(node.add_connection(Connection::new("Y", None, assets(&["b"]))));
        assert!(!node.add_connection(Connection::new("Y", None, assets(&["a"]))));
        assert!(node.add_connection(Connection::new("Y", Some("k".into()), assets(&["a"]))));

        assert_eq!(node.connections.len(), 2);
        assert_eq!(node.connection("Y", None).unwrap().assets, assets(&["a", "b"]));
    }

    #[test]
    fn test_remove_decrements_until_empty() {
        let mut node = DependencyNode::new("X");
        node.add_connection(Connection::new("Y", None, assets(&["a", "b"])));

        assert!(node.remove_connection("Y", None, &assets(&["a"])));
        assert_eq!(node.connection("Y", None).unwrap().assets, assets(&["b"]));
        assert!(!node.remove_connection("Y", None, &assets(&["zzz"])));
        assert!(node.remove_connection("Y", None, &assets(&["b"])));
        assert!(node.connection("Y", None).is_none());
        assert!(!node.remove_connection("Y", None, &[]));
    }

    #[tokio::test]
    async fn test_put_edge_writes_mirror_and_notifies() {
        let (_store, bus, legacy) = legacy();
        // A depends on X
        legacy
            .put_edge(LegacyTree::Descent, "A", Connection::new("X", None, assets(&["base"])))
            .await
            .unwrap();
        assert_eq!(bus.take().len(), 0);

        // X now depends on Y, so A's descent changed too
        let changed = legacy
            .put_edge(LegacyTree::Descent, "X", Connection::new("Y", None, assets(&["base"])))
            .await
            .unwrap();
        assert!(changed);

        let ancestry = legacy.get(LegacyTree::Ancestry, &["Y".to_string()]).await.unwrap();
        assert_eq!(ancestry[0].connection("X", None).unwrap().assets, assets(&["base"]));

        let messages = bus.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::DescentUpdate);
        assert_eq!(messages[0].ephemera_id, "A");
        assert_eq!(messages[0].put_item.as_ref().unwrap().connection.ephemera_id, "Y");

        // Repeating the same edge changes nothing and sends nothing
        let changed = legacy
            .put_edge(LegacyTree::Descent, "X", Connection::new("Y", None, assets(&["base"])))
            .await
            .unwrap();
        assert!(!changed);
        assert!(bus.take().is_empty());
    }

    #[tokio::test]
    async fn test_delete_edge_withdraws_both_halves() {
        let (_store, bus, legacy) = legacy();
        legacy
            .put_edge(LegacyTree::Descent, "X", Connection::new("Y", None, assets(&["a", "b"])))
            .await
            .unwrap();

        assert!(legacy
            .delete_edge(LegacyTree::Descent, "X", "Y", None, assets(&["a"]))
            .await
            .unwrap());
        let descent = legacy.get(LegacyTree::Descent, &["X".to_string()]).await.unwrap();
        assert_eq!(descent[0].connection("Y", None).unwrap().assets, assets(&["b"]));

        assert!(legacy
            .delete_edge(LegacyTree::Descent, "X", "Y", None, assets(&["b"]))
            .await
            .unwrap());
        let ancestry = legacy.get(LegacyTree::Ancestry, &["Y".to_string()]).await.unwrap();
        assert!(ancestry[0].connections.is_empty());
        assert!(bus.take().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_row_is_reported_and_kept() {
        let (store, bus, legacy) = legacy();
        let key = ItemKey::new("A", LegacyTree::Descent.data_category());
        let mut corrupt = Attributes::new();
        corrupt.insert("EphemeraId".into(), Value::from("A"));
        corrupt.insert("connections".into(), Value::from(5));
        store.put(Item::new(key.clone(), corrupt.clone()));

        let result = legacy
            .put_edge(LegacyTree::Descent, "A", Connection::new("X", None, assets(&["base"])))
            .await;
        assert!(matches!(result, Err(GraphError::Serialization(_))));
        assert_eq!(store.get(&key), Some(corrupt));
        assert!(store
            .get(&ItemKey::new("X", LegacyTree::Ancestry.data_category()))
            .is_none());
        assert!(bus.take().is_empty());

        let result = legacy
            .set_completeness(LegacyTree::Descent, "A", Completeness::Complete)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_rows_are_partial() {
        let (_store, _bus, legacy) = legacy();
        let nodes = legacy.get(LegacyTree::Ancestry, &["nobody".to_string()]).await.unwrap();
        assert_eq!(nodes[0].completeness, Completeness::Partial);
        assert!(nodes[0].connections.is_empty());

        legacy
            .set_completeness(LegacyTree::Ancestry, "nobody", Completeness::Complete)
            .await
            .unwrap();
        let nodes = legacy.get(LegacyTree::Ancestry, &["nobody".to_string()]).await.unwrap();
        assert_eq!(nodes[0].completeness, Completeness::Complete);
    }
}
