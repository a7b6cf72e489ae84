//! Key-value store contract the graph is persisted through
//!
//! Items are schemaless attribute maps addressed by `(primary_key,
//! data_category)`. Backends provide batched reads, a compare-and-swap style
//! read-modify-write, and all-or-nothing multi-item transactions whose
//! preconditions abort the whole batch with a retryable conflict.

pub mod memory;
pub mod sled_store;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GraphError, Result};

pub use memory::{MemoryStore, StoreStats};
pub use sled_store::SledStore;

pub type Attributes = serde_json::Map<String, Value>;

/// Data category of a node's forward edge index
pub const FORWARD_CATEGORY: &str = "Graph::Forward";
/// Data category of a node's back edge index
pub const BACK_CATEGORY: &str = "Graph::Back";

/// Data category of one structural edge row: `Graph::<to>[::<context>]`
pub fn edge_category(to: &str, context: &str) -> String {
    if context.is_empty() {
        format!("Graph::{}", to)
    } else {
        format!("Graph::{}::{}", to, context)
    }
}

/// Node keys share the row namespace with the index categories, so a node
/// may not be named after one of them. A key may not contain `::` or end in
/// `:`, otherwise `edge_category` would not be injective.
pub fn validate_node_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(GraphError::InvalidRequest("empty node key".into()));
    }
    if key.contains('\0') {
        return Err(GraphError::InvalidRequest(format!("node key {:?} contains NUL", key)));
    }
    if key.contains("::") || key.ends_with(':') {
        return Err(GraphError::InvalidRequest(format!(
            "node key {:?} would be ambiguous inside an edge category",
            key
        )));
    }
    if edge_category(key, "") == FORWARD_CATEGORY || edge_category(key, "") == BACK_CATEGORY {
        return Err(GraphError::InvalidRequest(format!("node key {:?} is reserved", key)));
    }
    Ok(())
}

/// Milliseconds since the epoch
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Next value for a version stamp that must strictly increase even when two
/// writes land in the same millisecond.
pub fn next_timestamp(previous: Option<u64>) -> u64 {
    let now = timestamp();
    match previous {
        Some(prev) if prev >= now => prev + 1,
        _ => now,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemKey {
    pub primary_key: String,
    pub data_category: String,
}

impl ItemKey {
    pub fn new(primary_key: impl Into<String>, data_category: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            data_category: data_category.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub key: ItemKey,
    pub attributes: Attributes,
}

impl Item {
    pub fn new(key: ItemKey, attributes: Attributes) -> Self {
        Self { key, attributes }
    }
}

/// Precondition on one attribute of an item. `expected: None` requires the
/// attribute (or the whole item) to be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub attribute: String,
    pub expected: Option<Value>,
}

impl Condition {
    pub fn equals(attribute: impl Into<String>, expected: Option<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            expected,
        }
    }

    pub fn holds(&self, item: Option<&Attributes>) -> bool {
        let actual = item.and_then(|attrs| attrs.get(&self.attribute));
        match (&self.expected, actual) {
            (None, None) | (None, Some(Value::Null)) => true,
            (Some(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put(Item),
    Delete(ItemKey),
    /// Attribute-level update; creates the item if absent
    Update {
        key: ItemKey,
        set: Attributes,
        remove: Vec<String>,
        conditions: Vec<Condition>,
    },
    /// Add/remove members of an array attribute treated as a set
    SetOperation {
        key: ItemKey,
        attribute: String,
        add: Vec<Value>,
        delete: Vec<Value>,
        conditions: Vec<Condition>,
    },
}

impl WriteRequest {
    pub fn key(&self) -> &ItemKey {
        match self {
            WriteRequest::Put(item) => &item.key,
            WriteRequest::Delete(key) => key,
            WriteRequest::Update { key, .. } => key,
            WriteRequest::SetOperation { key, .. } => key,
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        match self {
            WriteRequest::Update { conditions, .. } => conditions,
            WriteRequest::SetOperation { conditions, .. } => conditions,
            _ => &[],
        }
    }

    /// Check preconditions against the current item
    pub fn check(&self, existing: Option<&Attributes>) -> Result<()> {
        if self.conditions().iter().all(|c| c.holds(existing)) {
            Ok(())
        } else {
            let key = self.key();
            Err(GraphError::TransactionConflict(format!(
                "condition failed on {}/{}",
                key.primary_key, key.data_category
            )))
        }
    }

    /// New state of the item after this request (`None` = deleted)
    pub fn apply(&self, existing: Option<Attributes>) -> Option<Attributes> {
        match self {
            WriteRequest::Put(item) => Some(item.attributes.clone()),
            WriteRequest::Delete(_) => None,
            WriteRequest::Update { set, remove, .. } => {
                let mut attrs = existing.unwrap_or_default();
                for (name, value) in set {
                    attrs.insert(name.clone(), value.clone());
                }
                for name in remove {
                    attrs.remove(name);
                }
                Some(attrs)
            }
            WriteRequest::SetOperation {
                attribute,
                add,
                delete,
                ..
            } => {
                let mut attrs = existing.unwrap_or_default();
                let mut members = match attrs.remove(attribute) {
                    Some(Value::Array(members)) => members,
                    _ => Vec::new(),
                };
                for value in add {
                    if !members.contains(value) {
                        members.push(value.clone());
                    }
                }
                members.retain(|m| !delete.contains(m));
                if !members.is_empty() {
                    attrs.insert(attribute.clone(), Value::Array(members));
                }
                Some(attrs)
            }
        }
    }
}

/// Reducer for `optimistic_update`. Mutates the draft in place and returns
/// `false` to leave the stored item untouched.
pub type UpdateReducer<'a> = &'a (dyn Fn(&mut Attributes) -> bool + Send + Sync);

#[async_trait]
pub trait StoreHandler: Send + Sync {
    /// Batch get. Missing keys are simply absent from the result.
    async fn get_items(&self, keys: &[ItemKey]) -> Result<Vec<Item>>;

    /// Read-modify-write of a single item without lost updates. Returns the
    /// item as stored afterwards.
    async fn optimistic_update(&self, key: &ItemKey, reducer: UpdateReducer<'_>) -> Result<Option<Item>>;

    /// All-or-nothing multi-item write
    async fn transact_write(&self, requests: Vec<WriteRequest>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => Attributes::new(),
        }
    }

    #[test]
    fn test_edge_category() {
        assert_eq!(edge_category("VARIABLE#x", ""), "Graph::VARIABLE#x");
        assert_eq!(edge_category("VARIABLE#x", "ASSET#base"), "Graph::VARIABLE#x::ASSET#base");
    }

    #[test]
    fn test_reserved_node_keys() {
        assert!(validate_node_key("ASSET#base").is_ok());
        assert!(validate_node_key("").is_err());
        assert!(validate_node_key("Forward").is_err());
        assert!(validate_node_key("Back").is_err());
    }

    #[test]
    fn test_separator_in_node_key_is_rejected() {
        // Same row for (a::b, "") and (a, b)
        assert_eq!(edge_category("a::b", ""), edge_category("a", "b"));
        assert!(matches!(validate_node_key("a::b"), Err(GraphError::InvalidRequest(_))));
        assert!(validate_node_key("a:").is_err());
        assert!(validate_node_key("VARIABLE:x").is_ok());
        assert!(validate_node_key(":x").is_ok());
    }

    #[test]
    fn test_condition_absent_and_equal() {
        let item = attrs(json!({ "updatedAt": 5 }));
        assert!(Condition::equals("updatedAt", Some(json!(5))).holds(Some(&item)));
        assert!(!Condition::equals("updatedAt", Some(json!(4))).holds(Some(&item)));
        assert!(!Condition::equals("updatedAt", None).holds(Some(&item)));
        assert!(Condition::equals("updatedAt", None).holds(None));
        assert!(Condition::equals("cachedAt", None).holds(Some(&item)));
    }

    #[test]
    fn test_update_merges_attributes() {
        let request = WriteRequest::Update {
            key: ItemKey::new("A", FORWARD_CATEGORY),
            set: attrs(json!({ "edges": [], "updatedAt": 2 })),
            remove: vec!["invalidatedAt".into()],
            conditions: vec![],
        };
        let result = request
            .apply(Some(attrs(json!({ "cachedAt": 1, "invalidatedAt": 1 }))))
            .unwrap();
        assert_eq!(Value::Object(result), json!({ "cachedAt": 1, "edges": [], "updatedAt": 2 }));
    }

    #[test]
    fn test_set_operation() {
        let request = WriteRequest::SetOperation {
            key: ItemKey::new("A", "Meta"),
            attribute: "assets".into(),
            add: vec![json!("base"), json!("extra")],
            delete: vec![json!("old")],
            conditions: vec![],
        };
        let result = request
            .apply(Some(attrs(json!({ "assets": ["old", "base"] }))))
            .unwrap();
        assert_eq!(result["assets"], json!(["base", "extra"]));
    }

    #[test]
    fn test_next_timestamp_is_strictly_increasing() {
        let far_future = timestamp() + 60_000;
        assert_eq!(next_timestamp(Some(far_future)), far_future + 1);
        assert!(next_timestamp(None) > 0);
    }
}
