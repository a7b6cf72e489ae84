//! Persistent store backend on sled
//!
//! Items are JSON-encoded attribute maps under the key
//! `primary_key \0 data_category`. Multi-item writes run inside a sled
//! transaction; single-item read-modify-writes use compare-and-swap.

use std::path::Path;

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, IVec};

use super::{Attributes, Item, ItemKey, StoreHandler, UpdateReducer, WriteRequest};
use crate::error::{GraphError, Result};

const KEY_SEPARATOR: u8 = 0;

pub struct SledStore {
    db: Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| GraphError::Store(format!("Failed to open sled: {}", e)))?;
        Ok(Self { db })
    }

    /// Throwaway database that is removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

fn encode_key(key: &ItemKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.primary_key.len() + key.data_category.len() + 1);
    out.extend_from_slice(key.primary_key.as_bytes());
    out.push(KEY_SEPARATOR);
    out.extend_from_slice(key.data_category.as_bytes());
    out
}

fn decode(bytes: &[u8]) -> Result<Attributes> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode(attrs: &Attributes) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(attrs)?)
}

#[async_trait]
impl StoreHandler for SledStore {
    async fn get_items(&self, keys: &[ItemKey]) -> Result<Vec<Item>> {
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.db.get(encode_key(key))? {
                items.push(Item::new(key.clone(), decode(&bytes)?));
            }
        }
        Ok(items)
    }

    async fn optimistic_update(&self, key: &ItemKey, reducer: UpdateReducer<'_>) -> Result<Option<Item>> {
        let raw_key = encode_key(key);
        loop {
            let current: Option<IVec> = self.db.get(&raw_key)?;
            let existing = current.as_deref().map(decode).transpose()?;
            let mut draft = existing.clone().unwrap_or_default();
            if !reducer(&mut draft) {
                return Ok(existing.map(|attrs| Item::new(key.clone(), attrs)));
            }

            let swapped = self
                .db
                .compare_and_swap(&raw_key, current, Some(encode(&draft)?))?;
            match swapped {
                Ok(()) => return Ok(Some(Item::new(key.clone(), draft))),
                Err(_) => {
                    tracing::trace!(
                        primary_key = %key.primary_key,
                        data_category = %key.data_category,
                        "compare-and-swap lost, rereading"
                    );
                }
            }
        }
    }

    async fn transact_write(&self, requests: Vec<WriteRequest>) -> Result<()> {
        let outcome = self.db.transaction(|tx| {
            for request in &requests {
                let raw_key = encode_key(request.key());
                let existing = match tx.get(&raw_key)? {
                    Some(bytes) => Some(decode(&bytes).map_err(ConflictableTransactionError::Abort)?),
                    None => None,
                };
                request
                    .check(existing.as_ref())
                    .map_err(ConflictableTransactionError::Abort)?;
                match request.apply(existing) {
                    Some(attrs) => {
                        let bytes = encode(&attrs).map_err(ConflictableTransactionError::Abort)?;
                        tx.insert(raw_key, bytes)?;
                    }
                    None => {
                        tx.remove(raw_key)?;
                    }
                }
            }
            Ok(())
        });

        match outcome {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Condition;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => Attributes::new(),
        }
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let key = ItemKey::new("ASSET#base", "Graph::Forward");
        {
            let store = SledStore::open(dir.path()).unwrap();
            store
                .transact_write(vec![WriteRequest::Put(Item::new(
                    key.clone(),
                    attrs(json!({ "edges": [{ "target": "B", "context": "" }] })),
                ))])
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        let items = store.get_items(&[key]).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attributes["edges"][0]["target"], json!("B"));
    }

    #[tokio::test]
    async fn test_conflict_aborts_transaction() {
        let store = SledStore::temporary().unwrap();
        let a = ItemKey::new("A", "Graph::Forward");
        let b = ItemKey::new("B", "Graph::Back");

        let result = store
            .transact_write(vec![
                WriteRequest::Put(Item::new(b.clone(), Attributes::new())),
                WriteRequest::Update {
                    key: a.clone(),
                    set: attrs(json!({ "updatedAt": 2 })),
                    remove: vec![],
                    conditions: vec![Condition::equals("updatedAt", Some(json!(1)))],
                },
            ])
            .await;

        assert!(matches!(result, Err(GraphError::TransactionConflict(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_optimistic_update_and_delete() {
        let store = SledStore::temporary().unwrap();
        let key = ItemKey::new("A", "Ancestry");

        for _ in 0..3 {
            store
                .optimistic_update(&key, &|draft| {
                    let count = draft.get("count").and_then(Value::as_u64).unwrap_or(0);
                    draft.insert("count".into(), json!(count + 1));
                    true
                })
                .await
                .unwrap();
        }
        let items = store.get_items(&[key.clone()]).await.unwrap();
        assert_eq!(items[0].attributes["count"], json!(3));

        store.transact_write(vec![WriteRequest::Delete(key.clone())]).await.unwrap();
        assert!(store.get_items(&[key]).await.unwrap().is_empty());
    }

    #[test]
    fn test_keys_do_not_collide() {
        assert_ne!(
            encode_key(&ItemKey::new("A", "B::C")),
            encode_key(&ItemKey::new("A::B", "C"))
        );
    }
}
