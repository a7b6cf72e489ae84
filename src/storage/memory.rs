//! In-process store backend

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Attributes, Item, ItemKey, StoreHandler, UpdateReducer, WriteRequest};
use crate::error::{GraphError, Result};

/// Counters of the calls made against a `MemoryStore`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub get_calls: usize,
    pub keys_read: usize,
    pub optimistic_updates: usize,
    pub transactions: usize,
    pub items_written: usize,
}

/// Everything in a `BTreeMap` behind one lock. Transactions are trivially
/// atomic since they run while holding it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<ItemKey, Attributes>>,
    stats: Mutex<StoreStats>,
    injected_conflicts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, BTreeMap<ItemKey, Attributes>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, f: impl FnOnce(&mut StoreStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn stats(&self) -> StoreStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset_stats(&self) {
        self.record(|s| *s = StoreStats::default());
    }

    /// Make the next `count` transactions fail with a conflict before
    /// touching any item
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, key: &ItemKey) -> Option<Attributes> {
        self.items().get(key).cloned()
    }

    /// Write an item directly, bypassing conditions and stats
    pub fn put(&self, item: Item) {
        self.items().insert(item.key, item.attributes);
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Every stored item, ordered by key
    pub fn snapshot(&self) -> Vec<Item> {
        self.items()
            .iter()
            .map(|(key, attributes)| Item::new(key.clone(), attributes.clone()))
            .collect()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StoreHandler for MemoryStore {
    async fn get_items(&self, keys: &[ItemKey]) -> Result<Vec<Item>> {
        self.record(|s| {
            s.get_calls += 1;
            s.keys_read += keys.len();
        });
        let items = self.items();
        Ok(keys
            .iter()
            .filter_map(|key| items.get(key).map(|attrs| Item::new(key.clone(), attrs.clone())))
            .collect())
    }

    async fn optimistic_update(&self, key: &ItemKey, reducer: UpdateReducer<'_>) -> Result<Option<Item>> {
        self.record(|s| s.optimistic_updates += 1);
        let mut items = self.items();
        let existing = items.get(key).cloned();
        let mut draft = existing.clone().unwrap_or_default();
        if !reducer(&mut draft) {
            return Ok(existing.map(|attrs| Item::new(key.clone(), attrs)));
        }
        items.insert(key.clone(), draft.clone());
        Ok(Some(Item::new(key.clone(), draft)))
    }

    async fn transact_write(&self, requests: Vec<WriteRequest>) -> Result<()> {
        self.record(|s| s.transactions += 1);
        if self.take_injected_conflict() {
            return Err(GraphError::TransactionConflict("injected conflict".into()));
        }

        let mut items = self.items();
        // Stage into a working copy of the touched rows so a failed
        // condition leaves nothing behind
        let mut staged: BTreeMap<ItemKey, Option<Attributes>> = BTreeMap::new();
        for request in &requests {
            let key = request.key();
            let current = match staged.get(key) {
                Some(state) => state.clone(),
                None => items.get(key).cloned(),
            };
            request.check(current.as_ref())?;
            staged.insert(key.clone(), request.apply(current));
        }

        let written = staged.len();
        for (key, state) in staged {
            match state {
                Some(attrs) => {
                    items.insert(key, attrs);
                }
                None => {
                    items.remove(&key);
                }
            }
        }
        drop(items);
        self.record(|s| s.items_written += written);
        Ok(())
    }
}
