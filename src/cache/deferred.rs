//! Read-through cache that coalesces batched fetches
//!
//! `add` registers one loader call for every key that is neither cached nor
//! already in flight; `get` then resolves from the cache, from the shared
//! in-flight fetch, or to the default value. The loader future is shared, so
//! any number of concurrent `get`s for keys of one batch poll a single fetch.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};

use crate::error::Result;

type BatchFetch<K, V> = Shared<BoxFuture<'static, Result<Arc<HashMap<K, V>>>>>;

struct Entry<V> {
    value: V,
    expires: Option<Instant>,
}

struct Pending<K, V> {
    batch: u64,
    fetch: BatchFetch<K, V>,
}

struct State<K, V> {
    values: HashMap<K, Entry<V>>,
    pending: HashMap<K, Pending<K, V>>,
    next_batch: u64,
}

/// Every this many batches `add` sweeps out all expired entries
const SWEEP_INTERVAL: u64 = 64;

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

impl<K: Eq + Hash, V> State<K, V> {
    /// Unexpired value of `key`. An expired entry is dropped on the spot.
    fn fresh(&mut self, key: &K, now: Instant) -> Option<&V> {
        if self.values.get(key).map_or(false, |entry| !entry.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get(key).map(|entry| &entry.value)
    }

    fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.values.len();
        self.values.retain(|_, entry| entry.is_live(now));
        before - self.values.len()
    }
}

fn lock<K, V>(state: &Mutex<State<K, V>>) -> MutexGuard<'_, State<K, V>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DeferredCache<K, V> {
    state: Arc<Mutex<State<K, V>>>,
    default: Arc<dyn Fn(&K) -> V + Send + Sync>,
    ttl: Option<Duration>,
}

impl<K, V> DeferredCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `default` produces the value of a key the loader did not return.
    /// `ttl` applies to every value this cache stores unless overridden.
    pub fn new(default: impl Fn(&K) -> V + Send + Sync + 'static, ttl: Option<Duration>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                values: HashMap::new(),
                pending: HashMap::new(),
                next_batch: 0,
            })),
            default: Arc::new(default),
            ttl,
        }
    }

    /// Register one batched fetch for the keys of `required_keys` that are
    /// neither cached nor in flight. Returns how many keys were requested;
    /// zero means `promise_factory` was not called.
    pub fn add<R, Fut, P, T>(&self, required_keys: impl IntoIterator<Item = K>, promise_factory: P, transform: T) -> usize
    where
        P: FnOnce(Vec<K>) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
        T: FnOnce(R) -> Result<HashMap<K, V>> + Send + 'static,
        R: Send + 'static,
    {
        let mut state = lock(&self.state);
        let now = Instant::now();
        let mut seen = HashSet::new();
        let keys: Vec<K> = required_keys
            .into_iter()
            .filter(|key| state.fresh(key, now).is_none() && !state.pending.contains_key(key))
            .filter(|key| seen.insert(key.clone()))
            .collect();
        if keys.is_empty() {
            return 0;
        }

        state.next_batch += 1;
        let batch = state.next_batch;
        if batch % SWEEP_INTERVAL == 0 {
            state.evict_expired(now);
        }
        let loader = promise_factory(keys.clone());

        let shared_state = Arc::clone(&self.state);
        let default = Arc::clone(&self.default);
        let ttl = self.ttl;
        let batch_keys = keys.clone();
        let fetch = async move {
            let outcome = loader.await.and_then(transform);

            let mut state = lock(&shared_state);
            // Keys invalidated or re-set while in flight are answered to the
            // waiters of this batch but not stored
            let owned: Vec<bool> = batch_keys
                .iter()
                .map(|key| {
                    let mine = state.pending.get(key).map_or(false, |p| p.batch == batch);
                    if mine {
                        state.pending.remove(key);
                    }
                    mine
                })
                .collect();

            let mut values = outcome?;
            for key in &batch_keys {
                if !values.contains_key(key) {
                    values.insert(key.clone(), default(key));
                }
            }
            let expires = ttl.map(|ttl| Instant::now() + ttl);
            for (key, mine) in batch_keys.iter().zip(owned) {
                if let (true, Some(value)) = (mine, values.get(key)) {
                    state.values.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            expires,
                        },
                    );
                }
            }
            Ok(Arc::new(values))
        }
        .boxed()
        .shared();

        let requested = keys.len();
        for key in keys {
            state.pending.insert(
                key,
                Pending {
                    batch,
                    fetch: fetch.clone(),
                },
            );
        }
        requested
    }

    pub async fn get(&self, key: &K) -> Result<V> {
        let fetch = {
            let mut state = lock(&self.state);
            if let Some(value) = state.fresh(key, Instant::now()) {
                return Ok(value.clone());
            }
            state.pending.get(key).map(|p| p.fetch.clone())
        };
        match fetch {
            Some(fetch) => {
                let values = fetch.await?;
                Ok(values
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| (self.default)(key)))
            }
            None => Ok((self.default)(key)),
        }
    }

    pub async fn get_many(&self, keys: &[K]) -> Result<Vec<V>> {
        try_join_all(keys.iter().map(|key| self.get(key))).await
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) {
        let mut state = lock(&self.state);
        state.pending.remove(&key);
        state.values.insert(
            key,
            Entry {
                value,
                expires: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        let mut state = lock(&self.state);
        state.values.remove(key);
        state.pending.remove(key);
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.values.clear();
        state.pending.clear();
    }

    pub fn is_cached(&self, key: &K) -> bool {
        lock(&self.state).fresh(key, Instant::now()).is_some()
    }

    pub fn in_flight(&self, key: &K) -> bool {
        lock(&self.state).pending.contains_key(key)
    }

    /// Drop every expired value. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        lock(&self.state).evict_expired(Instant::now())
    }

    /// Number of stored values, expired or not
    pub fn len(&self) -> usize {
        lock(&self.state).values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Loads = Arc<Mutex<Vec<Vec<String>>>>;

    /// Registers a loader that doubles the length of each key and records
    /// what it was asked for
    fn add_lengths(cache: &DeferredCache<String, usize>, keys: &[&str], loads: &Loads) -> usize {
        let loads = Arc::clone(loads);
        cache.add(
            keys.iter().map(|k| k.to_string()),
            move |keys: Vec<String>| {
                loads.lock().unwrap().push(keys.clone());
                async move { Ok(keys) }
            },
            |keys: Vec<String>| Ok(keys.into_iter().filter(|k| k != "missing").map(|k| (k.clone(), k.len() * 2)).collect()),
        )
    }

    fn cache() -> DeferredCache<String, usize> {
        DeferredCache::new(|_| 0, None)
    }

    #[tokio::test]
    async fn test_overlapping_adds_request_only_new_keys() {
        let cache = cache();
        let loads = Loads::default();

        assert_eq!(add_lengths(&cache, &["a", "bb"], &loads), 2);
        assert_eq!(add_lengths(&cache, &["bb", "ccc", "ccc"], &loads), 1);
        assert_eq!(add_lengths(&cache, &["a"], &loads), 0);

        let values = cache
            .get_many(&["a".to_string(), "bb".to_string(), "ccc".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![2, 4, 6]);
        assert_eq!(*loads.lock().unwrap(), vec![vec!["a".to_string(), "bb".to_string()], vec!["ccc".to_string()]]);

        // Everything is cached now
        assert_eq!(add_lengths(&cache, &["a", "bb", "ccc"], &loads), 0);
        assert!(cache.is_cached(&"ccc".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let cache = cache();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        cache.add(
            vec!["x".to_string(), "yy".to_string()],
            move |keys: Vec<String>| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(keys)
            },
            |keys: Vec<String>| Ok(keys.into_iter().map(|k| (k.clone(), k.len())).collect()),
        );

        let x = "x".to_string();
        let y = "yy".to_string();
        let (a, b, c) = tokio::join!(cache.get(&x), cache.get(&y), cache.get(&x));
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 2, 1));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert!(!cache.in_flight(&x));
    }

    #[tokio::test]
    async fn test_missing_keys_resolve_to_default_and_are_memoized() {
        let cache = cache();
        let loads = Loads::default();
        add_lengths(&cache, &["missing"], &loads);

        assert_eq!(cache.get(&"missing".to_string()).await.unwrap(), 0);
        assert_eq!(add_lengths(&cache, &["missing"], &loads), 0);
        assert_eq!(cache.get(&"never-added".to_string()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_loader_failure_reaches_every_waiter() {
        let cache = cache();
        cache.set("kept".to_string(), 9);
        cache.add(
            vec!["a".to_string(), "b".to_string()],
            |_keys: Vec<String>| async { Err::<Vec<String>, _>(GraphError::Store("unreachable".into())) },
            |_keys: Vec<String>| Ok(HashMap::new()),
        );

        let a = "a".to_string();
        let b = "b".to_string();
        let (ra, rb) = tokio::join!(cache.get(&a), cache.get(&b));
        assert_eq!(ra, Err(GraphError::Store("unreachable".into())));
        assert_eq!(rb, Err(GraphError::Store("unreachable".into())));
        assert_eq!(cache.get(&"kept".to_string()).await.unwrap(), 9);

        // Failed keys are no longer in flight and can be requested again
        let loads = Loads::default();
        assert_eq!(add_lengths(&cache, &["a"], &loads), 1);
    }

    #[tokio::test]
    async fn test_invalidate_while_in_flight_discards_result() {
        let cache = cache();
        let loads = Loads::default();
        add_lengths(&cache, &["abc"], &loads);
        let key = "abc".to_string();
        let fetch = lock(&cache.state).pending.get(&key).map(|p| p.fetch.clone()).unwrap();

        cache.invalidate(&key);
        assert_eq!(fetch.await.unwrap()[&key], 6);
        assert!(!cache.is_cached(&key));
    }

    #[tokio::test]
    async fn test_set_and_ttl() {
        let cache = cache();
        cache.set_with_ttl("gone".to_string(), 5, Some(Duration::ZERO));
        cache.set("stays".to_string(), 7);

        assert_eq!(cache.get(&"gone".to_string()).await.unwrap(), 0);
        assert_eq!(cache.get(&"stays".to_string()).await.unwrap(), 7);

        cache.clear();
        assert_eq!(cache.get(&"stays".to_string()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_values_are_dropped() {
        let cache = cache();
        cache.set_with_ttl("read".to_string(), 1, Some(Duration::ZERO));
        cache.set_with_ttl("unread".to_string(), 2, Some(Duration::ZERO));
        cache.set("stays".to_string(), 3);
        assert_eq!(cache.len(), 3);

        // A lookup drops the expired value it finds
        assert!(!cache.is_cached(&"read".to_string()));
        assert_eq!(cache.len(), 2);

        // Values nobody asks for again go on a sweep
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"stays".to_string()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_adds_sweep_expired_values() {
        let cache = cache();
        let loads = Loads::default();
        for i in 0..10 {
            cache.set_with_ttl(format!("old{}", i), i, Some(Duration::ZERO));
        }
        for i in 0..SWEEP_INTERVAL {
            add_lengths(&cache, &[format!("k{}", i).as_str()], &loads);
        }
        assert!(lock(&cache.state).values.keys().all(|k| !k.starts_with("old")));
    }
}
