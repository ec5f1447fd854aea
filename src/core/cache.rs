//! TTL memoization for discovery and fetch calls.
//!
//! [`CacheStore`] is a type-erased key/value map with lazy expiry.
//! [`TtlCache`] wraps an async computation: hits return a clone of the
//! stored value, misses run the computation once per key even under
//! concurrent callers, and only successful results are stored.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
pub struct CacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A poisoned map only means a panic happened mid-insert; the data is
        // still a valid map.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch a live value. Expired entries are dropped on access, and a
    /// value stored under a different type reads as a miss.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut entries = self.entries();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => entry.value.downcast_ref::<T>().cloned(),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set<T>(&self, key: &str, value: T, ttl: Duration)
    where
        T: Send + Sync + 'static,
    {
        let entry = CacheEntry {
            value: Arc::new(value),
            expires_at: Instant::now() + ttl,
        };
        self.entries().insert(key.to_string(), entry);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn has(&self, key: &str) -> bool {
        let mut entries = self.entries();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Drop every key for which `predicate` returns true. Returns the
    /// number of removed entries.
    pub fn remove_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type KeyFn<A> = Box<dyn Fn(&A) -> String + Send + Sync>;

/// Memoizing decorator over an async producer keyed by its arguments.
pub struct TtlCache<A, V> {
    store: Arc<CacheStore>,
    ttl: Duration,
    key_fn: KeyFn<A>,
    label: &'static str,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    _value: PhantomData<fn() -> V>,
}

impl<A, V> TtlCache<A, V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<CacheStore>,
        ttl: Duration,
        key_fn: impl Fn(&A) -> String + Send + Sync + 'static,
        label: &'static str,
    ) -> Self {
        Self {
            store,
            ttl,
            key_fn: Box::new(key_fn),
            label,
            inflight: Mutex::new(HashMap::new()),
            _value: PhantomData,
        }
    }

    pub fn key_for(&self, args: &A) -> String {
        (self.key_fn)(args)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get_or_compute<F, Fut, E>(&self, args: &A, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let key = self.key_for(args);
        if let Some(value) = self.store.get::<V>(&key) {
            debug!(cache = self.label, key = %key, "Cache hit");
            return Ok(value);
        }

        let gate = self.gate(&key);
        let result = {
            let _flight = gate.lock().await;
            // Another caller may have filled the entry while we waited.
            if let Some(value) = self.store.get::<V>(&key) {
                debug!(cache = self.label, key = %key, "Cache hit after wait");
                Ok(value)
            } else {
                debug!(cache = self.label, key = %key, "Cache miss");
                let computed = compute().await;
                if let Ok(value) = &computed {
                    self.store.set(&key, value.clone(), self.ttl);
                }
                computed
            }
        };
        self.release_gate(&key, gate);
        result
    }

    /// Invalidate the entry for `args`. The next call recomputes.
    pub fn reset(&self, args: &A) -> bool {
        let key = self.key_for(args);
        debug!(cache = self.label, key = %key, "Cache reset");
        self.store.remove(&key)
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_gate(&self, key: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.gates();
        // Map + our handle; anyone else still waiting keeps it alive.
        if Arc::strong_count(&gate) <= 2 {
            gates.remove(key);
        }
    }
}
