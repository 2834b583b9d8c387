//! Keyed cache with bounded size and time-to-live.
//!
//! Clients and per-source lookups are cached per key and passed by reference
//! into the components that need them; nothing in the workspace reaches for
//! ambient global state.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Default entry lifetime, matching how long upstream service descriptions
/// stay fresh.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
/// Default maximum number of cached entries.
pub const DEFAULT_CAPACITY: usize = 64;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A bounded, expiring `key → value` cache.
///
/// Values are cloned out; wrap expensive-to-clone values in `Arc`.
pub struct KeyedCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    ttl: Duration,
    capacity: usize,
}

impl<V: Clone> KeyedCache<V> {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// The cached value for `key`, unless missing or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Inserts a value, evicting expired entries first and the oldest entry
    /// when still at capacity.
    pub fn insert(&self, key: &str, value: V) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Returns the cached value, or builds, caches, and returns a fresh one.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: &str,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = build()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for KeyedCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
