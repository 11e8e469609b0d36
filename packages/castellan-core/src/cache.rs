//! Generic keyed store with optional expiry and a last-write timestamp.
//!
//! Each backend owns one cache holding its enumeration under a fixed key.
//! The `updated_at` stamp lets list handlers serve `Last-Modified` without
//! consulting the backend.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    updated_at: SystemTime,
}

/// Keyed value store with a per-store TTL.
///
/// A TTL of zero disables expiry. Expired entries are reported absent on
/// read but only removed by [`clean_expired`]; reads take the read lock,
/// mutations the write lock.
///
/// [`clean_expired`]: TtlCache::clean_expired
pub struct TtlCache<K, V> {
    ttl: Duration,
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Creates a cache whose entries expire after `ttl`. Zero disables expiry.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                updated_at: SystemTime::now(),
            }),
        }
    }

    fn expired(&self, entry: &Entry<V>) -> bool {
        !self.ttl.is_zero() && entry.stored_at.elapsed() > self.ttl
    }

    /// Returns a clone of the value for `key`, or `None` when absent or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.read();
        let entry = inner.entries.get(key)?;
        if self.expired(entry) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Stores `value` under `key`, stamping the last-write timestamp.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.write();
        inner.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
        inner.updated_at = SystemTime::now();
    }

    /// Removes `key`, stamping the last-write timestamp when it was present.
    pub fn delete(&self, key: &K) {
        let mut inner = self.inner.write();
        if inner.entries.remove(key).is_some() {
            inner.updated_at = SystemTime::now();
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.updated_at = SystemTime::now();
    }

    /// Synchronously purges entries past their expiry.
    pub fn clean_expired(&self) {
        if self.ttl.is_zero() {
            return;
        }
        let mut inner = self.inner.write();
        let ttl = self.ttl;
        inner
            .entries
            .retain(|_, entry| entry.stored_at.elapsed() <= ttl);
    }

    /// Wall-clock time of the last `set`/`delete`.
    pub fn updated_at(&self) -> SystemTime {
        self.inner.read().updated_at
    }
}
