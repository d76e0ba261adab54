//! Hot tier: concurrent in-memory key → value map with TTL
//!
//! Backed by a sharded map so point operations on disjoint keys do not
//! serialize. Expired entries turn invisible immediately and are removed
//! in bulk by the expiry sweeper, which also settles their index entries.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// A stored value with optional expiry
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn new(value: Vec<u8>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { value, expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Concurrent hot map
pub struct Store {
    map: DashMap<String, Entry>,
}

impl Store {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Upsert. Returns the previous entry (expired or not) so the caller
    /// can settle its index contributions.
    pub fn set(&self, key: String, entry: Entry) -> Option<Entry> {
        self.map.insert(key, entry)
    }

    /// Non-expired read. Expired entries stay put for the sweeper, which
    /// also owns their index cleanup.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Utc::now();
        let entry = self.map.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Live read including the expiry stamp
    pub fn get_entry(&self, key: &str) -> Option<Entry> {
        let now = Utc::now();
        let entry = self.map.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry.clone())
    }

    /// Batched read preserving the input order of found keys
    pub fn get_many(&self, keys: &[String]) -> Vec<(String, Vec<u8>)> {
        keys.iter()
            .filter_map(|k| self.get(k).map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Utc::now();
        self.map
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// Remove. Returns the previous entry (expired or not) so the caller
    /// can settle its index contributions.
    pub fn remove(&self, key: &str) -> Option<Entry> {
        self.map.remove(key).map(|(_, e)| e)
    }

    /// Iterate live entries, borrowing values. Returning `false` from the
    /// callback stops the iteration.
    pub fn stream_all<F>(&self, mut f: F)
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        let now = Utc::now();
        for item in self.map.iter() {
            if item.value().is_expired(now) {
                continue;
            }
            if !f(item.key(), &item.value().value) {
                break;
            }
        }
    }

    /// Remove every expired entry, returning them for index cleanup
    pub fn drain_expired(&self) -> Vec<(String, Entry)> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|item| item.value().is_expired(now))
            .map(|item| item.key().clone())
            .collect();

        let mut drained = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some((k, e)) = self.map.remove_if(&key, |_, e| e.is_expired(now)) {
                drained.push((k, e));
            }
        }
        drained
    }

    /// Copy the live entries out for the saver. Entries with a TTL are
    /// excluded: they stay hot until the sweeper takes them.
    pub fn snapshot_persistent(&self) -> Vec<(String, Vec<u8>)> {
        let now = Utc::now();
        self.map
            .iter()
            .filter(|item| item.value().expires_at.is_none() && !item.value().is_expired(now))
            .map(|item| (item.key().clone(), item.value().value.clone()))
            .collect()
    }

    /// Drop entries from the hot tier without touching indexes (the cold
    /// tier now owns them). An entry rewritten since the snapshot was
    /// taken no longer matches and stays hot for the next save.
    pub fn evict_unchanged(&self, items: &[(String, Vec<u8>)]) {
        for (key, expected) in items {
            self.map.remove_if(key, |_, e| e.value == *expected);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
