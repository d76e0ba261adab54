//! Collection: hot map + secondary indexes + cold file
//!
//! Each `_id` lives in exactly one tier at a time. Reads consult hot first,
//! then cold; writes always land hot; the saver later moves non-TTL entries
//! cold. Indexes span both tiers and are maintained synchronously with
//! every mutation.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::document::{self, RESERVED_FIELDS};
use crate::error::{DbError, Result};
use crate::store::cold::ColdStore;
use crate::store::hot::{Entry, Store};
use crate::store::index::FieldIndex;

pub struct Collection {
    name: String,
    hot: Store,
    indexes: DashMap<String, Arc<FieldIndex>>,
    /// Cold tier; the mutex doubles as the collection's file lock
    cold: Mutex<ColdStore>,
}

impl Collection {
    pub fn open(
        name: impl Into<String>,
        data_path: impl Into<std::path::PathBuf>,
        tomb_path: impl Into<std::path::PathBuf>,
    ) -> Result<Self> {
        let name = name.into();
        let cold = ColdStore::open(data_path, tomb_path)?;
        Ok(Self {
            name,
            hot: Store::new(),
            indexes: DashMap::new(),
            cold: Mutex::new(cold),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // Point operations
    // ------------------------------------------------------------------

    /// Insert or replace a document.
    ///
    /// `key` may be empty, in which case the document's own `_id` is used,
    /// or a fresh one is generated. Reserved fields are stamped; a prior
    /// version's `created_at` survives. Returns the resolved id.
    pub async fn put_document(&self, key: &str, raw: &[u8], ttl: i64) -> Result<String> {
        let mut map = document::parse_object(raw)?;
        let id = if key.is_empty() {
            document::extract_id(&map)
                .filter(|id| !id.is_empty())
                .unwrap_or_else(document::generate_id)
        } else {
            key.to_string()
        };

        let prior = self.get(&id).await?;
        let now = Utc::now();
        document::stamp(&mut map, &id, prior.as_deref(), now);
        let bytes = serde_json::to_vec(&Value::Object(map))?;

        let expires_at = document::expires_at(ttl, now);
        if expires_at.is_some() {
            // A TTL entry never flushes cold, so a stale cold version would
            // outlive it; tombstone that version now
            let mut cold = self.cold.lock().await;
            if cold.contains(&id) {
                cold.delete(&id)?;
            }
        }

        self.apply_set(&id, bytes, prior.as_deref(), expires_at)?;
        Ok(id)
    }

    /// Shallow-merge a patch into an existing document. Reserved fields in
    /// the patch are ignored. Returns false when the key does not exist.
    pub async fn update_document(&self, key: &str, patch: &[u8]) -> Result<bool> {
        let patch = document::parse_object(patch)?;
        let Some(prior) = self.get(key).await? else {
            return Ok(false);
        };

        let mut map = match serde_json::from_slice::<Value>(&prior)? {
            Value::Object(map) => map,
            _ => return Err(DbError::Corruption(format!("stored document {} is not an object", key))),
        };
        for (field, value) in patch {
            if RESERVED_FIELDS.contains(&field.as_str()) {
                continue;
            }
            map.insert(field, value);
        }

        let now = Utc::now();
        document::stamp(&mut map, key, Some(&prior), now);
        let bytes = serde_json::to_vec(&Value::Object(map))?;

        // An update lands hot and keeps the entry's existing expiry
        let expires = self.hot.get_entry(key).and_then(|e| e.expires_at);
        self.apply_set(key, bytes, Some(&prior), expires)?;
        Ok(true)
    }

    /// Batched shallow-merge. Returns the keys that were not found.
    pub async fn update_many(&self, updates: &[(String, Map<String, Value>)]) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for (key, patch) in updates {
            let raw = serde_json::to_vec(&Value::Object(patch.clone()))?;
            if !self.update_document(key, &raw).await? {
                failed.push(key.clone());
            }
        }
        Ok(failed)
    }

    /// Delete from whichever tier holds the key. Returns whether it existed.
    pub async fn delete_document(&self, key: &str) -> Result<bool> {
        let mut existed = false;
        let now = Utc::now();

        if let Some(entry) = self.hot.remove(key) {
            self.unindex_raw(key, &entry.value);
            // Deleting an already-expired key reports NotFound
            existed = !entry.is_expired(now);
        }

        let mut cold = self.cold.lock().await;
        if cold.contains(key) {
            if let Some(raw) = cold.get(key)? {
                self.unindex_raw(key, &raw);
            }
            cold.delete(key)?;
            existed = true;
        }

        Ok(existed)
    }

    /// Batched delete. Returns the keys that were not found.
    pub async fn delete_many(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for key in keys {
            if !self.delete_document(key).await? {
                failed.push(key.clone());
            }
        }
        Ok(failed)
    }

    /// Tiered read: hot first, then cold
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.hot.get(key) {
            return Ok(Some(value));
        }
        self.cold.lock().await.get(key)
    }

    /// Batched tiered read preserving input order of found keys
    pub async fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::with_capacity(keys.len());
        let mut cold_wanted = Vec::new();
        for key in keys {
            match self.hot.get(key) {
                Some(value) => out.push((key.clone(), value)),
                None => cold_wanted.push(key.clone()),
            }
        }
        if !cold_wanted.is_empty() {
            let cold = self.cold.lock().await;
            for key in cold_wanted {
                if let Some(raw) = cold.get(&key)? {
                    out.push((key, raw));
                }
            }
        }
        Ok(out)
    }

    /// Iterate live hot entries without copying values
    pub fn stream_hot<F>(&self, f: F)
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        self.hot.stream_all(f)
    }

    /// Iterate live cold records under the file lock
    pub async fn scan_cold<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8], &Value) -> bool,
    {
        self.cold.lock().await.scan(f)
    }

    /// Total live documents across both tiers
    pub async fn count(&self) -> usize {
        // Hot entries may shadow a stale cold record; subtract the overlap.
        let cold = self.cold.lock().await;
        let mut hot_live = 0usize;
        let mut overlap = 0usize;
        self.hot.stream_all(|key, _| {
            hot_live += 1;
            if cold.contains(key) {
                overlap += 1;
            }
            true
        });
        hot_live + cold.len() - overlap
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    /// Create an index over a top-level field, backfilling from both tiers
    pub async fn create_index(&self, field: &str) -> Result<()> {
        if field.is_empty() {
            return Err(DbError::BadRequest("index field must not be empty".into()));
        }
        if self.indexes.contains_key(field) {
            return Ok(());
        }

        let index = Arc::new(FieldIndex::new(field));
        let mut hot_ids = std::collections::HashSet::new();
        self.hot.stream_all(|key, raw| {
            if let Ok(doc) = serde_json::from_slice::<Value>(raw) {
                index.insert(key, &doc);
            }
            hot_ids.insert(key.to_string());
            true
        });
        self.cold.lock().await.scan(|id, _, doc| {
            if !hot_ids.contains(id) {
                index.insert(id, doc);
            }
            true
        })?;

        self.indexes.insert(field.to_string(), index);
        debug!(collection = %self.name, field, "index built");
        Ok(())
    }

    /// Drop an index. Returns whether it existed.
    pub fn drop_index(&self, field: &str) -> bool {
        self.indexes.remove(field).is_some()
    }

    pub fn index(&self, field: &str) -> Option<Arc<FieldIndex>> {
        self.indexes.get(field).map(|e| e.value().clone())
    }

    pub fn index_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.indexes.iter().map(|e| e.key().clone()).collect();
        fields.sort();
        fields
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    /// Remove all expired hot entries and their index contributions
    pub fn clean_expired(&self) -> usize {
        let drained = self.hot.drain_expired();
        for (key, entry) in &drained {
            self.unindex_raw(key, &entry.value);
        }
        drained.len()
    }

    // ------------------------------------------------------------------
    // Saver support
    // ------------------------------------------------------------------

    /// Move persistable hot entries to the cold file (the tier move of the
    /// async saver). Returns how many entries were persisted.
    pub async fn flush_hot(&self, compact_threshold: usize) -> Result<usize> {
        let snapshot = self.hot.snapshot_persistent();
        if snapshot.is_empty() {
            return Ok(0);
        }

        {
            let mut cold = self.cold.lock().await;
            cold.upsert_many(snapshot.iter().map(|(k, v)| (k.as_str(), v.as_slice())))?;
            cold.maybe_compact(compact_threshold)?;
        }

        // Only evict what was snapshotted; entries rewritten concurrently
        // stay hot and the dedup queue re-saves them.
        let count = snapshot.len();
        self.hot.evict_unchanged(&snapshot);
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drop all state and delete the on-disk files
    pub async fn destroy(&self) -> Result<()> {
        self.hot.clear();
        self.indexes.clear();
        self.cold.lock().await.destroy()
    }

    /// Forget in-memory state and re-read the files (restore path)
    pub async fn reload(&self) -> Result<()> {
        self.hot.clear();
        self.indexes.clear();
        self.cold.lock().await.reload()
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------

    fn apply_set(
        &self,
        key: &str,
        bytes: Vec<u8>,
        cold_prior: Option<&[u8]>,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        let doc: Value = serde_json::from_slice(&bytes)?;

        let old = self
            .hot
            .set(key.to_string(), Entry::new(bytes, expires_at));
        match old {
            // The swapped-out hot entry carries the exact values to retract
            Some(old) => self.unindex_raw(key, &old.value),
            // First hot write for this key: retract the shadowed cold version
            None => {
                if let Some(prior) = cold_prior {
                    self.unindex_raw(key, prior);
                }
            }
        }

        for index in self.indexes.iter() {
            index.value().insert(key, &doc);
        }
        Ok(())
    }

    fn unindex_raw(&self, key: &str, raw: &[u8]) {
        if self.indexes.is_empty() {
            return;
        }
        if let Ok(doc) = serde_json::from_slice::<Value>(raw) {
            for index in self.indexes.iter() {
                index.value().remove(key, &doc);
            }
        }
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("hot", &self.hot.len())
            .field("indexes", &self.indexes.len())
            .finish()
    }
}
