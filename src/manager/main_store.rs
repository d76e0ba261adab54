//! Root-only flat key/value store beside the collections
//!
//! Small by design: persisted as one bincode blob (`main.dat`), written
//! tmp-then-rename, loaded whole at startup.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::document;
use crate::error::Result;
use crate::store::{Entry, Store};

#[derive(Debug, Serialize, Deserialize)]
struct MainRecord {
    key: String,
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

pub struct MainStore {
    store: Store,
    path: PathBuf,
    /// File lock for the snapshot writer
    file_lock: Mutex<()>,
}

impl MainStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = Store::new();

        if path.exists() {
            let raw = std::fs::read(&path)?;
            let records: Vec<MainRecord> = bincode::deserialize(&raw)?;
            let now = Utc::now();
            for rec in records {
                let entry = Entry::new(rec.value, rec.expires_at);
                if !entry.is_expired(now) {
                    store.set(rec.key, entry);
                }
            }
        }

        Ok(Self {
            store,
            path,
            file_lock: Mutex::new(()),
        })
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: i64) {
        let expires = document::expires_at(ttl, Utc::now());
        self.store.set(key.to_string(), Entry::new(value, expires));
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.get(key)
    }

    pub fn clean_expired(&self) -> usize {
        self.store.drain_expired().len()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    /// Snapshot the live entries to disk
    pub async fn save(&self) -> Result<()> {
        let _guard = self.file_lock.lock().await;

        let now = Utc::now();
        let mut records = Vec::with_capacity(self.store.len());
        // Snapshot under the shard guards, write outside them
        let mut pairs: Vec<(String, Vec<u8>)> = Vec::new();
        self.store.stream_all(|k, v| {
            pairs.push((k.to_string(), v.to_vec()));
            true
        });
        for (key, value) in pairs {
            let expires_at = self.store.get_entry(&key).and_then(|e| e.expires_at);
            if matches!(expires_at, Some(at) if at <= now) {
                continue;
            }
            records.push(MainRecord { key, value, expires_at });
        }

        let raw = bincode::serialize(&records)?;
        let tmp = self.path.with_extension("dat.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Forget in-memory state and re-read the file (restore path)
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.file_lock.lock().await;
        self.store.clear();
        if self.path.exists() {
            let raw = std::fs::read(&self.path)?;
            let records: Vec<MainRecord> = bincode::deserialize(&raw)?;
            let now = Utc::now();
            for rec in records {
                let entry = Entry::new(rec.value, rec.expires_at);
                if !entry.is_expired(now) {
                    self.store.set(rec.key, entry);
                }
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.dat");

        {
            let main = MainStore::open(&path).unwrap();
            main.set("a", b"1".to_vec(), 0);
            main.set("b", b"2".to_vec(), 0);
            main.save().await.unwrap();
        }

        let main = MainStore::open(&path).unwrap();
        assert_eq!(main.get("a"), Some(b"1".to_vec()));
        assert_eq!(main.get("b"), Some(b"2".to_vec()));
        assert_eq!(main.get("c"), None);
    }

    #[tokio::test]
    async fn expired_records_not_loaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.dat");

        {
            let main = MainStore::open(&path).unwrap();
            main.set("short", b"x".to_vec(), 1);
            main.set("keep", b"y".to_vec(), 0);
            main.save().await.unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let main = MainStore::open(&path).unwrap();
        assert_eq!(main.get("short"), None);
        assert_eq!(main.get("keep"), Some(b"y".to_vec()));
    }
}
