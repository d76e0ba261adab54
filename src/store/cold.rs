//! Cold tier: on-disk append file of JSON records
//!
//! Layout: a sequence of `[len:u32][json_bytes]` records, little-endian,
//! where `json_bytes` is a complete document carrying its `_id`. A sidecar
//! `.tomb` file holds the ids deleted while cold. Updates logically
//! overwrite: same-size payloads are rewritten in place, anything else is
//! appended and the stale record becomes garbage that `compact` reclaims.
//!
//! A small in-memory primary map (`_id → offset`) is rebuilt on open, so
//! point reads are a single seek instead of a scan. All methods assume the
//! caller holds the collection's file lock.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::document::FIELD_ID;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordLocation {
    /// Offset of the json payload (just past the length prefix)
    offset: u64,
    len: u32,
}

pub struct ColdStore {
    data_path: PathBuf,
    tomb_path: PathBuf,
    /// Live records only: tombstoned and superseded ids are absent
    primary: HashMap<String, RecordLocation>,
    tombstones: HashSet<String>,
    /// Records in the file that are no longer live
    dead: usize,
}

impl ColdStore {
    /// Open the cold tier for one collection, rebuilding the primary map
    pub fn open(data_path: impl Into<PathBuf>, tomb_path: impl Into<PathBuf>) -> Result<Self> {
        let data_path = data_path.into();
        let tomb_path = tomb_path.into();

        let mut store = Self {
            data_path,
            tomb_path,
            primary: HashMap::new(),
            tombstones: HashSet::new(),
            dead: 0,
        };
        // An empty data file marks the collection's existence across
        // restarts before anything is flushed to it
        if !store.data_path.exists() {
            if let Some(parent) = store.data_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            File::create(&store.data_path)?;
        }
        store.load()?;
        Ok(store)
    }

    fn load(&mut self) -> Result<()> {
        self.primary.clear();
        self.tombstones.clear();
        self.dead = 0;

        if self.data_path.exists() {
            let file = File::open(&self.data_path)?;
            let mut reader = BufReader::new(file);
            let mut offset: u64 = 0;
            let mut total = 0usize;

            loop {
                let mut len_buf = [0u8; 4];
                match reader.read_exact(&mut len_buf) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
                let len = u32::from_le_bytes(len_buf);
                let mut body = vec![0u8; len as usize];
                if reader.read_exact(&mut body).is_err() {
                    warn!(path = %self.data_path.display(), "truncated cold record discarded");
                    break;
                }

                total += 1;
                match record_id(&body) {
                    Some(id) => {
                        self.primary
                            .insert(id, RecordLocation { offset: offset + 4, len });
                    }
                    None => warn!(
                        path = %self.data_path.display(),
                        offset,
                        "cold record without _id skipped"
                    ),
                }
                offset += 4 + len as u64;
            }

            self.dead = total.saturating_sub(self.primary.len());
        }

        if self.tomb_path.exists() {
            let raw = std::fs::read_to_string(&self.tomb_path)?;
            for id in raw.lines().filter(|l| !l.is_empty()) {
                if self.primary.remove(id).is_some() {
                    self.dead += 1;
                }
                self.tombstones.insert(id.to_string());
            }
        }

        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.primary.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// Records in the file with no live reader
    pub fn dead(&self) -> usize {
        self.dead
    }

    /// Point read by primary key
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(loc) = self.primary.get(key) else {
            return Ok(None);
        };
        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(loc.offset))?;
        let mut body = vec![0u8; loc.len as usize];
        file.read_exact(&mut body)?;
        Ok(Some(body))
    }

    /// Sequential scan over live records. Returning `false` stops the scan.
    pub fn scan<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8], &Value) -> bool,
    {
        if !self.data_path.exists() || self.primary.is_empty() {
            return Ok(());
        }

        let file = File::open(&self.data_path)?;
        let mut reader = BufReader::new(file);
        let mut offset: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf);
            let mut body = vec![0u8; len as usize];
            if reader.read_exact(&mut body).is_err() {
                break;
            }

            let payload_offset = offset + 4;
            offset += 4 + len as u64;

            let Ok(doc) = serde_json::from_slice::<Value>(&body) else {
                continue;
            };
            let Some(id) = doc.get(FIELD_ID).and_then(Value::as_str) else {
                continue;
            };
            // Superseded and tombstoned records are not live
            match self.primary.get(id) {
                Some(loc) if loc.offset == payload_offset => {}
                _ => continue,
            }

            if !f(id, &body, &doc) {
                break;
            }
        }

        Ok(())
    }

    /// Logically overwrite one record
    pub fn upsert(&mut self, key: &str, bytes: &[u8]) -> Result<()> {
        self.upsert_many(std::iter::once((key, bytes)))
    }

    /// Logically overwrite a batch of records with one open/sync cycle
    pub fn upsert_many<'a, I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.data_path)?;
        let mut end = file.seek(SeekFrom::End(0))?;
        let mut tombs_changed = false;

        for (key, bytes) in items {
            let len = bytes.len() as u32;
            match self.primary.get(key).copied() {
                Some(loc) if loc.len == len => {
                    // Same size: rewrite in place
                    file.seek(SeekFrom::Start(loc.offset))?;
                    file.write_all(bytes)?;
                }
                prior => {
                    file.seek(SeekFrom::Start(end))?;
                    file.write_all(&len.to_le_bytes())?;
                    file.write_all(bytes)?;
                    self.primary.insert(
                        key.to_string(),
                        RecordLocation { offset: end + 4, len },
                    );
                    end += 4 + len as u64;
                    if prior.is_some() {
                        self.dead += 1;
                    }
                }
            }
            if self.tombstones.remove(key) {
                tombs_changed = true;
            }
        }

        file.sync_all()?;
        if tombs_changed {
            self.persist_tombstones()?;
        }
        Ok(())
    }

    /// Tombstone one key. Returns whether the key was present.
    pub fn delete(&mut self, key: &str) -> Result<bool> {
        if self.primary.remove(key).is_none() {
            return Ok(false);
        }
        self.tombstones.insert(key.to_string());
        self.dead += 1;
        self.persist_tombstones()?;
        Ok(true)
    }

    /// Tombstone a batch. Returns the keys that were not present.
    pub fn delete_many(&mut self, keys: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        let mut changed = false;
        for key in keys {
            if self.primary.remove(key).is_some() {
                self.tombstones.insert(key.clone());
                self.dead += 1;
                changed = true;
            } else {
                missing.push(key.clone());
            }
        }
        if changed {
            self.persist_tombstones()?;
        }
        Ok(missing)
    }

    /// Rewrite the file keeping only live records; clears tombstones
    pub fn compact(&mut self) -> Result<()> {
        let tmp_path = self.data_path.with_extension("dat.tmp");
        let mut new_primary = HashMap::with_capacity(self.primary.len());

        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            let mut offset: u64 = 0;
            let mut io_err: Option<std::io::Error> = None;

            self.scan(|id, raw, _| {
                let len = raw.len() as u32;
                if let Err(e) = writer
                    .write_all(&len.to_le_bytes())
                    .and_then(|_| writer.write_all(raw))
                {
                    io_err = Some(e);
                    return false;
                }
                new_primary.insert(id.to_string(), RecordLocation { offset: offset + 4, len });
                offset += 4 + len as u64;
                true
            })?;

            if let Some(e) = io_err {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e.into());
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.data_path)?;
        self.primary = new_primary;
        self.tombstones.clear();
        self.dead = 0;
        self.persist_tombstones()?;
        Ok(())
    }

    /// Compact once the dead-record count crosses the threshold
    pub fn maybe_compact(&mut self, threshold: usize) -> Result<()> {
        if threshold > 0 && self.dead >= threshold {
            self.compact()?;
        }
        Ok(())
    }

    /// Remove both files; the store becomes empty
    pub fn destroy(&mut self) -> Result<()> {
        if self.data_path.exists() {
            std::fs::remove_file(&self.data_path)?;
        }
        if self.tomb_path.exists() {
            std::fs::remove_file(&self.tomb_path)?;
        }
        self.primary.clear();
        self.tombstones.clear();
        self.dead = 0;
        Ok(())
    }

    /// Re-read both files from disk (used after restore copies them over)
    pub fn reload(&mut self) -> Result<()> {
        self.load()
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn tomb_path(&self) -> &Path {
        &self.tomb_path
    }

    fn persist_tombstones(&self) -> Result<()> {
        if self.tombstones.is_empty() {
            if self.tomb_path.exists() {
                std::fs::remove_file(&self.tomb_path)?;
            }
            return Ok(());
        }
        let tmp_path = self.tomb_path.with_extension("tomb.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            for id in &self.tombstones {
                file.write_all(id.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.tomb_path)?;
        Ok(())
    }
}

fn record_id(raw: &[u8]) -> Option<String> {
    let doc: Value = serde_json::from_slice(raw).ok()?;
    doc.get(FIELD_ID)
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl std::fmt::Debug for ColdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColdStore")
            .field("data_path", &self.data_path)
            .field("live", &self.primary.len())
            .field("dead", &self.dead)
            .field("tombstones", &self.tombstones.len())
            .finish()
    }
}
