//! Collection manager
//!
//! Owns every collection, the distinguished `_system` collection, the main
//! key/value store, the WAL, and the background tasks: a deduplicating
//! async saver and the TTL expiry sweeper.

pub mod main_store;
pub mod recovery;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DbError, Result};
use crate::store::Collection;
use crate::wal::Wal;

use main_store::MainStore;

/// Reserved collection holding users and server metadata
pub const SYSTEM_COLLECTION: &str = "_system";

/// Save-queue target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SaveTarget {
    Collection(String),
    Main,
}

pub struct CollectionManager {
    config: Config,
    collections_dir: PathBuf,
    backups_dir: PathBuf,

    collections: DashMap<String, Arc<Collection>>,
    system: Arc<Collection>,
    main: MainStore,
    wal: Arc<Wal>,

    save_tx: mpsc::UnboundedSender<SaveTarget>,
    save_rx: Mutex<Option<mpsc::UnboundedReceiver<SaveTarget>>>,
    pending: Mutex<HashSet<SaveTarget>>,

    shutdown_tx: broadcast::Sender<()>,
    /// Set while a restore owns the stores; background tasks idle
    paused: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl CollectionManager {
    /// Open the data directory, replay the WAL, rebuild indexes, and start
    /// the background tasks.
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let data_dir = config.storage.data_dir.clone();
        let collections_dir = data_dir.join("collections");
        let backups_dir = data_dir.join("backups");
        std::fs::create_dir_all(&collections_dir)?;
        std::fs::create_dir_all(&backups_dir)?;

        let wal = Arc::new(Wal::open(config.wal_path(), config.wal.sync_writes)?);
        let system = Arc::new(Collection::open(
            SYSTEM_COLLECTION,
            data_dir.join("_system.dat"),
            data_dir.join("_system.tomb"),
        )?);
        let main = MainStore::open(data_dir.join("main.dat"))?;

        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(4);

        let mgr = Arc::new(Self {
            config,
            collections_dir,
            backups_dir,
            collections: DashMap::new(),
            system,
            main,
            wal,
            save_tx,
            save_rx: Mutex::new(Some(save_rx)),
            pending: Mutex::new(HashSet::new()),
            shutdown_tx,
            paused: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        });

        mgr.register_existing_collections()?;

        let replayed = recovery::replay(&mgr).await?;
        if replayed > 0 {
            info!(entries = replayed, "WAL replay complete");
        }

        mgr.rebuild_indexes().await?;
        crate::auth::bootstrap_root(&mgr, &mgr.config.auth.root_password).await?;

        mgr.paused.store(false, Ordering::SeqCst);
        mgr.spawn_tasks();

        Ok(mgr)
    }

    fn register_existing_collections(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.collections_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("dat") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let collection = Arc::new(Collection::open(
                name,
                path.clone(),
                path.with_extension("tomb"),
            )?);
            self.collections.insert(name.to_string(), collection);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Collection registry
    // ------------------------------------------------------------------

    pub fn validate_collection_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(DbError::BadRequest("collection name must not be empty".into()));
        }
        if name.len() > 255 {
            return Err(DbError::BadRequest("collection name too long".into()));
        }
        if name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
        {
            return Err(DbError::BadRequest(format!(
                "collection name {:?} contains forbidden characters",
                name
            )));
        }
        if name == "." || name == ".." {
            return Err(DbError::BadRequest("collection name is reserved".into()));
        }
        Ok(())
    }

    /// Get or create a collection. `_system` resolves to the system
    /// collection; callers gate access to it.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        if name == SYSTEM_COLLECTION {
            return Ok(self.system.clone());
        }
        Self::validate_collection_name(name)?;

        if let Some(existing) = self.collections.get(name) {
            return Ok(existing.clone());
        }
        let data_path = self.collections_dir.join(format!("{}.dat", name));
        let tomb_path = self.collections_dir.join(format!("{}.tomb", name));
        let collection = Arc::new(Collection::open(name, data_path, tomb_path)?);
        Ok(self
            .collections
            .entry(name.to_string())
            .or_insert(collection)
            .clone())
    }

    /// Lookup without creating
    pub fn get_existing(&self, name: &str) -> Option<Arc<Collection>> {
        if name == SYSTEM_COLLECTION {
            return Some(self.system.clone());
        }
        self.collections.get(name).map(|e| e.value().clone())
    }

    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        if name == SYSTEM_COLLECTION {
            return Err(DbError::BadRequest("cannot delete the system collection".into()));
        }
        let Some((_, collection)) = self.collections.remove(name) else {
            return Ok(false);
        };
        collection.destroy().await?;
        // Forget its persisted index definitions
        self.system.delete_document(&index_defs_key(name)).await?;
        self.enqueue_save(SaveTarget::Collection(SYSTEM_COLLECTION.to_string()));
        Ok(true)
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn system(&self) -> &Arc<Collection> {
        &self.system
    }

    pub fn main(&self) -> &MainStore {
        &self.main
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backups_dir(&self) -> &std::path::Path {
        &self.backups_dir
    }

    pub fn collections_dir(&self) -> &std::path::Path {
        &self.collections_dir
    }

    // ------------------------------------------------------------------
    // Index definitions
    // ------------------------------------------------------------------

    /// Create an index and persist its definition in `_system`
    pub async fn create_index(&self, collection: &str, field: &str) -> Result<()> {
        let coll = self.collection(collection)?;
        coll.create_index(field).await?;
        self.persist_index_defs(collection, &coll.index_fields()).await?;
        Ok(())
    }

    /// Drop an index and its persisted definition. Returns whether it existed.
    pub async fn drop_index(&self, collection: &str, field: &str) -> Result<bool> {
        let Some(coll) = self.get_existing(collection) else {
            return Ok(false);
        };
        let existed = coll.drop_index(field);
        if existed {
            self.persist_index_defs(collection, &coll.index_fields()).await?;
        }
        Ok(existed)
    }

    async fn persist_index_defs(&self, collection: &str, fields: &[String]) -> Result<()> {
        let key = index_defs_key(collection);
        if fields.is_empty() {
            self.system.delete_document(&key).await?;
        } else {
            let doc = json!({ "fields": fields });
            self.system
                .put_document(&key, &serde_json::to_vec(&doc)?, 0)
                .await?;
        }
        self.enqueue_save(SaveTarget::Collection(SYSTEM_COLLECTION.to_string()));
        Ok(())
    }

    /// Rebuild every index named in `_system` by scanning live documents
    pub async fn rebuild_indexes(&self) -> Result<()> {
        let names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let raw = self.system.get(&index_defs_key(&name)).await?;
            let Some(raw) = raw else { continue };
            let doc: Value = serde_json::from_slice(&raw)?;
            let Some(fields) = doc.get("fields").and_then(Value::as_array) else {
                continue;
            };
            let coll = self.collection(&name)?;
            for field in fields.iter().filter_map(Value::as_str) {
                coll.create_index(field).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Save pipeline
    // ------------------------------------------------------------------

    /// Deduplicating save signal: a target already pending is coalesced
    pub fn enqueue_save(&self, target: SaveTarget) {
        if !self.config.storage.snapshots_enabled {
            return;
        }
        {
            let mut pending = self.pending.lock();
            if !pending.insert(target.clone()) {
                return;
            }
        }
        if self.save_tx.send(target).is_err() {
            warn!("save queue closed, signal dropped");
        }
    }

    async fn perform_save(&self, target: &SaveTarget) -> Result<()> {
        self.pending.lock().remove(target);
        match target {
            SaveTarget::Main => self.main.save().await,
            SaveTarget::Collection(name) => {
                let Some(coll) = self.get_existing(name) else {
                    return Ok(());
                };
                let flushed = coll
                    .flush_hot(self.config.storage.compact_dead_threshold)
                    .await?;
                if flushed > 0 {
                    debug!(collection = %name, flushed, "hot entries saved cold");
                }
                Ok(())
            }
        }
    }

    /// Synchronous flush of everything, then a WAL rotation: the snapshot
    /// now covers all applied writes.
    pub async fn save_all_now(&self) -> Result<()> {
        let threshold = self.config.storage.compact_dead_threshold;
        // Snapshot the registry first; map guards must not span awaits
        let collections: Vec<Arc<Collection>> =
            self.collections.iter().map(|e| e.value().clone()).collect();
        for collection in collections {
            collection.flush_hot(threshold).await?;
        }
        self.system.flush_hot(threshold).await?;
        self.main.save().await?;
        self.pending.lock().clear();
        self.wal.rotate().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    fn spawn_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        if self.config.storage.snapshots_enabled {
            let mgr = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            let interval = Duration::from_secs(self.config.storage.save_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut rx = mgr
                    .save_rx
                    .lock()
                    .take()
                    .expect("saver started twice");
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        signal = rx.recv() => {
                            let Some(target) = signal else { break };
                            if mgr.paused.load(Ordering::SeqCst) {
                                mgr.pending.lock().remove(&target);
                                continue;
                            }
                            if let Err(e) = mgr.perform_save(&target).await {
                                error!(?target, error = %e, "save failed");
                            }
                        }
                        _ = ticker.tick() => {
                            if mgr.paused.load(Ordering::SeqCst) {
                                continue;
                            }
                            mgr.enqueue_dirty();
                        }
                        _ = shutdown.recv() => {
                            // Drain pending signals before stopping
                            while let Ok(target) = rx.try_recv() {
                                if let Err(e) = mgr.perform_save(&target).await {
                                    error!(?target, error = %e, "save failed during drain");
                                }
                            }
                            break;
                        }
                    }
                }
                debug!("saver stopped");
            }));
        }

        {
            let mgr = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            let interval = Duration::from_secs(self.config.expiry.sweep_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if mgr.paused.load(Ordering::SeqCst) {
                                continue;
                            }
                            let mut removed = mgr.main.clean_expired();
                            removed += mgr.system.clean_expired();
                            for entry in mgr.collections.iter() {
                                removed += entry.value().clean_expired();
                            }
                            if removed > 0 {
                                debug!(removed, "expired entries swept");
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                debug!("expiry sweeper stopped");
            }));
        }
    }

    /// Signal a save for every collection that still has hot entries
    fn enqueue_dirty(&self) {
        for entry in self.collections.iter() {
            if entry.value().hot_len() > 0 {
                self.enqueue_save(SaveTarget::Collection(entry.key().clone()));
            }
        }
        if self.system.hot_len() > 0 {
            self.enqueue_save(SaveTarget::Collection(SYSTEM_COLLECTION.to_string()));
        }
        self.enqueue_save(SaveTarget::Main);
    }

    /// Stop background tasks; used by restore before it takes the stores
    pub fn pause_background(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_background(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Forget all in-memory state and re-read data files (restore path)
    pub async fn reload_all(&self) -> Result<()> {
        self.main.reload().await?;
        self.system.reload().await?;
        self.collections.clear();
        self.register_existing_collections()?;
        self.rebuild_indexes().await?;
        Ok(())
    }

    /// Graceful shutdown: stop tasks, flush everything, rotate the WAL
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down collection manager");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        let grace = Duration::from_secs(self.config.server.shutdown_grace_secs);
        for handle in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("background task did not stop within grace period");
            }
        }

        self.save_all_now().await?;
        self.wal.close().await?;
        info!("collection manager stopped");
        Ok(())
    }
}

pub(crate) fn index_defs_key(collection: &str) -> String {
    format!("indexes:{}", collection)
}

impl std::fmt::Debug for CollectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionManager")
            .field("collections", &self.collections.len())
            .field("paused", &self.paused.load(Ordering::SeqCst))
            .finish()
    }
}
