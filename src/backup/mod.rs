//! Backup and restore
//!
//! A backup is a point-in-time copy of every data file plus the current
//! WAL, staged in a temporary directory and finalized with an atomic
//! rename. Restore is the destructive inverse: background tasks stop,
//! in-memory state is dropped, the files copy back, the backup's WAL
//! replays, and the live WAL rotates.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{DbError, Result};
use crate::manager::CollectionManager;
use crate::wal::Wal;

const WAL_COPY_NAME: &str = "wal.log";

/// Create a timestamped backup directory. Returns its name.
pub async fn perform_backup(mgr: &Arc<CollectionManager>) -> Result<String> {
    // Flush everything first so the file copies are the whole state; the
    // rotation this implies means the copied WAL is usually empty.
    mgr.save_all_now().await?;

    let name = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let final_dir = mgr.backups_dir().join(&name);
    if final_dir.exists() {
        return Err(DbError::Conflict(format!("backup {} already exists", name)));
    }
    let tmp_dir = mgr.backups_dir().join(format!("{}.tmp", name));
    if tmp_dir.exists() {
        std::fs::remove_dir_all(&tmp_dir)?;
    }
    std::fs::create_dir_all(tmp_dir.join("collections"))?;

    let result = stage_backup(mgr, &tmp_dir);
    if let Err(e) = result {
        let _ = std::fs::remove_dir_all(&tmp_dir);
        return Err(e);
    }

    std::fs::rename(&tmp_dir, &final_dir)?;
    info!(backup = %name, "backup complete");
    Ok(name)
}

fn stage_backup(mgr: &Arc<CollectionManager>, tmp_dir: &Path) -> Result<()> {
    let data_dir = &mgr.config().storage.data_dir;

    for entry in std::fs::read_dir(mgr.collections_dir())? {
        let path = entry?.path();
        if is_data_file(&path) {
            copy_file(&path, &tmp_dir.join("collections").join(file_name(&path)?))?;
        }
    }

    for name in ["_system.dat", "_system.tomb", "main.dat"] {
        let src = data_dir.join(name);
        if src.exists() {
            copy_file(&src, &tmp_dir.join(name))?;
        }
    }

    let wal_path = mgr.config().wal_path();
    if wal_path.exists() {
        copy_file(&wal_path, &tmp_dir.join(WAL_COPY_NAME))?;
    }

    Ok(())
}

/// Restore from a backup directory. Destructive; the caller has already
/// WAL-logged the operation so a crash mid-restore re-runs it.
pub async fn restore(mgr: &Arc<CollectionManager>, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(DbError::BadRequest(format!("invalid backup name {:?}", name)));
    }
    let backup_dir = mgr.backups_dir().join(name);
    if !backup_dir.is_dir() {
        return Err(DbError::NotFound(format!("backup {}", name)));
    }

    mgr.pause_background();
    let result = restore_inner(mgr, &backup_dir).await;
    mgr.resume_background();

    match &result {
        Ok(()) => info!(backup = %name, "restore complete"),
        Err(e) => warn!(backup = %name, error = %e, "restore failed"),
    }
    result
}

async fn restore_inner(mgr: &Arc<CollectionManager>, backup_dir: &Path) -> Result<()> {
    let data_dir = mgr.config().storage.data_dir.clone();

    // Drop the live collection files, then copy the backup's in
    for entry in std::fs::read_dir(mgr.collections_dir())? {
        let path = entry?.path();
        if is_data_file(&path) {
            std::fs::remove_file(&path)?;
        }
    }
    let backup_collections = backup_dir.join("collections");
    if backup_collections.is_dir() {
        for entry in std::fs::read_dir(&backup_collections)? {
            let path = entry?.path();
            if is_data_file(&path) {
                copy_file(&path, &mgr.collections_dir().join(file_name(&path)?))?;
            }
        }
    }

    for name in ["_system.dat", "_system.tomb", "main.dat"] {
        let src = backup_dir.join(name);
        let dst = data_dir.join(name);
        if src.exists() {
            copy_file(&src, &dst)?;
        } else if dst.exists() {
            std::fs::remove_file(&dst)?;
        }
    }

    mgr.reload_all().await?;

    // Replay the backup's WAL copy on top of the copied files
    let wal_copy = backup_dir.join(WAL_COPY_NAME);
    if wal_copy.exists() {
        let mut replayed = 0usize;
        for (kind, payload) in Wal::replay(&wal_copy)? {
            // apply_entry already returns a boxed future, breaking the
            // restore → apply_entry → restore cycle
            match crate::manager::recovery::apply_entry(mgr, kind, &payload, false).await {
                Ok(()) => replayed += 1,
                Err(e) => warn!(?kind, error = %e, "backup WAL entry skipped"),
            }
        }
        if replayed > 0 {
            info!(entries = replayed, "backup WAL replayed");
        }
    }

    // The restored state is now fully on disk; rotate so the live WAL no
    // longer holds pre-restore operations (including the Restore entry).
    mgr.save_all_now().await?;
    Ok(())
}

fn is_data_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("dat") | Some("tomb")
    )
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| DbError::Internal(format!("path without file name: {}", path.display())))
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst)?;
    Ok(())
}
