//! Startup recovery: WAL replay
//!
//! Each logged entry re-runs the same decode path the live command took.
//! Entries that fail to decode or apply are logged and skipped; the data
//! around them is still recovered.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::command::*;
use crate::protocol::CommandKind;
use crate::txn::TxOp;
use crate::wal::Wal;

use super::CollectionManager;

/// Replay the current WAL into the stores. Returns the number of entries
/// applied.
pub async fn replay(mgr: &Arc<CollectionManager>) -> Result<usize> {
    let path = mgr.config().wal_path();
    if !path.exists() {
        return Ok(0);
    }

    let mut applied = 0usize;
    for (kind, payload) in Wal::replay(&path)? {
        match apply_entry(mgr, kind, &payload, true).await {
            Ok(()) => applied += 1,
            Err(e) => warn!(?kind, error = %e, "WAL entry skipped during replay"),
        }
    }
    Ok(applied)
}

/// Apply one WAL entry. `allow_restore` is false when replaying a backup's
/// WAL copy, so a restore cannot recurse into another restore.
///
/// Boxed (rather than `async fn`) to break the apply_entry <-> restore
/// mutual-recursion cycle: an opaque `impl Future` here would require
/// rustc to resolve its own Send-ness to resolve itself.
pub fn apply_entry<'a>(
    mgr: &'a Arc<CollectionManager>,
    kind: CommandKind,
    payload: &'a [u8],
    allow_restore: bool,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(apply_entry_inner(mgr, kind, payload, allow_restore))
}

async fn apply_entry_inner(
    mgr: &Arc<CollectionManager>,
    kind: CommandKind,
    payload: &[u8],
    allow_restore: bool,
) -> Result<()> {
    match kind {
        CommandKind::Set => {
            let cmd = MainSetCmd::decode(payload)?;
            mgr.main().set(&cmd.key, cmd.value, cmd.ttl);
        }
        CommandKind::CollectionCreate => {
            let cmd = CollectionNameCmd::decode(payload)?;
            mgr.collection(&cmd.name)?;
        }
        CommandKind::CollectionDelete => {
            let cmd = CollectionNameCmd::decode(payload)?;
            mgr.drop_collection(&cmd.name).await?;
        }
        CommandKind::CollectionIndexCreate => {
            let cmd = IndexCmd::decode(payload)?;
            mgr.create_index(&cmd.collection, &cmd.field).await?;
        }
        CommandKind::CollectionIndexDelete => {
            let cmd = IndexCmd::decode(payload)?;
            mgr.drop_index(&cmd.collection, &cmd.field).await?;
        }
        CommandKind::CollectionItemSet => {
            let cmd = ItemSetCmd::decode(payload)?;
            let coll = mgr.collection(&cmd.collection)?;
            coll.put_document(&cmd.key, &cmd.value, cmd.ttl).await?;
        }
        CommandKind::CollectionItemSetMany => {
            let cmd = ItemSetManyCmd::decode(payload)?;
            let coll = mgr.collection(&cmd.collection)?;
            let docs: Vec<serde_json::Value> = serde_json::from_slice(&cmd.docs)?;
            for doc in docs {
                let raw = serde_json::to_vec(&doc)?;
                if let Err(e) = coll.put_document("", &raw, 0).await {
                    warn!(collection = %cmd.collection, error = %e, "replayed batch insert skipped a document");
                }
            }
        }
        CommandKind::CollectionItemDelete => {
            let cmd = ItemKeyCmd::decode(payload)?;
            let coll = mgr.collection(&cmd.collection)?;
            coll.delete_document(&cmd.key).await?;
        }
        CommandKind::CollectionItemDeleteMany => {
            let cmd = ItemKeysCmd::decode(payload)?;
            let coll = mgr.collection(&cmd.collection)?;
            coll.delete_many(&cmd.keys).await?;
        }
        CommandKind::CollectionItemUpdate => {
            let cmd = ItemUpdateCmd::decode(payload)?;
            let coll = mgr.collection(&cmd.collection)?;
            coll.update_document(&cmd.key, &cmd.patch).await?;
        }
        CommandKind::CollectionItemUpdateMany => {
            let cmd = ItemUpdateManyCmd::decode(payload)?;
            let coll = mgr.collection(&cmd.collection)?;
            let updates = crate::document::parse_update_many(&cmd.updates)?;
            coll.update_many(&updates).await?;
        }
        CommandKind::ChangeUserPassword => {
            let cmd = ChangePasswordCmd::decode(payload)?;
            crate::auth::change_password(mgr, &cmd.username, &cmd.password).await?;
        }
        CommandKind::UserCreate => {
            let cmd = UserCreateCmd::decode(payload)?;
            crate::auth::create_user(mgr, &cmd.username, &cmd.password, &cmd.permissions).await?;
        }
        CommandKind::UserUpdate => {
            let cmd = UserUpdateCmd::decode(payload)?;
            crate::auth::update_user(mgr, &cmd.username, &cmd.patch).await?;
        }
        CommandKind::UserDelete => {
            let cmd = UserDeleteCmd::decode(payload)?;
            crate::auth::delete_user(mgr, &cmd.username).await?;
        }
        CommandKind::Commit => {
            let ops: Vec<TxOp> = bincode::deserialize(payload)?;
            let applied = crate::txn::apply_ops(mgr, &ops).await;
            debug!(ops = ops.len(), applied, "replayed transaction commit");
        }
        CommandKind::Restore => {
            let cmd = RestoreCmd::decode(payload)?;
            if !allow_restore {
                warn!(backup = %cmd.name, "nested restore entry ignored");
            } else if mgr.backups_dir().join(&cmd.name).is_dir() {
                crate::backup::restore(mgr, &cmd.name).await?;
            } else {
                warn!(backup = %cmd.name, "restore entry references a missing backup, skipped");
            }
        }
        other => {
            warn!(?other, "non-write command found in WAL, ignored");
        }
    }
    Ok(())
}
