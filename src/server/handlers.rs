//! Command handlers
//!
//! Each handler: decode → authorize → WAL (write-class) → apply → one
//! response. Authorization precedes the WAL append so the log only ever
//! contains operations the caller was allowed to make; payload-level
//! failures after the append re-fail identically on replay.

use std::net::SocketAddr;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::{self, Permission};
use crate::document;
use crate::error::{DbError, Result};
use crate::manager::{SaveTarget, SYSTEM_COLLECTION};
use crate::protocol::command::*;
use crate::protocol::{CommandKind, Response, Status};
use crate::query::QuerySpec;
use crate::txn::TxOp;

use super::dispatch::ServerCtx;
use super::session::Session;

pub async fn handle(
    ctx: &ServerCtx,
    session: &mut Session,
    peer: SocketAddr,
    kind: CommandKind,
    payload: Vec<u8>,
) -> Response {
    match handle_inner(ctx, session, peer, kind, &payload).await {
        Ok(response) => response,
        Err(e) => Response::from_err(&e),
    }
}

async fn handle_inner(
    ctx: &ServerCtx,
    session: &mut Session,
    peer: SocketAddr,
    kind: CommandKind,
    payload: &[u8],
) -> Result<Response> {
    if kind == CommandKind::Authenticate {
        return authenticate(ctx, session, peer, payload).await;
    }
    if !session.is_authenticated() {
        return Ok(Response::error(
            Status::Unauthorized,
            "authentication required",
        ));
    }

    match kind {
        CommandKind::Authenticate => unreachable!("handled above"),

        // -- users ----------------------------------------------------
        CommandKind::ChangeUserPassword => {
            require_root(session)?;
            let cmd = ChangePasswordCmd::decode(payload)?;
            log_write(ctx, kind, payload).await?;
            auth::change_password(&ctx.mgr, &cmd.username, &cmd.password).await?;
            Ok(Response::ok("password changed"))
        }
        CommandKind::UserCreate => {
            require_root(session)?;
            let cmd = UserCreateCmd::decode(payload)?;
            log_write(ctx, kind, payload).await?;
            auth::create_user(&ctx.mgr, &cmd.username, &cmd.password, &cmd.permissions).await?;
            info!(username = %cmd.username, "user created");
            Ok(Response::ok("user created"))
        }
        CommandKind::UserUpdate => {
            require_root(session)?;
            let cmd = UserUpdateCmd::decode(payload)?;
            log_write(ctx, kind, payload).await?;
            auth::update_user(&ctx.mgr, &cmd.username, &cmd.patch).await?;
            Ok(Response::ok("user updated"))
        }
        CommandKind::UserDelete => {
            require_root(session)?;
            let cmd = UserDeleteCmd::decode(payload)?;
            log_write(ctx, kind, payload).await?;
            auth::delete_user(&ctx.mgr, &cmd.username).await?;
            info!(username = %cmd.username, "user deleted");
            Ok(Response::ok("user deleted"))
        }

        // -- main store -----------------------------------------------
        CommandKind::Set => {
            require_root(session)?;
            let cmd = MainSetCmd::decode(payload)?;
            if cmd.key.is_empty() {
                return Err(DbError::BadRequest("key must not be empty".into()));
            }
            log_write(ctx, kind, payload).await?;
            ctx.mgr.main().set(&cmd.key, cmd.value, cmd.ttl);
            ctx.mgr.enqueue_save(SaveTarget::Main);
            Ok(Response::ok("OK"))
        }
        CommandKind::Get => {
            require_root(session)?;
            let cmd = MainGetCmd::decode(payload)?;
            match ctx.mgr.main().get(&cmd.key) {
                Some(value) => Ok(Response::ok_data("OK", value)),
                None => Ok(Response::error(
                    Status::NotFound,
                    format!("key {:?} not found", cmd.key),
                )),
            }
        }

        // -- collections ----------------------------------------------
        CommandKind::CollectionCreate => {
            let cmd = CollectionNameCmd::decode(payload)?;
            require_perm(session, &cmd.name, Permission::Write)?;
            log_write(ctx, kind, payload).await?;
            ctx.mgr.collection(&cmd.name)?;
            info!(collection = %cmd.name, "collection created");
            Ok(Response::ok("collection created"))
        }
        CommandKind::CollectionDelete => {
            let cmd = CollectionNameCmd::decode(payload)?;
            require_perm(session, &cmd.name, Permission::Write)?;
            log_write(ctx, kind, payload).await?;
            if ctx.mgr.drop_collection(&cmd.name).await? {
                info!(collection = %cmd.name, "collection deleted");
                Ok(Response::ok("collection deleted"))
            } else {
                Ok(Response::error(
                    Status::NotFound,
                    format!("collection {:?} not found", cmd.name),
                ))
            }
        }
        CommandKind::CollectionList => {
            let user = current_user(session)?;
            let names: Vec<String> = ctx
                .mgr
                .list_collections()
                .into_iter()
                .filter(|name| user.can(name, Permission::Read))
                .collect();
            Ok(Response::ok_data("OK", serde_json::to_vec(&names)?))
        }

        // -- indexes --------------------------------------------------
        CommandKind::CollectionIndexCreate => {
            let cmd = IndexCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Write)?;
            if cmd.field.is_empty() {
                return Err(DbError::BadRequest("index field must not be empty".into()));
            }
            log_write(ctx, kind, payload).await?;
            ctx.mgr.create_index(&cmd.collection, &cmd.field).await?;
            Ok(Response::ok("index created"))
        }
        CommandKind::CollectionIndexDelete => {
            let cmd = IndexCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Write)?;
            log_write(ctx, kind, payload).await?;
            if ctx.mgr.drop_index(&cmd.collection, &cmd.field).await? {
                Ok(Response::ok("index deleted"))
            } else {
                Ok(Response::error(
                    Status::NotFound,
                    format!("no index on {:?}", cmd.field),
                ))
            }
        }
        CommandKind::CollectionIndexList => {
            let cmd = CollectionOnlyCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Read)?;
            let fields = ctx
                .mgr
                .get_existing(&cmd.collection)
                .map(|c| c.index_fields())
                .unwrap_or_default();
            Ok(Response::ok_data("OK", serde_json::to_vec(&fields)?))
        }

        // -- items ----------------------------------------------------
        CommandKind::CollectionItemSet => {
            let mut cmd = ItemSetCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Write)?;

            // Resolve the key up front: the buffered op and the WAL entry
            // must name the id the live execution used, or replay and
            // read-your-writes would mint a different one
            if cmd.key.is_empty() {
                let map = document::parse_object(&cmd.value)?;
                cmd.key = document::extract_id(&map)
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(document::generate_id);
            }

            if let Some(tx) = session.tx {
                // Buffered documents carry stamped reserved fields too, so
                // read-your-writes returns the same shape every other read
                // path does. The commit re-stamps `updated_at` at apply
                // time, like any write.
                let mut map = document::parse_object(&cmd.value)?;
                let prior = match ctx.txns.read_buffered(tx, &cmd.collection, &cmd.key) {
                    // The latest buffered effect wins over committed state
                    Some(buffered) => buffered,
                    None => match ctx.mgr.get_existing(&cmd.collection) {
                        Some(coll) => coll.get(&cmd.key).await?,
                        None => None,
                    },
                };
                document::stamp(&mut map, &cmd.key, prior.as_deref(), Utc::now());
                let value = serde_json::to_vec(&Value::Object(map))?;

                ctx.txns.record(
                    tx,
                    TxOp::Set {
                        collection: cmd.collection.clone(),
                        key: cmd.key.clone(),
                        value,
                        ttl: cmd.ttl,
                    },
                )?;
                return Ok(Response::ok_data("buffered", cmd.key.into_bytes()));
            }

            log_write(ctx, kind, &cmd.encode()).await?;
            let coll = ctx.mgr.collection(&cmd.collection)?;
            let id = coll.put_document(&cmd.key, &cmd.value, cmd.ttl).await?;
            ctx.mgr
                .enqueue_save(SaveTarget::Collection(cmd.collection.clone()));
            Ok(Response::ok_data("item set", id.into_bytes()))
        }
        CommandKind::CollectionItemSetMany => {
            let cmd = ItemSetManyCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Write)?;
            reject_in_tx(session)?;

            let mut docs: Vec<Value> = serde_json::from_slice(&cmd.docs)
                .map_err(|e| DbError::BadRequest(format!("documents must be a JSON array: {}", e)))?;

            // Assign ids before logging so replay reproduces them
            for doc in &mut docs {
                if let Value::Object(map) = doc {
                    let missing = document::extract_id(map)
                        .filter(|id| !id.is_empty())
                        .is_none();
                    if missing {
                        map.insert(
                            document::FIELD_ID.to_string(),
                            Value::String(document::generate_id()),
                        );
                    }
                }
            }
            let canonical = ItemSetManyCmd {
                collection: cmd.collection.clone(),
                docs: serde_json::to_vec(&docs)?,
            };
            log_write(ctx, kind, &canonical.encode()).await?;

            let coll = ctx.mgr.collection(&cmd.collection)?;
            let mut inserted = 0usize;
            let mut failed_keys = Vec::new();
            for (i, doc) in docs.iter().enumerate() {
                let raw = serde_json::to_vec(doc)?;
                match coll.put_document("", &raw, 0).await {
                    Ok(_) => inserted += 1,
                    Err(_) => failed_keys.push(
                        doc.get(document::FIELD_ID)
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("#{}", i)),
                    ),
                }
            }
            ctx.mgr
                .enqueue_save(SaveTarget::Collection(cmd.collection.clone()));
            Ok(Response::ok_data(
                "items set",
                serde_json::to_vec(&json!({ "inserted": inserted, "failed_keys": failed_keys }))?,
            ))
        }
        CommandKind::CollectionItemGet => {
            let cmd = ItemKeyCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Read)?;

            // Read-your-writes inside a transaction
            if let Some(tx) = session.tx {
                match ctx.txns.read_buffered(tx, &cmd.collection, &cmd.key) {
                    Some(Some(value)) => return Ok(Response::ok_data("OK", value)),
                    Some(None) => {
                        return Ok(Response::error(
                            Status::NotFound,
                            format!("item {:?} not found", cmd.key),
                        ))
                    }
                    None => {}
                }
            }

            let Some(coll) = ctx.mgr.get_existing(&cmd.collection) else {
                return Ok(Response::error(
                    Status::NotFound,
                    format!("collection {:?} not found", cmd.collection),
                ));
            };
            match coll.get(&cmd.key).await? {
                Some(value) => Ok(Response::ok_data("OK", value)),
                None => Ok(Response::error(
                    Status::NotFound,
                    format!("item {:?} not found", cmd.key),
                )),
            }
        }
        CommandKind::CollectionItemDelete => {
            let cmd = ItemKeyCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Write)?;

            if let Some(tx) = session.tx {
                ctx.txns.record(
                    tx,
                    TxOp::Delete {
                        collection: cmd.collection.clone(),
                        key: cmd.key.clone(),
                    },
                )?;
                return Ok(Response::ok("buffered"));
            }

            log_write(ctx, kind, payload).await?;
            let coll = ctx.mgr.collection(&cmd.collection)?;
            // Deletes are idempotent: removing an absent key still succeeds
            if coll.delete_document(&cmd.key).await? {
                ctx.mgr
                    .enqueue_save(SaveTarget::Collection(cmd.collection.clone()));
                Ok(Response::ok("item deleted"))
            } else {
                Ok(Response::ok("item already absent"))
            }
        }
        CommandKind::CollectionItemDeleteMany => {
            let cmd = ItemKeysCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Write)?;
            reject_in_tx(session)?;

            log_write(ctx, kind, payload).await?;
            let coll = ctx.mgr.collection(&cmd.collection)?;
            let failed_keys = coll.delete_many(&cmd.keys).await?;
            let deleted = cmd.keys.len() - failed_keys.len();
            ctx.mgr
                .enqueue_save(SaveTarget::Collection(cmd.collection.clone()));
            Ok(Response::ok_data(
                "items deleted",
                serde_json::to_vec(&json!({ "deleted": deleted, "failed_keys": failed_keys }))?,
            ))
        }
        CommandKind::CollectionItemList => {
            let cmd = ItemListCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Read)?;

            let spec = QuerySpec {
                offset: cmd.offset.max(0) as usize,
                limit: if cmd.limit < 0 {
                    None
                } else {
                    Some(cmd.limit as usize)
                },
                ..QuerySpec::default()
            };
            let data = ctx.engine.run(&cmd.collection, &spec).await?;
            Ok(Response::ok_data("OK", data))
        }
        CommandKind::CollectionItemUpdate => {
            let cmd = ItemUpdateCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Write)?;
            reject_in_tx(session)?;

            log_write(ctx, kind, payload).await?;
            let coll = ctx.mgr.collection(&cmd.collection)?;
            if coll.update_document(&cmd.key, &cmd.patch).await? {
                ctx.mgr
                    .enqueue_save(SaveTarget::Collection(cmd.collection.clone()));
                Ok(Response::ok("item updated"))
            } else {
                Ok(Response::error(
                    Status::NotFound,
                    format!("item {:?} not found", cmd.key),
                ))
            }
        }
        CommandKind::CollectionItemUpdateMany => {
            let cmd = ItemUpdateManyCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Write)?;
            reject_in_tx(session)?;

            let updates = document::parse_update_many(&cmd.updates)?;
            log_write(ctx, kind, payload).await?;
            let coll = ctx.mgr.collection(&cmd.collection)?;
            let failed_keys = coll.update_many(&updates).await?;
            let updated = updates.len() - failed_keys.len();
            ctx.mgr
                .enqueue_save(SaveTarget::Collection(cmd.collection.clone()));
            Ok(Response::ok_data(
                "items updated",
                serde_json::to_vec(&json!({ "updated": updated, "failed_keys": failed_keys }))?,
            ))
        }

        // -- queries --------------------------------------------------
        CommandKind::CollectionQuery => {
            let cmd = QueryCmd::decode(payload)?;
            require_perm(session, &cmd.collection, Permission::Read)?;
            let data = ctx.engine.execute(&cmd.collection, &cmd.query).await?;
            Ok(Response::ok_data("OK", data))
        }

        // -- transactions ---------------------------------------------
        CommandKind::Begin => {
            if session.tx.is_some() {
                return Err(DbError::Transaction(
                    "a transaction is already open on this connection".into(),
                ));
            }
            let id = ctx.txns.begin();
            session.tx = Some(id);
            Ok(Response::ok_data("transaction started", id.to_string().into_bytes()))
        }
        CommandKind::Commit => {
            let Some(id) = session.tx.take() else {
                return Err(DbError::Transaction("no open transaction".into()));
            };
            let applied = ctx.txns.commit(id).await?;
            Ok(Response::ok(format!("transaction committed ({} ops)", applied)))
        }
        CommandKind::Rollback => {
            let Some(id) = session.tx.take() else {
                return Err(DbError::Transaction("no open transaction".into()));
            };
            ctx.txns.rollback(id);
            Ok(Response::ok("transaction rolled back"))
        }

        // -- backup ---------------------------------------------------
        CommandKind::Backup => {
            require_root(session)?;
            let name = crate::backup::perform_backup(&ctx.mgr).await?;
            Ok(Response::ok_data("backup complete", name.into_bytes()))
        }
        CommandKind::Restore => {
            require_root(session)?;
            let cmd = RestoreCmd::decode(payload)?;
            if !ctx.mgr.backups_dir().join(&cmd.name).is_dir() {
                return Err(DbError::NotFound(format!("backup {}", cmd.name)));
            }
            log_write(ctx, kind, payload).await?;
            crate::backup::restore(&ctx.mgr, &cmd.name).await?;
            Ok(Response::ok("restore complete"))
        }
    }
}

async fn authenticate(
    ctx: &ServerCtx,
    session: &mut Session,
    peer: SocketAddr,
    payload: &[u8],
) -> Result<Response> {
    let cmd = AuthenticateCmd::decode(payload)?;
    let user = auth::authenticate(
        &ctx.mgr,
        &cmd.username,
        &cmd.password,
        peer.ip().is_loopback(),
    )
    .await?;
    info!(username = %user.username, %peer, "authenticated");
    session.user = Some(user);
    Ok(Response::ok("authenticated"))
}

async fn log_write(ctx: &ServerCtx, kind: CommandKind, payload: &[u8]) -> Result<()> {
    ctx.mgr.wal().append(kind, payload).await
}

fn current_user<'a>(session: &'a Session) -> Result<&'a crate::auth::AuthedUser> {
    session
        .user
        .as_ref()
        .ok_or_else(|| DbError::Unauthorized("authentication required".into()))
}

fn require_root(session: &Session) -> Result<()> {
    let user = current_user(session)?;
    if !user.is_root {
        return Err(DbError::Unauthorized("root privileges required".into()));
    }
    Ok(())
}

fn require_perm(session: &Session, collection: &str, need: Permission) -> Result<()> {
    crate::manager::CollectionManager::validate_collection_name(collection)?;
    let user = current_user(session)?;

    // The system collection always takes write permission, reads included,
    // and the wildcard grant does not reach it
    if collection == SYSTEM_COLLECTION {
        let explicit = user
            .permissions
            .get(SYSTEM_COLLECTION)
            .map_or(false, |p| p.allows(Permission::Write));
        if user.is_root || explicit {
            return Ok(());
        }
        return Err(DbError::Unauthorized(
            "system collection requires an explicit write grant".into(),
        ));
    }

    if !user.can(collection, need) {
        return Err(DbError::Unauthorized(format!(
            "missing {:?} permission on {:?}",
            need, collection
        )));
    }
    Ok(())
}

fn reject_in_tx(session: &Session) -> Result<()> {
    if session.tx.is_some() {
        return Err(DbError::Transaction(
            "this command is not supported inside a transaction".into(),
        ));
    }
    Ok(())
}
