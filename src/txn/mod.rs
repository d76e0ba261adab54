//! Transactions
//!
//! A transaction buffers writes per connection and promotes them atomically
//! at commit: the op list becomes a single WAL entry (fsynced first), then
//! the ops apply to the stores in order. There is no inter-transaction
//! isolation beyond the atomic apply; reads inside a transaction are
//! read-your-writes against the buffer, falling back to committed state.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::manager::{CollectionManager, SaveTarget};
use crate::protocol::CommandKind;

/// A buffered write operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TxOp {
    Set {
        collection: String,
        key: String,
        value: Vec<u8>,
        ttl: i64,
    },
    Delete {
        collection: String,
        key: String,
    },
}

impl TxOp {
    pub fn collection(&self) -> &str {
        match self {
            TxOp::Set { collection, .. } | TxOp::Delete { collection, .. } => collection,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committing,
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct Transaction {
    state: TxState,
    ops: Vec<TxOp>,
}

pub struct TransactionManager {
    mgr: Arc<CollectionManager>,
    active: DashMap<Uuid, Transaction>,
}

impl TransactionManager {
    pub fn new(mgr: Arc<CollectionManager>) -> Self {
        Self {
            mgr,
            active: DashMap::new(),
        }
    }

    /// Start a transaction and return its id. The per-connection
    /// single-transaction rule is enforced by the session.
    pub fn begin(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.active.insert(
            id,
            Transaction {
                state: TxState::Active,
                ops: Vec::new(),
            },
        );
        id
    }

    /// Buffer a write
    pub fn record(&self, id: Uuid, op: TxOp) -> Result<()> {
        let mut tx = self
            .active
            .get_mut(&id)
            .ok_or_else(|| DbError::Transaction(format!("no such transaction {}", id)))?;
        if tx.state != TxState::Active {
            return Err(DbError::Transaction("transaction is not active".into()));
        }
        tx.ops.push(op);
        Ok(())
    }

    /// Read-your-writes: the latest buffered effect for a key, if any.
    /// `Some(None)` means the transaction deleted the key.
    pub fn read_buffered(&self, id: Uuid, collection: &str, key: &str) -> Option<Option<Vec<u8>>> {
        let tx = self.active.get(&id)?;
        for op in tx.ops.iter().rev() {
            match op {
                TxOp::Set {
                    collection: c,
                    key: k,
                    value,
                    ..
                } if c == collection && k == key => return Some(Some(value.clone())),
                TxOp::Delete {
                    collection: c,
                    key: k,
                } if c == collection && k == key => return Some(None),
                _ => {}
            }
        }
        None
    }

    /// Atomic promotion: WAL first, then the stores.
    pub async fn commit(&self, id: Uuid) -> Result<usize> {
        let ops = {
            let mut tx = self
                .active
                .get_mut(&id)
                .ok_or_else(|| DbError::Transaction(format!("no such transaction {}", id)))?;
            if tx.state != TxState::Active {
                return Err(DbError::Transaction("transaction is not active".into()));
            }
            tx.state = TxState::Committing;
            tx.ops.clone()
        };

        if ops.is_empty() {
            self.active.remove(&id);
            return Ok(0);
        }

        // One durable batch entry; if this fails the transaction dies with it
        let payload = bincode::serialize(&ops)?;
        if let Err(e) = self.mgr.wal().append(CommandKind::Commit, &payload).await {
            warn!(tx = %id, error = %e, "commit WAL append failed, rolling back");
            self.active.remove(&id);
            return Err(e);
        }

        // The WAL record is the source of truth from here: apply errors are
        // logged and recovery will converge on the logged state.
        let applied = apply_ops(&self.mgr, &ops).await;

        if let Some(mut tx) = self.active.get_mut(&id) {
            tx.state = TxState::Committed;
        }
        self.active.remove(&id);
        Ok(applied)
    }

    /// Discard the buffer; nothing reaches the WAL.
    pub fn rollback(&self, id: Uuid) -> bool {
        match self.active.remove(&id) {
            Some((_, mut tx)) => {
                tx.state = TxState::RolledBack;
                true
            }
            None => false,
        }
    }

    /// Connection-close hook
    pub fn rollback_if_open(&self, id: Uuid) {
        if self.rollback(id) {
            warn!(tx = %id, "open transaction rolled back on connection close");
        }
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.active
            .get(&id)
            .map(|tx| tx.state == TxState::Active)
            .unwrap_or(false)
    }
}

/// Apply a committed op list to the stores, best-effort, enqueueing saves.
/// Shared by live commits and WAL replay.
pub async fn apply_ops(mgr: &CollectionManager, ops: &[TxOp]) -> usize {
    let mut applied = 0;
    for op in ops {
        let result: Result<()> = async {
            let coll = mgr.collection(op.collection())?;
            match op {
                TxOp::Set { key, value, ttl, .. } => {
                    coll.put_document(key, value, *ttl).await?;
                }
                TxOp::Delete { key, .. } => {
                    coll.delete_document(key).await?;
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                applied += 1;
                mgr.enqueue_save(SaveTarget::Collection(op.collection().to_string()));
            }
            Err(e) => error!(collection = op.collection(), error = %e, "commit apply failed for op"),
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_ops_serialize_round_trip() {
        let ops = vec![
            TxOp::Set {
                collection: "c".into(),
                key: "k1".into(),
                value: br#"{"v":1}"#.to_vec(),
                ttl: 0,
            },
            TxOp::Delete {
                collection: "c".into(),
                key: "k2".into(),
            },
        ];
        let raw = bincode::serialize(&ops).unwrap();
        let back: Vec<TxOp> = bincode::deserialize(&raw).unwrap();
        assert_eq!(back.len(), 2);
        match &back[0] {
            TxOp::Set { key, ttl, .. } => {
                assert_eq!(key, "k1");
                assert_eq!(*ttl, 0);
            }
            _ => panic!("expected Set"),
        }
    }
}
