//! loomdb — in-memory JSON document database with durable persistence
//!
//! Documents live in named collections backed by a two-tier store: a
//! concurrent in-memory hot map and an append-only cold file per
//! collection. Every write goes through a write-ahead log before it is
//! acknowledged; an async saver moves settled entries cold, and recovery
//! replays the log on startup. Clients speak a length-prefixed binary
//! protocol over TLS TCP: point operations, bulk variants, structured
//! queries (filter/sort/aggregate/join), secondary indexes, and
//! per-connection transactions.

pub mod auth;
pub mod backup;
pub mod config;
pub mod document;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod query;
pub mod server;
pub mod store;
pub mod txn;
pub mod wal;

pub use config::Config;
pub use error::{DbError, Result};
pub use manager::{CollectionManager, SYSTEM_COLLECTION};
pub use protocol::{CommandKind, Response, Status};
pub use query::{QueryEngine, QuerySpec};
pub use server::Server;
pub use store::Collection;
pub use txn::TransactionManager;
pub use wal::Wal;
