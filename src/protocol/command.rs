//! Typed command payloads
//!
//! Decoders are shared by the connection handlers and by WAL replay, so a
//! recovered entry goes through exactly the parse path the live command did.

use crate::error::Result;

use super::codec::{PayloadReader, PayloadWriter};

/// Authenticate: username, password
pub struct AuthenticateCmd {
    pub username: String,
    pub password: String,
}

impl AuthenticateCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            username: r.read_string()?,
            password: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.username)
            .put_string(&self.password)
            .finish()
    }
}

/// ChangeUserPassword: username, new password
pub struct ChangePasswordCmd {
    pub username: String,
    pub password: String,
}

impl ChangePasswordCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            username: r.read_string()?,
            password: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.username)
            .put_string(&self.password)
            .finish()
    }
}

/// UserCreate: username, password, permissions JSON
pub struct UserCreateCmd {
    pub username: String,
    pub password: String,
    pub permissions: Vec<u8>,
}

impl UserCreateCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            username: r.read_string()?,
            password: r.read_string()?,
            permissions: r.read_bytes()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.username)
            .put_string(&self.password)
            .put_bytes(&self.permissions)
            .finish()
    }
}

/// UserUpdate: username, patch JSON (`password`, `permissions`, `is_root`)
pub struct UserUpdateCmd {
    pub username: String,
    pub patch: Vec<u8>,
}

impl UserUpdateCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            username: r.read_string()?,
            patch: r.read_bytes()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.username)
            .put_bytes(&self.patch)
            .finish()
    }
}

/// UserDelete: username
pub struct UserDeleteCmd {
    pub username: String,
}

impl UserDeleteCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            username: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new().put_string(&self.username).finish()
    }
}

/// Set (main store): key, ttl, value
pub struct MainSetCmd {
    pub key: String,
    pub ttl: i64,
    pub value: Vec<u8>,
}

impl MainSetCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            key: r.read_string()?,
            ttl: r.read_i64()?,
            value: r.read_bytes()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.key)
            .put_i64(self.ttl)
            .put_bytes(&self.value)
            .finish()
    }
}

/// Get (main store): key
pub struct MainGetCmd {
    pub key: String,
}

impl MainGetCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            key: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new().put_string(&self.key).finish()
    }
}

/// CollectionCreate / CollectionDelete: name
pub struct CollectionNameCmd {
    pub name: String,
}

impl CollectionNameCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            name: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new().put_string(&self.name).finish()
    }
}

/// CollectionIndexCreate / CollectionIndexDelete: collection, field
pub struct IndexCmd {
    pub collection: String,
    pub field: String,
}

impl IndexCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
            field: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.collection)
            .put_string(&self.field)
            .finish()
    }
}

/// CollectionIndexList: collection
pub struct CollectionOnlyCmd {
    pub collection: String,
}

impl CollectionOnlyCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new().put_string(&self.collection).finish()
    }
}

/// CollectionItemSet: collection, key, ttl, value. An empty key asks the
/// server to take the document's `_id` or generate one.
pub struct ItemSetCmd {
    pub collection: String,
    pub key: String,
    pub ttl: i64,
    pub value: Vec<u8>,
}

impl ItemSetCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
            key: r.read_string()?,
            ttl: r.read_i64()?,
            value: r.read_bytes()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.collection)
            .put_string(&self.key)
            .put_i64(self.ttl)
            .put_bytes(&self.value)
            .finish()
    }
}

/// CollectionItemSetMany: collection, JSON array of documents
pub struct ItemSetManyCmd {
    pub collection: String,
    pub docs: Vec<u8>,
}

impl ItemSetManyCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
            docs: r.read_bytes()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.collection)
            .put_bytes(&self.docs)
            .finish()
    }
}

/// CollectionItemGet / CollectionItemDelete: collection, key
pub struct ItemKeyCmd {
    pub collection: String,
    pub key: String,
}

impl ItemKeyCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
            key: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.collection)
            .put_string(&self.key)
            .finish()
    }
}

/// CollectionItemDeleteMany: collection, key list
pub struct ItemKeysCmd {
    pub collection: String,
    pub keys: Vec<String>,
}

impl ItemKeysCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
            keys: r.read_string_list()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.collection)
            .put_string_list(&self.keys)
            .finish()
    }
}

/// CollectionItemList: collection, offset, limit (negative limit = all)
pub struct ItemListCmd {
    pub collection: String,
    pub offset: i64,
    pub limit: i64,
}

impl ItemListCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
            offset: r.read_i64()?,
            limit: r.read_i64()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.collection)
            .put_i64(self.offset)
            .put_i64(self.limit)
            .finish()
    }
}

/// CollectionItemUpdate: collection, key, patch JSON
pub struct ItemUpdateCmd {
    pub collection: String,
    pub key: String,
    pub patch: Vec<u8>,
}

impl ItemUpdateCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
            key: r.read_string()?,
            patch: r.read_bytes()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.collection)
            .put_string(&self.key)
            .put_bytes(&self.patch)
            .finish()
    }
}

/// CollectionItemUpdateMany: collection, JSON array of `{_id, patch}`
pub struct ItemUpdateManyCmd {
    pub collection: String,
    pub updates: Vec<u8>,
}

impl ItemUpdateManyCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
            updates: r.read_bytes()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.collection)
            .put_bytes(&self.updates)
            .finish()
    }
}

/// CollectionQuery: collection, query JSON
pub struct QueryCmd {
    pub collection: String,
    pub query: Vec<u8>,
}

impl QueryCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            collection: r.read_string()?,
            query: r.read_bytes()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .put_string(&self.collection)
            .put_bytes(&self.query)
            .finish()
    }
}

/// Restore: backup directory name
pub struct RestoreCmd {
    pub name: String,
}

impl RestoreCmd {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            name: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new().put_string(&self.name).finish()
    }
}
