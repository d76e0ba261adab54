//! Wire protocol
//!
//! Every frame is little-endian. A command frame is
//! `[command_type:u8][payload_len:u32][payload]`; a response frame is
//! `[status:u8][msg_len:u32][msg][data_len:u32][data]`.

pub mod codec;
pub mod command;

use bytes::BufMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{DbError, Result};

/// Command types. The numbering is part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    Authenticate = 1,
    ChangeUserPassword = 2,
    UserCreate = 3,
    UserUpdate = 4,
    UserDelete = 5,
    Set = 6,
    Get = 7,
    CollectionCreate = 8,
    CollectionDelete = 9,
    CollectionList = 10,
    CollectionIndexCreate = 11,
    CollectionIndexDelete = 12,
    CollectionIndexList = 13,
    CollectionItemSet = 14,
    CollectionItemSetMany = 15,
    CollectionItemGet = 16,
    CollectionItemDelete = 17,
    CollectionItemDeleteMany = 18,
    CollectionItemList = 19,
    CollectionItemUpdate = 20,
    CollectionItemUpdateMany = 21,
    CollectionQuery = 22,
    Begin = 23,
    Commit = 24,
    Rollback = 25,
    Backup = 26,
    Restore = 27,
}

impl CommandKind {
    pub fn from_u8(byte: u8) -> Option<CommandKind> {
        use CommandKind::*;
        Some(match byte {
            1 => Authenticate,
            2 => ChangeUserPassword,
            3 => UserCreate,
            4 => UserUpdate,
            5 => UserDelete,
            6 => Set,
            7 => Get,
            8 => CollectionCreate,
            9 => CollectionDelete,
            10 => CollectionList,
            11 => CollectionIndexCreate,
            12 => CollectionIndexDelete,
            13 => CollectionIndexList,
            14 => CollectionItemSet,
            15 => CollectionItemSetMany,
            16 => CollectionItemGet,
            17 => CollectionItemDelete,
            18 => CollectionItemDeleteMany,
            19 => CollectionItemList,
            20 => CollectionItemUpdate,
            21 => CollectionItemUpdateMany,
            22 => CollectionQuery,
            23 => Begin,
            24 => Commit,
            25 => Rollback,
            26 => Backup,
            27 => Restore,
            _ => return None,
        })
    }

    /// Whether the command mutates state and therefore goes through the WAL
    pub fn is_write_class(self) -> bool {
        use CommandKind::*;
        matches!(
            self,
            Set | CollectionCreate
                | CollectionDelete
                | CollectionIndexCreate
                | CollectionIndexDelete
                | CollectionItemSet
                | CollectionItemSetMany
                | CollectionItemDelete
                | CollectionItemDeleteMany
                | CollectionItemUpdate
                | CollectionItemUpdateMany
                | ChangeUserPassword
                | UserCreate
                | UserUpdate
                | UserDelete
                | Commit
                | Restore
        )
    }
}

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 1,
    NotFound = 2,
    Error = 3,
    BadCommand = 4,
    Unauthorized = 5,
    BadRequest = 6,
}

impl From<&DbError> for Status {
    fn from(e: &DbError) -> Self {
        match e {
            DbError::NotFound(_) => Status::NotFound,
            DbError::BadFrame(_) => Status::BadCommand,
            DbError::BadRequest(_) | DbError::Conflict(_) | DbError::Transaction(_) => {
                Status::BadRequest
            }
            DbError::Unauthorized(_) => Status::Unauthorized,
            DbError::Io(_)
            | DbError::Corruption(_)
            | DbError::WalWrite(_)
            | DbError::Serialization(_)
            | DbError::Internal(_) => Status::Error,
        }
    }
}

/// A single response frame
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub msg: String,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            msg: msg.into(),
            data: Vec::new(),
        }
    }

    pub fn ok_data(msg: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            msg: msg.into(),
            data,
        }
    }

    pub fn error(status: Status, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
            data: Vec::new(),
        }
    }

    pub fn from_err(e: &DbError) -> Self {
        Self::error(Status::from(e), e.to_string())
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let mut frame = Vec::with_capacity(9 + self.msg.len() + self.data.len());
        frame.put_u8(self.status as u8);
        frame.put_u32_le(self.msg.len() as u32);
        frame.put_slice(self.msg.as_bytes());
        frame.put_u32_le(self.data.len() as u32);
        frame.put_slice(&self.data);
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }
}
