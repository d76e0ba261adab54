//! Error types for loomdb

use thiserror::Error;

/// Result type for loomdb operations
pub type Result<T> = std::result::Result<T, DbError>;

/// loomdb error types
#[derive(Error, Debug)]
pub enum DbError {
    // I/O and storage
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt data: {0}")]
    Corruption(String),

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    // Protocol
    #[error("bad frame: {0}")]
    BadFrame(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    // Lookup
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    // Access control
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // Transactions
    #[error("transaction error: {0}")]
    Transaction(String),

    // Serialization
    #[error("serialization error: {0}")]
    Serialization(String),

    // General
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(e: bincode::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bcrypt::BcryptError> for DbError {
    fn from(e: bcrypt::BcryptError) -> Self {
        DbError::Internal(format!("password hash: {}", e))
    }
}

impl DbError {
    /// Check if the error should terminate the connection rather than
    /// produce a response frame
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::BadFrame(_) | DbError::Io(_))
    }
}
