//! Users and access control
//!
//! User records live in `_system` under `user:<name>`; passwords are
//! bcrypt hashes. Permissions map a collection name (or the `"*"`
//! wildcard) to `read` or `write`; write implies read. Root bypasses
//! permission checks but may only authenticate from loopback.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{DbError, Result};
use crate::manager::{CollectionManager, SaveTarget, SYSTEM_COLLECTION};

/// Bootstrap administrator account
pub const ROOT_USERNAME: &str = "root";
/// Wildcard permission key
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    pub fn allows(self, need: Permission) -> bool {
        match need {
            Permission::Read => true,
            Permission::Write => self == Permission::Write,
        }
    }
}

/// Stored user record. Reserved document fields are ignored on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default)]
    pub permissions: HashMap<String, Permission>,
}

/// Cached per-connection identity
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub username: String,
    pub is_root: bool,
    pub permissions: HashMap<String, Permission>,
    pub is_loopback: bool,
}

impl AuthedUser {
    /// Permission check for a collection. `_system` and the main store
    /// have extra root-only gates in the handlers.
    pub fn can(&self, collection: &str, need: Permission) -> bool {
        if self.is_root {
            return true;
        }
        self.permissions
            .get(collection)
            .or_else(|| self.permissions.get(WILDCARD))
            .map(|granted| granted.allows(need))
            .unwrap_or(false)
    }
}

pub fn user_key(username: &str) -> String {
    format!("user:{}", username)
}

fn decode_user(raw: &[u8]) -> Result<User> {
    // serde skips the stamped document fields it does not know
    serde_json::from_slice(raw)
        .map_err(|e| DbError::Corruption(format!("malformed user record: {}", e)))
}

fn parse_permissions(raw: &[u8]) -> Result<HashMap<String, Permission>> {
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_slice(raw).map_err(|e| {
        DbError::BadRequest(format!(
            "permissions must map collection names to \"read\" or \"write\": {}",
            e
        ))
    })
}

async fn store_user(mgr: &CollectionManager, user: &User) -> Result<()> {
    let raw = serde_json::to_vec(user)?;
    mgr.system()
        .put_document(&user_key(&user.username), &raw, 0)
        .await?;
    mgr.enqueue_save(SaveTarget::Collection(SYSTEM_COLLECTION.to_string()));
    Ok(())
}

// ----------------------------------------------------------------------
// Operations
// ----------------------------------------------------------------------

pub async fn get_user(mgr: &CollectionManager, username: &str) -> Result<Option<User>> {
    match mgr.system().get(&user_key(username)).await? {
        Some(raw) => Ok(Some(decode_user(&raw)?)),
        None => Ok(None),
    }
}

/// Verify credentials and produce the connection identity
pub async fn authenticate(
    mgr: &CollectionManager,
    username: &str,
    password: &str,
    is_loopback: bool,
) -> Result<AuthedUser> {
    let Some(user) = get_user(mgr, username).await? else {
        // Same error as a bad password, to avoid a username oracle
        return Err(DbError::Unauthorized("invalid credentials".into()));
    };

    if !bcrypt::verify(password, &user.password_hash)? {
        return Err(DbError::Unauthorized("invalid credentials".into()));
    }

    if user.is_root && !is_loopback {
        warn!(username, "root login refused from non-loopback address");
        return Err(DbError::Unauthorized(
            "root may only authenticate from loopback".into(),
        ));
    }

    Ok(AuthedUser {
        username: user.username,
        is_root: user.is_root,
        permissions: user.permissions,
        is_loopback,
    })
}

pub async fn create_user(
    mgr: &CollectionManager,
    username: &str,
    password: &str,
    permissions_json: &[u8],
) -> Result<()> {
    if username.is_empty() {
        return Err(DbError::BadRequest("username must not be empty".into()));
    }
    if password.is_empty() {
        return Err(DbError::BadRequest("password must not be empty".into()));
    }
    if get_user(mgr, username).await?.is_some() {
        return Err(DbError::Conflict(format!("user {} already exists", username)));
    }

    let user = User {
        username: username.to_string(),
        password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)?,
        is_root: false,
        permissions: parse_permissions(permissions_json)?,
    };
    store_user(mgr, &user).await
}

/// Patch fields: `password`, `permissions`, `is_root`
pub async fn update_user(mgr: &CollectionManager, username: &str, patch: &[u8]) -> Result<()> {
    let Some(mut user) = get_user(mgr, username).await? else {
        return Err(DbError::NotFound(format!("user {}", username)));
    };

    let patch: Value = serde_json::from_slice(patch)
        .map_err(|e| DbError::BadRequest(format!("invalid user patch: {}", e)))?;
    let Value::Object(patch) = patch else {
        return Err(DbError::BadRequest("user patch must be a JSON object".into()));
    };

    for (field, value) in patch {
        match field.as_str() {
            "password" => {
                let password = value
                    .as_str()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| DbError::BadRequest("password must be a non-empty string".into()))?;
                user.password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
            }
            "permissions" => {
                user.permissions = parse_permissions(&serde_json::to_vec(&value)?)?;
            }
            "is_root" => {
                if username == ROOT_USERNAME {
                    return Err(DbError::BadRequest("cannot demote the root user".into()));
                }
                user.is_root = value
                    .as_bool()
                    .ok_or_else(|| DbError::BadRequest("is_root must be a boolean".into()))?;
            }
            other => {
                return Err(DbError::BadRequest(format!("unknown user field {:?}", other)));
            }
        }
    }

    store_user(mgr, &user).await
}

pub async fn delete_user(mgr: &CollectionManager, username: &str) -> Result<()> {
    if username == ROOT_USERNAME {
        return Err(DbError::BadRequest("the root user cannot be deleted".into()));
    }
    if !mgr.system().delete_document(&user_key(username)).await? {
        return Err(DbError::NotFound(format!("user {}", username)));
    }
    mgr.enqueue_save(SaveTarget::Collection(SYSTEM_COLLECTION.to_string()));
    Ok(())
}

pub async fn change_password(
    mgr: &CollectionManager,
    username: &str,
    new_password: &str,
) -> Result<()> {
    if new_password.is_empty() {
        return Err(DbError::BadRequest("password must not be empty".into()));
    }
    let Some(mut user) = get_user(mgr, username).await? else {
        return Err(DbError::NotFound(format!("user {}", username)));
    };
    user.password_hash = bcrypt::hash(new_password, bcrypt::DEFAULT_COST)?;
    store_user(mgr, &user).await
}

/// Create the root account on first start
pub async fn bootstrap_root(mgr: &CollectionManager, password: &str) -> Result<()> {
    if get_user(mgr, ROOT_USERNAME).await?.is_some() {
        return Ok(());
    }
    let user = User {
        username: ROOT_USERNAME.to_string(),
        password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)?,
        is_root: true,
        permissions: HashMap::new(),
    };
    store_user(mgr, &user).await?;
    warn!("root user created with the configured bootstrap password; change it");
    Ok(())
}
