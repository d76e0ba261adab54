//! Configuration for loomdb
//!
//! Loaded from a JSON file; every section has working defaults so a bare
//! `Config::default()` runs a local development server.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DbError, Result};

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network listener settings
    pub server: ServerConfig,

    /// TLS settings
    pub tls: TlsConfig,

    /// Storage and persistence settings
    pub storage: StorageConfig,

    /// Write-ahead log settings
    pub wal: WalConfig,

    /// TTL expiry sweeper settings
    pub expiry: ExpiryConfig,

    /// Authentication bootstrap settings
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            storage: StorageConfig::default(),
            wal: WalConfig::default(),
            expiry: ExpiryConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,

    /// Size of the per-connection session pool
    pub pool_size: usize,

    /// Idle connections are closed after this many seconds
    pub idle_timeout_secs: u64,

    /// Grace period for draining background work at shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5876".to_string(),
            pool_size: 256,
            idle_timeout_secs: 600, // 10 minutes
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate file (PEM format)
    pub cert_path: PathBuf,

    /// Path to private key file (PEM format)
    pub key_path: PathBuf,

    /// Generate a self-signed localhost certificate when the files are
    /// missing (development mode)
    pub auto_generate: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("./certs/server.crt"),
            key_path: PathBuf::from("./certs/server.key"),
            auto_generate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: PathBuf,

    /// Interval between periodic save ticks (seconds)
    pub save_interval_secs: u64,

    /// Enable the background saver entirely
    pub snapshots_enabled: bool,

    /// Compact a cold file once this many dead records accumulate
    pub compact_dead_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./loomdb_data"),
            save_interval_secs: 30,
            snapshots_enabled: true,
            compact_dead_threshold: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// WAL file name, relative to the data directory
    pub file_name: String,

    /// fsync after every entry (disabling this trades durability for speed)
    pub sync_writes: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            file_name: "wal.log".to_string(),
            sync_writes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Interval between TTL sweeps (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Password for the bootstrap root user, used only when `_system`
    /// contains no root record yet
    pub root_password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            root_password: "changeme".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let config: Config = serde_json::from_slice(&raw)
            .map_err(|e| DbError::BadRequest(format!("invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.is_empty() {
            return Err(DbError::BadRequest("listen_addr must not be empty".into()));
        }
        if self.server.pool_size == 0 {
            return Err(DbError::BadRequest("pool_size must be > 0".into()));
        }
        if self.storage.save_interval_secs == 0 {
            return Err(DbError::BadRequest(
                "save_interval_secs must be > 0".into(),
            ));
        }
        if self.expiry.sweep_interval_secs == 0 {
            return Err(DbError::BadRequest(
                "sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.wal.file_name.is_empty() {
            return Err(DbError::BadRequest("wal file_name must not be empty".into()));
        }
        Ok(())
    }

    /// Absolute path of the WAL file
    pub fn wal_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.wal.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn load_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            br#"{"server": {"listen_addr": "0.0.0.0:7000"}, "wal": {"sync_writes": false}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:7000");
        assert!(!config.wal.sync_writes);
        // Untouched sections keep their defaults
        assert_eq!(config.expiry.sweep_interval_secs, 5);
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = Config::default();
        config.server.pool_size = 0;
        assert!(config.validate().is_err());
    }
}
