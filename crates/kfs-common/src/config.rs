//! Configuration types for KFS
//!
//! This module defines the configuration structures shared by the server
//! binary and the engine crates. Every section has defaults so a partial
//! TOML file deserializes cleanly.

use crate::error::{Error, Result};
use crate::types::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for KFS
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Disk and redundancy configuration
    pub storage: StorageConfig,
    /// Persisted store configuration
    pub metadata: MetadataConfig,
    /// Replication pipeline configuration
    pub replication: ReplicationConfig,
    /// HTTP front end configuration
    pub server: ServerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject configurations the engine cannot honour
    ///
    /// # Errors
    ///
    /// `Configuration` naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.storage.redundancy == 0 {
            return Err(Error::Configuration(
                "redundancy must be at least 1".to_string(),
            ));
        }
        if self.storage.disks.is_empty() {
            return Err(Error::Configuration("no disks configured".to_string()));
        }
        if self.storage.disks.len() < self.storage.redundancy {
            return Err(Error::Configuration(format!(
                "{} disks configured, redundancy {} needs at least as many",
                self.storage.disks.len(),
                self.storage.redundancy
            )));
        }
        if self.replication.copy_attempts == 0 {
            return Err(Error::Configuration(
                "copy_attempts must be at least 1".to_string(),
            ));
        }
        if self.server.read_timeout_secs == 0 {
            return Err(Error::Configuration(
                "read_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Disk roots to register at startup
    pub disks: Vec<PathBuf>,
    /// Number of replica disks per unique content hash (R)
    pub redundancy: usize,
    /// Digest used to address content
    pub hash_algorithm: HashAlgorithm,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disks: vec![
                PathBuf::from("/mnt/disk1"),
                PathBuf::from("/mnt/disk2"),
                PathBuf::from("/mnt/disk3"),
                PathBuf::from("/mnt/disk4"),
            ],
            redundancy: 2,
            hash_algorithm: HashAlgorithm::Blake2b,
        }
    }
}

/// Persisted store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Path of the redb database file
    pub db_path: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/kfs/db/kfs.redb"),
        }
    }
}

/// Replication pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Upper bound on a single copy attempt (seconds)
    pub copy_timeout_secs: u64,
    /// Attempts per replica target before it is reported failed
    pub copy_attempts: u32,
    /// Pause between attempts (milliseconds)
    pub retry_backoff_ms: u64,
}

impl ReplicationConfig {
    #[must_use]
    pub const fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            copy_timeout_secs: 600,
            copy_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

/// HTTP front end configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// Largest accepted request body (bytes)
    pub max_upload_bytes: u64,
    /// Longest wait for the next chunk of an upload body (seconds)
    pub read_timeout_secs: u64,
}

impl ServerConfig {
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_upload_bytes: 16 * 1024 * 1024 * 1024, // 16 GB
            read_timeout_secs: 60,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
