//! Stored types for metadata persistence.
//!
//! These types are serialized to redb via bincode.

use kfs_common::{ContentHash, HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One replica of one piece of content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub hash: ContentHash,
    pub hash_algorithm: HashAlgorithm,
    pub storage_root: PathBuf,
}

impl FileRecord {
    #[must_use]
    pub fn new(hash: ContentHash, hash_algorithm: HashAlgorithm, storage_root: PathBuf) -> Self {
        Self {
            hash,
            hash_algorithm,
            storage_root,
        }
    }

    /// Composite key in the `files` table
    #[must_use]
    pub fn key(&self) -> String {
        file_key(&self.hash, &self.storage_root)
    }
}

/// A change to one disk's free space inside an allocation transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub root: String,
    pub bytes: u64,
}

impl LedgerEntry {
    #[must_use]
    pub fn new(root: &Path, bytes: u64) -> Self {
        Self {
            root: root_key(root),
            bytes,
        }
    }
}

/// Ledger key for a disk root
#[must_use]
pub fn root_key(root: &Path) -> String {
    root.to_string_lossy().into_owned()
}

/// `files` key: hash, NUL, storage root
#[must_use]
pub fn file_key(hash: &ContentHash, storage_root: &Path) -> String {
    format!("{}\x00{}", hash.as_str(), root_key(storage_root))
}

/// Key range covering every replica row of `hash`
#[must_use]
pub fn hash_range(hash: &ContentHash) -> (String, String) {
    (
        format!("{}\x00", hash.as_str()),
        format!("{}\x01", hash.as_str()),
    )
}
