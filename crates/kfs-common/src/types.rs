//! Core type definitions for KFS
//!
//! This module defines the identifiers shared by the allocation engine,
//! the persisted store and the replication pipeline.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Longest accepted digest, in hex characters (BLAKE2b-512).
pub const MAX_HASH_LEN: usize = 128;

/// Hex-encoded content digest, used as storage key and dedup key.
///
/// Always stored lowercase so that `DEADBEEF` and `deadbeef` address the
/// same content.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ContentHash(String);

impl ContentHash {
    /// Create a new content hash (validates hex encoding)
    pub fn new(hash: impl Into<String>) -> Result<Self, ContentHashError> {
        let mut hash = hash.into();
        hash.make_ascii_lowercase();
        Self::validate(&hash)?;
        Ok(Self(hash))
    }

    /// Build a hash from raw digest output
    #[must_use]
    pub fn from_digest(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Get the hash as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of a stored replica: `<hash>.<algorithm>`
    #[must_use]
    pub fn file_name(&self, algorithm: HashAlgorithm) -> String {
        format!("{}.{}", self.0, algorithm)
    }

    fn validate(hash: &str) -> Result<(), ContentHashError> {
        if hash.is_empty() {
            return Err(ContentHashError::Empty);
        }
        if hash.len() > MAX_HASH_LEN {
            return Err(ContentHashError::TooLong(hash.len()));
        }
        if let Some(c) = hash.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(ContentHashError::InvalidChar(c));
        }
        if hash.len() % 2 != 0 {
            return Err(ContentHashError::OddLength);
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = ContentHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Errors that can occur when parsing a content hash
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentHashError {
    #[error("content hash cannot be empty")]
    Empty,
    #[error("content hash is {0} characters, at most {MAX_HASH_LEN} allowed")]
    TooLong(usize),
    #[error("content hash contains invalid character: {0:?}")]
    InvalidChar(char),
    #[error("content hash must have an even number of hex digits")]
    OddLength,
}

/// Digest algorithm used to address stored content
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// BLAKE2b-512, the output of `b2sum`
    #[default]
    Blake2b,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Name used in file extensions and stored records
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Blake2b => "blake2b",
            Self::Sha256 => "sha256",
        }
    }

    /// Length of a hex-encoded digest produced by this algorithm
    #[must_use]
    pub const fn hex_len(&self) -> usize {
        match self {
            Self::Blake2b => 128,
            Self::Sha256 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake2b" | "b2" => Ok(Self::Blake2b),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => Err(format!("unknown hash algorithm: {other}")),
        }
    }
}

/// A registered disk and its free-space snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Mount point, unique per disk
    pub root: PathBuf,
    /// Bytes the ledger still considers free
    pub available_bytes: u64,
}

impl Disk {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, available_bytes: u64) -> Self {
        Self {
            root: root.into(),
            available_bytes,
        }
    }
}
