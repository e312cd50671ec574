//! KFS Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, configuration and
//! digest primitives used across all KFS components.

pub mod config;
pub mod digest;
pub mod error;
pub mod types;

pub use config::Config;
pub use digest::{Blake2bDigest, ContentDigest, DigestState, Sha256Digest, digest_for};
pub use error::{Error, Result};
pub use types::*;
