//! KFS Storage - disk layout and replication
//!
//! This crate implements everything that touches replica bytes:
//! - On-disk layout of the staging and storage areas
//! - Free-space probing of disk roots
//! - Byte copying behind an injectable trait
//! - The replication pipeline (fan-out copy, fan-in join, staging cleanup)

pub mod copier;
pub mod layout;
pub mod probe;
pub mod replication;

// Re-exports
pub use copier::{Copier, FsCopier};
pub use layout::{KFS_DIR, STAGING_DIR, STORAGE_DIR, staging_dir, storage_dir, stored_path};
pub use probe::{SpaceProbe, StaticProbe, StatvfsProbe};
pub use replication::{CopyOutcome, ReplicationPipeline, ReplicationReport};
