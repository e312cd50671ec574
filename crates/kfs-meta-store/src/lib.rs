//! KFS Metadata Store - persisted disk ledger and dedup index
//!
//! This crate owns the `disks` and `files` tables. Allocation commits and
//! their rollbacks are single redb write transactions, so a debit never
//! survives without its file records and vice versa.

pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use store::{MetaStore, MetaStoreError, MetaStoreResult};
pub use types::{FileRecord, LedgerEntry};
