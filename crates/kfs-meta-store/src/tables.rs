//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Availability ledger
// Key: disk root, Value: bytes the ledger considers free
pub const DISKS: TableDefinition<&str, u64> = TableDefinition::new("disks");

// Dedup index, one row per (hash, replica disk)
// Key: "<hash>\x00<storage_root>", Value: bincode-encoded FileRecord
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");
