//! Persistent metadata store backed by redb.
//!
//! Provides the availability ledger (`disks`) and the dedup index
//! (`files`). Reads open their own read transaction. Allocation commits
//! and rollbacks touch both tables inside one write transaction: any error
//! returns before `commit()`, and dropping the uncommitted transaction
//! aborts it.

use crate::tables;
use crate::types::{FileRecord, LedgerEntry, hash_range, root_key};
use kfs_common::{ContentHash, Disk};
use redb::{Database, ReadableTable};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("disk '{0}' is not registered")]
    UnknownDisk(String),
    #[error("debit of {requested} bytes would overdraw '{root}' ({available} bytes available)")]
    Overdraw {
        root: String,
        requested: u64,
        available: u64,
    },
    #[error("file records for {0} already exist")]
    DuplicateHash(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for kfs_common::Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Overdraw {
                root,
                requested,
                available,
            } => Self::InsufficientSpace {
                root,
                required: requested,
                available,
            },
            MetaStoreError::UnknownDisk(root) => Self::DiskNotFound(root),
            other => Self::Persistence(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::DISKS)?;
            let _t = write_txn.open_table(tables::FILES)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // ---- Disks ----

    /// Insert or overwrite the free-space snapshot of each disk, in one txn.
    pub fn upsert_disks(&self, disks: &[Disk]) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::DISKS)?;
            for disk in disks {
                table.insert(root_key(&disk.root).as_str(), disk.available_bytes)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_disk(&self, root: &Path) -> MetaStoreResult<Option<Disk>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::DISKS)?;
        Ok(table
            .get(root_key(root).as_str())?
            .map(|v| Disk::new(root, v.value())))
    }

    pub fn load_disks(&self) -> MetaStoreResult<Vec<Disk>> {
        self.disks_where(|_| true)
    }

    /// Disks whose ledger shows strictly more than `min_free` bytes.
    pub fn disks_above(&self, min_free: u64) -> MetaStoreResult<Vec<Disk>> {
        self.disks_where(|available| available > min_free)
    }

    // ---- Files ----

    pub fn has_hash(&self, hash: &ContentHash) -> MetaStoreResult<bool> {
        let (lo, hi) = hash_range(hash);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::FILES)?;
        let found = table.range(lo.as_str()..hi.as_str())?.next().is_some();
        Ok(found)
    }

    pub fn file_records(&self, hash: &ContentHash) -> MetaStoreResult<Vec<FileRecord>> {
        let (lo, hi) = hash_range(hash);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::FILES)?;
        let mut result = Vec::new();
        for entry in table.range(lo.as_str()..hi.as_str())? {
            let entry = entry?;
            let record = bincode::deserialize::<FileRecord>(entry.1.value()).map_err(|e| {
                error!("Failed to decode file record '{}': {}", entry.0.value(), e);
                e
            })?;
            result.push(record);
        }
        Ok(result)
    }

    // ---- Allocation batch writes ----

    /// Debit every ledger entry and insert every file record, atomically.
    ///
    /// Fails without mutating anything if a disk is unknown, a debit would
    /// overdraw a disk, or the hash already has records.
    pub fn commit_allocation(
        &self,
        debits: &[LedgerEntry],
        records: &[FileRecord],
    ) -> MetaStoreResult<()> {
        let serialized = records
            .iter()
            .map(|r| Ok((r.key(), bincode::serialize(r)?)))
            .collect::<MetaStoreResult<Vec<_>>>()?;

        let write_txn = self.db.begin_write()?;
        {
            let mut disks = write_txn.open_table(tables::DISKS)?;
            for debit in debits {
                let available = disks
                    .get(debit.root.as_str())?
                    .map(|v| v.value())
                    .ok_or_else(|| MetaStoreError::UnknownDisk(debit.root.clone()))?;
                let remaining =
                    available
                        .checked_sub(debit.bytes)
                        .ok_or_else(|| MetaStoreError::Overdraw {
                            root: debit.root.clone(),
                            requested: debit.bytes,
                            available,
                        })?;
                disks.insert(debit.root.as_str(), remaining)?;
            }

            let mut files = write_txn.open_table(tables::FILES)?;
            if let Some(first) = records.first() {
                let (lo, hi) = hash_range(&first.hash);
                let exists = files.range(lo.as_str()..hi.as_str())?.next().is_some();
                if exists {
                    return Err(MetaStoreError::DuplicateHash(first.hash.to_string()));
                }
            }
            for (key, bytes) in &serialized {
                if files.insert(key.as_str(), bytes.as_slice())?.is_some() {
                    return Err(MetaStoreError::DuplicateHash(key.clone()));
                }
            }
        }
        write_txn.commit()?;
        debug!(
            "Committed allocation: {} debits, {} file records",
            debits.len(),
            records.len()
        );
        Ok(())
    }

    /// Undo a committed allocation: drop the hash's file records and
    /// credit every ledger entry back, atomically.
    pub fn revert_allocation(
        &self,
        hash: &ContentHash,
        credits: &[LedgerEntry],
    ) -> MetaStoreResult<()> {
        let (lo, hi) = hash_range(hash);
        let write_txn = self.db.begin_write()?;
        {
            let mut files = write_txn.open_table(tables::FILES)?;
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in files.range(lo.as_str()..hi.as_str())? {
                    keys.push(entry?.0.value().to_string());
                }
                keys
            };
            for key in &keys {
                files.remove(key.as_str())?;
            }

            let mut disks = write_txn.open_table(tables::DISKS)?;
            for credit in credits {
                let available = disks
                    .get(credit.root.as_str())?
                    .map(|v| v.value())
                    .ok_or_else(|| MetaStoreError::UnknownDisk(credit.root.clone()))?;
                disks.insert(
                    credit.root.as_str(),
                    available.saturating_add(credit.bytes),
                )?;
            }
        }
        write_txn.commit()?;
        debug!("Reverted allocation for {}", hash);
        Ok(())
    }

    // ---- Generic helpers ----

    fn disks_where(&self, keep: impl Fn(u64) -> bool) -> MetaStoreResult<Vec<Disk>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::DISKS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let available = entry.1.value();
            if keep(available) {
                result.push(Disk::new(PathBuf::from(entry.0.value()), available));
            }
        }
        Ok(result)
    }
}
