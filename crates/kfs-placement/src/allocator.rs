//! Allocation engine
//!
//! Every allocation runs dedup lookup, candidate selection, replica choice
//! and the ledger commit under one engine-owned lock, so two uploads can
//! never both see the same free bytes or both claim the same hash. The
//! lock is released before any bytes move.

use crate::policy::{reservation_threshold, select_replicas};
use crate::registry::DiskRegistry;
use kfs_common::{ContentHash, Error, HashAlgorithm, Result};
use kfs_meta_store::{FileRecord, LedgerEntry, MetaStore};
use kfs_storage::{staging_dir, storage_dir};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of an allocation request
#[derive(Clone, Debug)]
pub enum Allocation {
    /// Space was reserved and records written; upload into `staging_dir`
    Placed(Placement),
    /// The content is already stored; nothing was changed
    AlreadyStored,
}

/// Where an upload goes
#[derive(Clone, Debug)]
pub struct Placement {
    pub staging_root: PathBuf,
    /// `<staging_root>/.kfs/staging`
    pub staging_dir: PathBuf,
    pub replica_roots: Vec<PathBuf>,
    /// `<replica_root>/.kfs/storage`, in the same order as `replica_roots`
    pub replica_dirs: Vec<PathBuf>,
    debits: Vec<LedgerEntry>,
}

impl Placement {
    /// Bytes debited from the ledger, summed over every touched disk
    #[must_use]
    pub fn debited_bytes(&self) -> u64 {
        self.debits.iter().map(|d| d.bytes).sum()
    }
}

pub struct AllocationEngine {
    store: Arc<MetaStore>,
    registry: Arc<DiskRegistry>,
    lock: Mutex<()>,
    redundancy: usize,
    algorithm: HashAlgorithm,
}

impl AllocationEngine {
    /// # Errors
    ///
    /// `Configuration` if `redundancy` is zero.
    pub fn new(
        registry: Arc<DiskRegistry>,
        redundancy: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Self> {
        if redundancy == 0 {
            return Err(Error::Configuration(
                "redundancy must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            store: registry.store().clone(),
            registry,
            lock: Mutex::new(()),
            redundancy,
            algorithm,
        })
    }

    #[must_use]
    pub const fn redundancy(&self) -> usize {
        self.redundancy
    }

    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<DiskRegistry> {
        &self.registry
    }

    /// Reserve space for `size` bytes of content `hash` on `redundancy`
    /// distinct disks.
    ///
    /// # Errors
    ///
    /// `InsufficientRedundancy` when too few disks can take the upload,
    /// `Persistence` when the store fails. Neither leaves a trace in the
    /// ledger.
    pub fn allocate(&self, hash: &ContentHash, size: u64) -> Result<Allocation> {
        let _guard = self.lock.lock();

        if self.store.has_hash(hash)? {
            debug!("{} already stored", hash);
            return Ok(Allocation::AlreadyStored);
        }

        let candidates = self.registry.candidates(reservation_threshold(size))?;
        let available = candidates.len();
        let Some(replicas) = select_replicas(candidates, self.redundancy, &mut rand::thread_rng())
        else {
            warn!(
                "Cannot place {} ({} bytes): {} of {} disks have room",
                hash, size, available, self.redundancy
            );
            return Err(Error::InsufficientRedundancy {
                available,
                required: self.redundancy,
            });
        };

        let replica_roots: Vec<PathBuf> = replicas.into_iter().map(|d| d.root).collect();
        let Some(staging_root) = replica_roots.first().cloned() else {
            return Err(Error::internal("replica selection returned no disks"));
        };

        // The staging disk is a replica disk, so each replica is debited once
        let debits: Vec<LedgerEntry> = replica_roots
            .iter()
            .map(|root| LedgerEntry::new(root, size))
            .collect();
        let records: Vec<FileRecord> = replica_roots
            .iter()
            .map(|root| FileRecord::new(hash.clone(), self.algorithm, root.clone()))
            .collect();

        self.store.commit_allocation(&debits, &records)?;

        info!(
            "Allocated {} ({} bytes): staging on {}, replicas on {:?}",
            hash,
            size,
            staging_root.display(),
            replica_roots
        );

        Ok(Allocation::Placed(Placement {
            staging_dir: staging_dir(&staging_root),
            staging_root,
            replica_dirs: replica_roots.iter().map(|r| storage_dir(r)).collect(),
            replica_roots,
            debits,
        }))
    }

    /// Undo an allocation whose upload never completed: delete the hash's
    /// records and credit back what `allocate` debited.
    ///
    /// # Errors
    ///
    /// `Persistence` when the store fails; the revert is then not applied.
    pub fn release(&self, hash: &ContentHash, placement: &Placement) -> Result<()> {
        let _guard = self.lock.lock();
        self.store.revert_allocation(hash, &placement.debits)?;
        info!(
            "Released allocation for {} ({} bytes credited)",
            hash,
            placement.debited_bytes()
        );
        Ok(())
    }

    /// # Errors
    ///
    /// `Persistence` when the store cannot be read.
    pub fn has_hash(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.store.has_hash(hash)?)
    }

    /// Every replica record of `hash`.
    ///
    /// # Errors
    ///
    /// `Persistence` when the store cannot be read or a record fails to
    /// decode.
    pub fn records(&self, hash: &ContentHash) -> Result<Vec<FileRecord>> {
        Ok(self.store.file_records(hash)?)
    }
}
