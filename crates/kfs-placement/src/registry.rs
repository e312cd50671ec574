//! Disk registry
//!
//! The set of known disks and the ledger's view of their free space.
//! Free space is probed once per `initialize`; between refreshes only the
//! allocation engine moves the numbers.

use kfs_common::{Disk, Result};
use kfs_meta_store::MetaStore;
use kfs_storage::SpaceProbe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct DiskRegistry {
    store: Arc<MetaStore>,
    probe: Arc<dyn SpaceProbe>,
}

impl DiskRegistry {
    #[must_use]
    pub fn new(store: Arc<MetaStore>, probe: Arc<dyn SpaceProbe>) -> Self {
        Self { store, probe }
    }

    /// Probe every root and overwrite its ledger row.
    ///
    /// Roots listed twice are registered once. Nothing is written if any
    /// probe fails.
    ///
    /// # Errors
    ///
    /// `Storage` when a root cannot be probed, `Persistence` when the ledger
    /// write fails.
    pub fn initialize(&self, roots: &[PathBuf]) -> Result<Vec<Disk>> {
        let mut disks: Vec<Disk> = Vec::with_capacity(roots.len());
        for root in roots {
            if disks.iter().any(|d| &d.root == root) {
                continue;
            }
            let available = self.probe.available_bytes(root)?;
            info!("Disk {}: {} bytes available", root.display(), available);
            disks.push(Disk::new(root.clone(), available));
        }
        self.store.upsert_disks(&disks)?;
        Ok(disks)
    }

    /// Disks with strictly more than `min_free` bytes available
    ///
    /// # Errors
    ///
    /// `Persistence` when the ledger cannot be read.
    pub fn candidates(&self, min_free: u64) -> Result<Vec<Disk>> {
        Ok(self.store.disks_above(min_free)?)
    }

    /// # Errors
    ///
    /// `Persistence` when the ledger cannot be read.
    pub fn disks(&self) -> Result<Vec<Disk>> {
        Ok(self.store.load_disks()?)
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_common::Error;
    use kfs_storage::StaticProbe;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn test_initialize_and_candidates() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().join("kfs.redb")).unwrap());
        let probe = StaticProbe::new()
            .with_disk("/mnt/a", 100)
            .with_disk("/mnt/b", 500)
            .with_disk("/mnt/c", 1000);
        let registry = DiskRegistry::new(store, Arc::new(probe));

        let roots: Vec<PathBuf> = ["/mnt/a", "/mnt/b", "/mnt/c", "/mnt/a"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let registered = registry.initialize(&roots).unwrap();
        assert_eq!(registered.len(), 3);
        assert_eq!(registry.disks().unwrap().len(), 3);

        let mut big: Vec<PathBuf> = registry
            .candidates(500)
            .unwrap()
            .into_iter()
            .map(|d| d.root)
            .collect();
        big.sort();
        assert_eq!(big, vec![PathBuf::from("/mnt/c")]);
        assert_eq!(registry.candidates(99).unwrap().len(), 3);
    }

    #[test]
    fn test_reinitialize_refreshes_snapshot() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().join("kfs.redb")).unwrap());
        let roots = vec![PathBuf::from("/mnt/a")];

        DiskRegistry::new(store.clone(), Arc::new(StaticProbe::new().with_disk("/mnt/a", 10)))
            .initialize(&roots)
            .unwrap();
        let registry =
            DiskRegistry::new(store, Arc::new(StaticProbe::new().with_disk("/mnt/a", 20)));
        registry.initialize(&roots).unwrap();

        let disk = registry.store().get_disk(Path::new("/mnt/a")).unwrap().unwrap();
        assert_eq!(disk.available_bytes, 20);
    }

    #[test]
    fn test_probe_failure_aborts() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().join("kfs.redb")).unwrap());
        let registry =
            DiskRegistry::new(store, Arc::new(StaticProbe::new().with_disk("/mnt/a", 10)));

        let err = registry
            .initialize(&[PathBuf::from("/mnt/a"), PathBuf::from("/mnt/missing")])
            .unwrap_err();
        assert!(matches!(err, Error::DiskNotFound(_)));
        assert!(registry.disks().unwrap().is_empty());
    }
}
