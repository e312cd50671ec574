//! KFS Server - upload ingestion and HTTP front end
//!
//! Exposed as a library so the router and the ingestion path can be
//! exercised in-process.

pub mod ingest;
pub mod routes;

pub use ingest::{IngestOutcome, Ingestor};
pub use routes::{AppState, router};

use kfs_common::{Config, Error, Result};
use kfs_meta_store::MetaStore;
use kfs_placement::{AllocationEngine, DiskRegistry};
use kfs_storage::layout::ensure_layout;
use kfs_storage::{FsCopier, ReplicationPipeline, SpaceProbe};
use std::sync::Arc;
use tracing::info;

/// Prepare every disk, open the store, snapshot free space and wire the
/// allocation engine to the replication pipeline.
///
/// # Errors
///
/// `DiskIo` when a disk layout cannot be created, `DiskNotFound` or
/// `Storage` when a disk cannot be probed, `Persistence` when the
/// store cannot be opened or written, and `Configuration` for settings the
/// engine rejects.
pub async fn bootstrap(config: &Config, probe: Arc<dyn SpaceProbe>) -> Result<Ingestor> {
    for root in &config.storage.disks {
        ensure_layout(root).await?;
    }

    let db_path = config.metadata.db_path.clone();
    info!("Opening metadata store at {}", db_path.display());
    let store = tokio::task::spawn_blocking(move || MetaStore::open(db_path))
        .await
        .map_err(|e| Error::internal(format!("store task failed: {e}")))??;

    let registry = Arc::new(DiskRegistry::new(Arc::new(store), probe));
    let disks = {
        let registry = registry.clone();
        let roots = config.storage.disks.clone();
        tokio::task::spawn_blocking(move || registry.initialize(&roots))
            .await
            .map_err(|e| Error::internal(format!("registry task failed: {e}")))??
    };
    info!(
        "Registered {} disks, redundancy {}",
        disks.len(),
        config.storage.redundancy
    );

    let engine = Arc::new(AllocationEngine::new(
        registry,
        config.storage.redundancy,
        config.storage.hash_algorithm,
    )?);
    let pipeline = Arc::new(ReplicationPipeline::new(
        Arc::new(FsCopier),
        config.storage.hash_algorithm,
        &config.replication,
    ));
    Ok(Ingestor::new(engine, pipeline).with_read_timeout(config.server.read_timeout()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_storage::StaticProbe;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_bootstrap_registers_disks() {
        let db = tempdir().unwrap();
        let disks: Vec<_> = (0..2).map(|_| tempdir().unwrap()).collect();
        let mut config = Config::default();
        config.storage.disks = disks.iter().map(|d| d.path().to_path_buf()).collect();
        config.metadata.db_path = db.path().join("kfs.redb");

        let probe = disks
            .iter()
            .fold(StaticProbe::new(), |p, d| p.with_disk(d.path(), 4096));
        let ingestor = bootstrap(&config, Arc::new(probe)).await.unwrap();

        let registered = ingestor.engine().registry().disks().unwrap();
        assert_eq!(registered.len(), 2);
        assert!(registered.iter().all(|d| d.available_bytes == 4096));
    }

    #[tokio::test]
    async fn test_bootstrap_unknown_disk() {
        let db = tempdir().unwrap();
        let disk = tempdir().unwrap();
        let mut config = Config::default();
        config.storage.disks = vec![disk.path().to_path_buf()];
        config.storage.redundancy = 1;
        config.metadata.db_path = db.path().join("kfs.redb");

        // The probe knows nothing about the configured disk
        let err = bootstrap(&config, Arc::new(StaticProbe::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::DiskNotFound(_)));
    }
}
