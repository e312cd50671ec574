//! Upload ingestion
//!
//! Drives one upload from allocation to replication:
//! 1. Reserve space (or learn the content is already stored)
//! 2. Stream the body into the staging area while hashing it
//! 3. Verify size and digest against the claim
//! 4. Hand the verified file to the replication pipeline
//!
//! Anything that fails before replication starts releases the allocation,
//! so a rejected upload leaves neither records nor debits behind. The same
//! holds when the caller drops the ingest future mid-body: an
//! [`AllocationGuard`] releases on drop until the verified file is staged.

use kfs_common::config::ServerConfig;
use kfs_common::{ContentDigest, ContentHash, Error, Result, digest_for};
use kfs_placement::{Allocation, AllocationEngine, Placement};
use kfs_storage::layout::upload_path;
use kfs_storage::{ReplicationPipeline, ReplicationReport, staging_dir, storage_dir, stored_path};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Read buffer size for upload bodies
const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub enum IngestOutcome {
    /// Content was already stored and fully replicated
    AlreadyStored,
    /// Content was written and replicated by this call
    Stored(ReplicationReport),
}

/// Holds a fresh allocation until its upload is staged.
///
/// Dropped while armed, it removes the partial upload and releases the
/// allocation on the blocking pool.
struct AllocationGuard {
    engine: Arc<AllocationEngine>,
    hash: ContentHash,
    placement: Placement,
    upload: PathBuf,
    armed: bool,
}

impl AllocationGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Release now and wait for it.
    async fn release(mut self) {
        self.armed = false;
        let engine = self.engine.clone();
        let hash = self.hash.clone();
        let placement = self.placement.clone();
        let released = tokio::task::spawn_blocking(move || engine.release(&hash, &placement))
            .await
            .map_err(|e| Error::internal(format!("release task failed: {e}")));
        if let Err(e) | Ok(Err(e)) = released {
            error!("Failed to release allocation of {}: {}", self.hash, e);
        }
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Upload of {} abandoned, releasing its allocation", self.hash);
        let engine = self.engine.clone();
        let hash = self.hash.clone();
        let placement = self.placement.clone();
        let upload = self.upload.clone();
        let cleanup = move || {
            match std::fs::remove_file(&upload) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", upload.display(), e),
            }
            if let Err(e) = engine.release(&hash, &placement) {
                error!("Failed to release allocation of {}: {}", hash, e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(cleanup);
            }
            Err(_) => cleanup(),
        }
    }
}

pub struct Ingestor {
    engine: Arc<AllocationEngine>,
    pipeline: Arc<ReplicationPipeline>,
    digest: Arc<dyn ContentDigest>,
    read_timeout: Duration,
}

impl Ingestor {
    #[must_use]
    pub fn new(engine: Arc<AllocationEngine>, pipeline: Arc<ReplicationPipeline>) -> Self {
        let digest = digest_for(engine.algorithm());
        Self {
            engine,
            pipeline,
            digest,
            read_timeout: ServerConfig::default().read_timeout(),
        }
    }

    /// Replace the digest used to verify uploads.
    ///
    /// # Errors
    ///
    /// `Configuration` when `digest` computes a different algorithm than
    /// the one stored content is addressed by.
    pub fn with_digest(mut self, digest: Arc<dyn ContentDigest>) -> Result<Self> {
        if digest.algorithm() != self.engine.algorithm() {
            return Err(Error::Configuration(format!(
                "digest computes {}, stored content is addressed by {}",
                digest.algorithm(),
                self.engine.algorithm()
            )));
        }
        self.digest = digest;
        Ok(self)
    }

    /// Longest wait for the next chunk of an upload body
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<AllocationEngine> {
        &self.engine
    }

    /// # Errors
    ///
    /// `Persistence` when the store cannot be read.
    pub async fn has_hash(&self, hash: &ContentHash) -> Result<bool> {
        let engine = self.engine.clone();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || engine.has_hash(&hash))
            .await
            .map_err(|e| Error::internal(format!("store task failed: {e}")))?
    }

    /// Store `size` bytes read from `body` under `claimed`.
    ///
    /// # Errors
    ///
    /// `SizeMismatch` or `Validation` when the body disagrees with the
    /// claim, `Timeout` when the body stalls, `InsufficientRedundancy` when
    /// too few disks have room, `ReplicationPartialFailure` when some
    /// replica could not be written. Only the last one leaves the allocation
    /// in place, with the verified file kept in staging for a retry.
    pub async fn ingest<R>(&self, claimed: &ContentHash, size: u64, body: R) -> Result<IngestOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let placement = match self.allocate(claimed, size).await? {
            Allocation::Placed(placement) => placement,
            Allocation::AlreadyStored => return self.resume(claimed).await,
        };

        let upload = upload_path(&placement.staging_dir);
        let mut guard = AllocationGuard {
            engine: self.engine.clone(),
            hash: claimed.clone(),
            placement: placement.clone(),
            upload: upload.clone(),
            armed: true,
        };

        let staged = match self.receive(claimed, size, body, &placement, &upload).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!("Upload of {} rejected: {}", claimed, e);
                guard.release().await;
                return Err(e);
            }
        };
        // From here on a retry resumes from the staged file
        guard.disarm();

        let report = self
            .pipeline
            .replicate(&staged, claimed, &placement.replica_dirs)
            .await?;
        info!("Stored {} ({} bytes)", claimed, size);
        Ok(IngestOutcome::Stored(report))
    }

    async fn allocate(&self, hash: &ContentHash, size: u64) -> Result<Allocation> {
        let engine = self.engine.clone();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || engine.allocate(&hash, size))
            .await
            .map_err(|e| Error::internal(format!("allocation task failed: {e}")))?
    }

    /// Finish the replication of an already-allocated hash whose verified
    /// file is still waiting in some replica disk's staging area.
    async fn resume(&self, hash: &ContentHash) -> Result<IngestOutcome> {
        let engine = self.engine.clone();
        let key = hash.clone();
        let records = tokio::task::spawn_blocking(move || engine.records(&key))
            .await
            .map_err(|e| Error::internal(format!("store task failed: {e}")))??;

        let algorithm = self.pipeline.algorithm();
        let mut pending = None;
        for record in &records {
            let staged = stored_path(&staging_dir(&record.storage_root), hash, algorithm);
            if tokio::fs::try_exists(&staged).await? {
                pending = Some(staged);
                break;
            }
        }

        let Some(staged) = pending else {
            debug!("{} already stored", hash);
            return Ok(IngestOutcome::AlreadyStored);
        };

        info!("Resuming replication of {} from {}", hash, staged.display());
        let targets: Vec<PathBuf> = records
            .iter()
            .map(|r| storage_dir(&r.storage_root))
            .collect();
        let report = self.pipeline.replicate(&staged, hash, &targets).await?;
        Ok(IngestOutcome::Stored(report))
    }

    /// Stream the body into staging and verify it. Returns the path of the
    /// verified file, named by its hash.
    async fn receive<R>(
        &self,
        claimed: &ContentHash,
        size: u64,
        body: R,
        placement: &Placement,
        upload: &Path,
    ) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin + Send,
    {
        tokio::fs::create_dir_all(&placement.staging_dir).await?;

        let written = async {
            self.write_verified(claimed, size, body, upload).await?;
            let staged = stored_path(&placement.staging_dir, claimed, self.digest.algorithm());
            tokio::fs::rename(upload, &staged).await?;
            Ok(staged)
        }
        .await;

        if written.is_err() {
            let _ = tokio::fs::remove_file(upload).await;
        }
        written
    }

    async fn write_verified<R>(
        &self,
        claimed: &ContentHash,
        size: u64,
        mut body: R,
        path: &Path,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut file = tokio::fs::File::create(path).await?;
        let mut state = self.digest.start();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;

        loop {
            let n = tokio::time::timeout(self.read_timeout, body.read(&mut buf))
                .await
                .map_err(|_| Error::Timeout(self.read_timeout))??;
            if n == 0 {
                break;
            }
            received += n as u64;
            if received > size {
                return Err(Error::SizeMismatch {
                    declared: size,
                    received,
                });
            }
            state.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.sync_all().await?;

        if received != size {
            return Err(Error::SizeMismatch {
                declared: size,
                received,
            });
        }

        let actual = state.finalize();
        if actual != *claimed {
            return Err(Error::Validation {
                expected: claimed.to_string(),
                actual: actual.to_string(),
            });
        }
        debug!("Verified {} bytes of {}", received, claimed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfs_common::config::ReplicationConfig;
    use kfs_common::{DigestState, HashAlgorithm, Sha256Digest};
    use kfs_meta_store::MetaStore;
    use kfs_placement::DiskRegistry;
    use kfs_storage::{Copier, FsCopier, StaticProbe};
    use std::collections::BTreeMap;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tempfile::{TempDir, tempdir};
    use tokio::io::ReadBuf;

    struct Fixture {
        _db: TempDir,
        disks: Vec<TempDir>,
        ingestor: Ingestor,
    }

    impl Fixture {
        fn new(redundancy: usize, copier: Arc<dyn Copier>) -> Self {
            let db = tempdir().unwrap();
            let disks: Vec<TempDir> = (0..3).map(|_| tempdir().unwrap()).collect();
            let mut probe = StaticProbe::new();
            for disk in &disks {
                probe = probe.with_disk(disk.path(), 1000);
            }
            let store = Arc::new(MetaStore::open(db.path().join("kfs.redb")).unwrap());
            let registry = Arc::new(DiskRegistry::new(store, Arc::new(probe)));
            let roots: Vec<PathBuf> = disks.iter().map(|d| d.path().to_path_buf()).collect();
            registry.initialize(&roots).unwrap();

            let engine =
                Arc::new(AllocationEngine::new(registry, redundancy, HashAlgorithm::Blake2b).unwrap());
            let pipeline = Arc::new(
                ReplicationPipeline::new(copier, HashAlgorithm::Blake2b, &ReplicationConfig::default())
                    .with_copy_attempts(1)
                    .with_copy_timeout(Duration::from_secs(5)),
            );
            Self {
                _db: db,
                disks,
                ingestor: Ingestor::new(engine, pipeline),
            }
        }

        fn with_read_timeout(mut self, timeout: Duration) -> Self {
            self.ingestor = self.ingestor.with_read_timeout(timeout);
            self
        }

        async fn staging_is_empty(&self) -> bool {
            for disk in &self.disks {
                let staging = staging_dir(disk.path());
                if staging.exists() {
                    let mut entries = tokio::fs::read_dir(&staging).await.unwrap();
                    if entries.next_entry().await.unwrap().is_some() {
                        return false;
                    }
                }
            }
            true
        }

        fn ledger(&self) -> BTreeMap<PathBuf, u64> {
            self.ingestor
                .engine()
                .registry()
                .disks()
                .unwrap()
                .into_iter()
                .map(|d| (d.root, d.available_bytes))
                .collect()
        }
    }

    fn hash_of(data: &[u8]) -> ContentHash {
        digest_for(HashAlgorithm::Blake2b).digest(data)
    }

    /// Fails every copy while `broken` is set
    struct SwitchCopier {
        broken: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Copier for SwitchCopier {
        async fn copy(&self, src: &Path, dst: &Path) -> io::Result<u64> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(io::Error::other("target offline"));
            }
            FsCopier.copy(src, dst).await
        }
    }

    /// A body that never yields another byte
    struct StalledBody;

    impl AsyncRead for StalledBody {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    /// Addresses every input by the same hash
    struct FixedDigest;

    struct FixedState;

    impl DigestState for FixedState {
        fn update(&mut self, _data: &[u8]) {}

        fn finalize(self: Box<Self>) -> ContentHash {
            ContentHash::new("00ff").unwrap()
        }
    }

    impl ContentDigest for FixedDigest {
        fn algorithm(&self) -> HashAlgorithm {
            HashAlgorithm::Blake2b
        }

        fn start(&self) -> Box<dyn DigestState> {
            Box::new(FixedState)
        }
    }

    #[tokio::test]
    async fn test_ingest_round_trip() {
        let fx = Fixture::new(2, Arc::new(FsCopier));
        let data = vec![7u8; 400];
        let hash = hash_of(&data);

        let outcome = fx.ingestor.ingest(&hash, 400, data.as_slice()).await.unwrap();
        let IngestOutcome::Stored(report) = outcome else {
            panic!("expected a fresh store");
        };
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.staging_removed);
        assert!(fx.ingestor.has_hash(&hash).await.unwrap());

        let name = hash.file_name(HashAlgorithm::Blake2b);
        let mut replicas = 0;
        for disk in &fx.disks {
            let replica = storage_dir(disk.path()).join(&name);
            if replica.exists() {
                assert_eq!(tokio::fs::read(&replica).await.unwrap(), data);
                replicas += 1;
            }
            // Staging is empty once replication finished
            let staging = staging_dir(disk.path());
            if staging.exists() {
                let mut entries = tokio::fs::read_dir(&staging).await.unwrap();
                assert!(entries.next_entry().await.unwrap().is_none());
            }
        }
        assert_eq!(replicas, 2);

        // A second upload of the same content changes nothing
        let before = fx.ledger();
        let again = fx.ingestor.ingest(&hash, 400, data.as_slice()).await.unwrap();
        assert!(matches!(again, IngestOutcome::AlreadyStored));
        assert_eq!(fx.ledger(), before);
    }

    #[tokio::test]
    async fn test_hash_mismatch_releases_allocation() {
        let fx = Fixture::new(2, Arc::new(FsCopier));
        let before = fx.ledger();
        let claimed = hash_of(b"what the client promised");

        let err = fx
            .ingestor
            .ingest(&claimed, 11, &b"what we got"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(err.http_status_code(), 406);

        assert_eq!(fx.ledger(), before);
        assert!(!fx.ingestor.has_hash(&claimed).await.unwrap());
        for disk in &fx.disks {
            let staging = staging_dir(disk.path());
            if staging.exists() {
                let mut entries = tokio::fs::read_dir(&staging).await.unwrap();
                assert!(entries.next_entry().await.unwrap().is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_size_mismatch_releases_allocation() {
        let fx = Fixture::new(2, Arc::new(FsCopier));
        let before = fx.ledger();
        let data = b"twelve bytes";
        let hash = hash_of(data);

        let short = fx.ingestor.ingest(&hash, 20, &data[..]).await.unwrap_err();
        assert!(matches!(
            short,
            Error::SizeMismatch {
                declared: 20,
                received: 12
            }
        ));
        let long = fx.ingestor.ingest(&hash, 4, &data[..]).await.unwrap_err();
        assert!(matches!(long, Error::SizeMismatch { declared: 4, .. }));

        assert_eq!(fx.ledger(), before);
        assert!(!fx.ingestor.has_hash(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_insufficient_redundancy() {
        let fx = Fixture::new(2, Arc::new(FsCopier));
        let data = vec![1u8; 600];
        let err = fx
            .ingestor
            .ingest(&hash_of(&data), 600, data.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientRedundancy { .. }));
    }

    #[tokio::test]
    async fn test_failed_replication_resumes_on_retry() {
        let copier = Arc::new(SwitchCopier {
            broken: AtomicBool::new(true),
        });
        let fx = Fixture::new(2, copier.clone());
        let data = b"survive a flaky disk".to_vec();
        let hash = hash_of(&data);
        let size = data.len() as u64;

        let err = fx
            .ingestor
            .ingest(&hash, size, data.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReplicationPartialFailure { .. }));
        assert!(err.is_retryable());
        // Allocation stays; the verified file waits in staging
        assert!(fx.ingestor.has_hash(&hash).await.unwrap());

        copier.broken.store(false, Ordering::SeqCst);
        let outcome = fx
            .ingestor
            .ingest(&hash, size, data.as_slice())
            .await
            .unwrap();
        let IngestOutcome::Stored(report) = outcome else {
            panic!("expected the retry to finish replication");
        };
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.staging_removed);

        // Nothing left to resume
        let third = fx
            .ingestor
            .ingest(&hash, size, data.as_slice())
            .await
            .unwrap();
        assert!(matches!(third, IngestOutcome::AlreadyStored));
    }

    #[tokio::test]
    async fn test_dropped_upload_releases_allocation() {
        let fx = Fixture::new(2, Arc::new(FsCopier));
        let before = fx.ledger();
        let data = b"half of this arrives, then the client vanishes".to_vec();
        let hash = hash_of(&data);
        let size = data.len() as u64;

        let body = (&data[..10]).chain(StalledBody);
        let dropped =
            tokio::time::timeout(Duration::from_millis(100), fx.ingestor.ingest(&hash, size, body))
                .await;
        assert!(dropped.is_err());

        // The release runs on the blocking pool after the drop
        for _ in 0..200 {
            if fx.ledger() == before && !fx.ingestor.has_hash(&hash).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.ledger(), before);
        assert!(!fx.ingestor.has_hash(&hash).await.unwrap());
        assert!(fx.staging_is_empty().await);

        // The client comes back with the whole body
        let outcome = fx
            .ingestor
            .ingest(&hash, size, data.as_slice())
            .await
            .unwrap();
        let IngestOutcome::Stored(report) = outcome else {
            panic!("expected a fresh store");
        };
        assert_eq!(report.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let fx = Fixture::new(2, Arc::new(FsCopier)).with_read_timeout(Duration::from_millis(50));
        let before = fx.ledger();
        let data = b"a body that stops short".to_vec();
        let hash = hash_of(&data);

        let body = (&data[..4]).chain(StalledBody);
        let err = fx
            .ingestor
            .ingest(&hash, data.len() as u64, body)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(err.http_status_code(), 408);

        assert_eq!(fx.ledger(), before);
        assert!(!fx.ingestor.has_hash(&hash).await.unwrap());
        assert!(fx.staging_is_empty().await);
    }

    #[tokio::test]
    async fn test_injected_digest_verifies_uploads() {
        let mut fx = Fixture::new(2, Arc::new(FsCopier));
        fx.ingestor = fx.ingestor.with_digest(Arc::new(FixedDigest)).unwrap();
        let hash = ContentHash::new("00ff").unwrap();

        let outcome = fx.ingestor.ingest(&hash, 5, &b"hello"[..]).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored(_)));
        let name = hash.file_name(HashAlgorithm::Blake2b);
        let replicas = fx
            .disks
            .iter()
            .filter(|d| storage_dir(d.path()).join(&name).exists())
            .count();
        assert_eq!(replicas, 2);

        // Any other claim fails verification against the injected digest
        let other = hash_of(b"hello");
        let err = fx.ingestor.ingest(&other, 5, &b"hello"[..]).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_digest_algorithm_mismatch_rejected() {
        let fx = Fixture::new(2, Arc::new(FsCopier));
        let err = fx
            .ingestor
            .with_digest(Arc::new(Sha256Digest))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
