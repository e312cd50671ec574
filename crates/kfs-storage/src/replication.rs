//! Replication pipeline
//!
//! Copies a verified staged file to every replica directory concurrently,
//! joins on all copies, then retires the staging copy. The staging file is
//! only removed once every target holds a complete replica; if any target
//! still fails after its retries, the staging file stays in place so the
//! upload can be replayed (destinations are content-addressed, so a replay
//! overwrites with identical bytes).

use crate::copier::Copier;
use crate::layout::stored_path;
use futures::future::join_all;
use kfs_common::config::ReplicationConfig;
use kfs_common::{ContentHash, Error, HashAlgorithm, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of copying to one replica directory
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub target: PathBuf,
    pub destination: PathBuf,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Bytes written, or the last error
    pub result: std::result::Result<u64, String>,
}

impl CopyOutcome {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Summary of a fully successful replication
#[derive(Debug, Clone)]
pub struct ReplicationReport {
    pub hash: ContentHash,
    pub outcomes: Vec<CopyOutcome>,
    pub bytes_written: u64,
    /// False if the staging file could not be removed after the join
    pub staging_removed: bool,
}

pub struct ReplicationPipeline {
    copier: Arc<dyn Copier>,
    algorithm: HashAlgorithm,
    copy_timeout: Duration,
    copy_attempts: u32,
    retry_backoff: Duration,
}

impl ReplicationPipeline {
    #[must_use]
    pub fn new(copier: Arc<dyn Copier>, algorithm: HashAlgorithm, config: &ReplicationConfig) -> Self {
        Self {
            copier,
            algorithm,
            copy_timeout: config.copy_timeout(),
            copy_attempts: config.copy_attempts.max(1),
            retry_backoff: config.retry_backoff(),
        }
    }

    #[must_use]
    pub const fn with_copy_timeout(mut self, timeout: Duration) -> Self {
        self.copy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_copy_attempts(mut self, attempts: u32) -> Self {
        self.copy_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Copy `staged` into every directory in `targets` as
    /// `<target>/<hash>.<algorithm>`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an empty target list, `DiskIo` if the staged
    /// file is missing, `ReplicationPartialFailure` if any target could not
    /// be written after all attempts. In the last case the staged file is
    /// left in place.
    pub async fn replicate(
        &self,
        staged: &Path,
        hash: &ContentHash,
        targets: &[PathBuf],
    ) -> Result<ReplicationReport> {
        if targets.is_empty() {
            return Err(Error::invalid_request("no replica targets"));
        }
        let size = tokio::fs::metadata(staged).await?.len();

        let mut unique: Vec<&PathBuf> = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(&target) {
                unique.push(target);
            }
        }

        debug!(
            "Replicating {} ({} bytes) to {} targets",
            hash,
            size,
            unique.len()
        );

        let outcomes: Vec<CopyOutcome> = join_all(
            unique
                .iter()
                .map(|target| self.copy_with_retry(staged, hash, target)),
        )
        .await;

        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_ok())
            .map(|o| o.target.display().to_string())
            .collect();

        if !failed.is_empty() {
            warn!(
                "Replication of {} incomplete, keeping staging file {}",
                hash,
                staged.display()
            );
            return Err(Error::ReplicationPartialFailure {
                hash: hash.to_string(),
                failed,
                total: outcomes.len(),
            });
        }

        let staging_removed = match tokio::fs::remove_file(staged).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to remove staging file {}: {}", staged.display(), e);
                false
            }
        };

        let bytes_written = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum();

        info!(
            "Replicated {} to {} targets ({} bytes written)",
            hash,
            outcomes.len(),
            bytes_written
        );

        Ok(ReplicationReport {
            hash: hash.clone(),
            outcomes,
            bytes_written,
            staging_removed,
        })
    }

    async fn copy_with_retry(&self, src: &Path, hash: &ContentHash, target: &Path) -> CopyOutcome {
        let destination = stored_path(target, hash, self.algorithm);
        let mut last_error = String::new();

        for attempt in 1..=self.copy_attempts {
            match tokio::time::timeout(self.copy_timeout, self.copier.copy(src, &destination)).await
            {
                Ok(Ok(bytes)) => {
                    return CopyOutcome {
                        target: target.to_path_buf(),
                        destination,
                        attempts: attempt,
                        result: Ok(bytes),
                    };
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", self.copy_timeout),
            }

            warn!(
                "Copy of {} to {} failed (attempt {}/{}): {}",
                hash,
                target.display(),
                attempt,
                self.copy_attempts,
                last_error
            );

            if attempt < self.copy_attempts && !self.retry_backoff.is_zero() {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        CopyOutcome {
            target: target.to_path_buf(),
            destination,
            attempts: self.copy_attempts,
            result: Err(last_error),
        }
    }
}
