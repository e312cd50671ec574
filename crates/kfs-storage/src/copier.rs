//! Byte copying behind an injectable trait
//!
//! The replication pipeline only ever asks for "copy this file there";
//! tests swap in copiers that fail, stall or record calls.

use crate::layout::partial_path;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use tracing::debug;

#[async_trait]
pub trait Copier: Send + Sync {
    /// Copy `src` to `dst`, returning the number of bytes written.
    ///
    /// `dst` is a content-addressed name, so overwriting an existing
    /// destination must be safe.
    async fn copy(&self, src: &Path, dst: &Path) -> io::Result<u64>;
}

/// Filesystem copier: writes a uniquely named `.partial` sibling, syncs it,
/// then renames it over the destination so readers never observe a torn
/// replica and concurrent copies of the same content never collide.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsCopier;

#[async_trait]
impl Copier for FsCopier {
    async fn copy(&self, src: &Path, dst: &Path) -> io::Result<u64> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(dst);

        let result = async {
            let bytes = tokio::fs::copy(src, &partial).await?;
            tokio::fs::File::open(&partial).await?.sync_all().await?;
            tokio::fs::rename(&partial, dst).await?;
            Ok(bytes)
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        } else {
            debug!("Copied {} -> {}", src.display(), dst.display());
        }
        result
    }
}
