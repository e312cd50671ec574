//! Free-space probing of disk roots

use kfs_common::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Reports how many bytes are free under a disk root
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, root: &Path) -> Result<u64>;
}

/// Probe backed by `statvfs(3)`: blocks available to unprivileged users
/// times the fragment size.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available_bytes(&self, root: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(root)
            .map_err(|e| Error::storage(format!("statvfs {}: {e}", root.display())))?;
        Ok(u64::from(stat.blocks_available()).saturating_mul(u64::from(stat.fragment_size())))
    }
}

/// Fixed capacities per root, for dry runs and tests
#[derive(Clone, Debug, Default)]
pub struct StaticProbe {
    capacities: HashMap<PathBuf, u64>,
}

impl StaticProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_disk(mut self, root: impl Into<PathBuf>, available_bytes: u64) -> Self {
        self.capacities.insert(root.into(), available_bytes);
        self
    }
}

impl SpaceProbe for StaticProbe {
    fn available_bytes(&self, root: &Path) -> Result<u64> {
        self.capacities
            .get(root)
            .copied()
            .ok_or_else(|| Error::DiskNotFound(root.display().to_string()))
    }
}
