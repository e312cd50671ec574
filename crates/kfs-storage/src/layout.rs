//! Disk layout definitions
//!
//! Every registered disk root carries the same tree:
//! ```text
//! <root>/
//! └── .kfs/
//!     ├── staging/   in-flight uploads: <uuid>.upload, then <hash>.<algo>
//!     └── storage/   replicas: <hash>.<algo>, copies in flight as
//!                    <hash>.<algo>.<uuid>.partial
//! ```

use kfs_common::{ContentHash, HashAlgorithm};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Per-disk directory owned by KFS
pub const KFS_DIR: &str = ".kfs";

/// Scratch area for uploads awaiting verification
pub const STAGING_DIR: &str = "staging";

/// Final replica area
pub const STORAGE_DIR: &str = "storage";

/// Extension of an upload still being received
pub const UPLOAD_EXT: &str = "upload";

/// Suffix of a replica still being copied
pub const PARTIAL_SUFFIX: &str = ".partial";

#[must_use]
pub fn staging_dir(root: &Path) -> PathBuf {
    root.join(KFS_DIR).join(STAGING_DIR)
}

#[must_use]
pub fn storage_dir(root: &Path) -> PathBuf {
    root.join(KFS_DIR).join(STORAGE_DIR)
}

/// `<dir>/<hash>.<algorithm>`
#[must_use]
pub fn stored_path(dir: &Path, hash: &ContentHash, algorithm: HashAlgorithm) -> PathBuf {
    dir.join(hash.file_name(algorithm))
}

/// Fresh, collision-free name for an upload in a staging directory
#[must_use]
pub fn upload_path(staging: &Path) -> PathBuf {
    staging.join(format!("{}.{UPLOAD_EXT}", Uuid::new_v4()))
}

/// Sibling path a copy is written to before being renamed into place:
/// `<destination>.<uuid>.partial`, fresh for every call so overlapping
/// writers never share a temp file.
#[must_use]
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(format!(".{}{PARTIAL_SUFFIX}", Uuid::new_v4()));
    destination.with_file_name(name)
}

/// Create the staging and storage directories under a disk root
pub async fn ensure_layout(root: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(staging_dir(root)).await?;
    tokio::fs::create_dir_all(storage_dir(root)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths() {
        let root = Path::new("/mnt/disk1");
        assert_eq!(staging_dir(root), PathBuf::from("/mnt/disk1/.kfs/staging"));
        assert_eq!(storage_dir(root), PathBuf::from("/mnt/disk1/.kfs/storage"));

        let hash = ContentHash::new("deadbeef").unwrap();
        assert_eq!(
            stored_path(&storage_dir(root), &hash, HashAlgorithm::Blake2b),
            PathBuf::from("/mnt/disk1/.kfs/storage/deadbeef.blake2b")
        );
    }

    #[test]
    fn test_partial_paths_are_unique_siblings() {
        let dest = Path::new("/x/deadbeef.blake2b");
        let a = partial_path(dest);
        let b = partial_path(dest);
        assert_ne!(a, b);
        assert_eq!(a.parent(), dest.parent());
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("deadbeef.blake2b."));
        assert!(name.ends_with(PARTIAL_SUFFIX));
    }

    #[test]
    fn test_upload_paths_are_unique() {
        let staging = Path::new("/mnt/disk1/.kfs/staging");
        let a = upload_path(staging);
        let b = upload_path(staging);
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(staging));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some(UPLOAD_EXT));
    }

    #[tokio::test]
    async fn test_ensure_layout() {
        let dir = tempdir().unwrap();
        ensure_layout(dir.path()).await.unwrap();
        assert!(staging_dir(dir.path()).is_dir());
        assert!(storage_dir(dir.path()).is_dir());
        // Idempotent
        ensure_layout(dir.path()).await.unwrap();
    }
}
