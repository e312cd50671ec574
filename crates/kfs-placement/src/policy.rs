//! Reservation policy

use kfs_common::Disk;
use rand::Rng;
use rand::seq::SliceRandom;

/// Minimum free space, exclusive, a disk needs to take an upload of `size`
/// bytes.
///
/// Any qualifying disk may end up as the staging disk, which briefly holds
/// the upload and its replica side by side, so it must fit two copies.
#[must_use]
pub const fn reservation_threshold(size: u64) -> u64 {
    size.saturating_mul(2)
}

/// Pick `redundancy` distinct disks uniformly at random.
///
/// The first disk of the result is the staging disk. Returns `None` when
/// there are fewer candidates than `redundancy`.
pub fn select_replicas<R: Rng + ?Sized>(
    mut candidates: Vec<Disk>,
    redundancy: usize,
    rng: &mut R,
) -> Option<Vec<Disk>> {
    if candidates.len() < redundancy {
        return None;
    }
    candidates.shuffle(rng);
    candidates.truncate(redundancy);
    Some(candidates)
}
