//! KFS Placement - where replicas live
//!
//! This crate decides placement and keeps the free-space ledger honest:
//! - The disk registry snapshots free space at startup
//! - The reservation policy filters and picks replica disks
//! - The allocation engine serializes dedup, selection and debit
//!
//! # Example
//! ```ignore
//! use kfs_placement::{Allocation, AllocationEngine, DiskRegistry};
//!
//! let registry = Arc::new(DiskRegistry::new(store, Arc::new(StatvfsProbe)));
//! registry.initialize(&config.storage.disks)?;
//! let engine = AllocationEngine::new(registry, 2, HashAlgorithm::Blake2b)?;
//! match engine.allocate(&hash, size)? {
//!     Allocation::Placed(placement) => { /* stream into placement.staging_dir */ }
//!     Allocation::AlreadyStored => {}
//! }
//! ```

pub mod allocator;
pub mod policy;
pub mod registry;

pub use allocator::{Allocation, AllocationEngine, Placement};
pub use policy::{reservation_threshold, select_replicas};
pub use registry::DiskRegistry;
