//! Content digest primitives
//!
//! Hashing is reached through the [`ContentDigest`] trait so the engine
//! and the ingestion path can be driven by deterministic fakes in tests.
//! The concrete implementations wrap the RustCrypto hashers.

use crate::types::{ContentHash, HashAlgorithm};
use sha2::Digest;
use std::sync::Arc;

/// Incremental digest state for one stream of bytes
pub trait DigestState: Send {
    /// Feed more bytes
    fn update(&mut self, data: &[u8]);

    /// Finish and return the hex-encoded digest
    fn finalize(self: Box<Self>) -> ContentHash;
}

/// A digest function: bytes -> content hash
pub trait ContentDigest: Send + Sync {
    /// Algorithm recorded alongside stored content
    fn algorithm(&self) -> HashAlgorithm;

    /// Start a new streaming computation
    fn start(&self) -> Box<dyn DigestState>;

    /// Digest a complete buffer
    fn digest(&self, data: &[u8]) -> ContentHash {
        let mut state = self.start();
        state.update(data);
        state.finalize()
    }
}

struct HasherState<D>(D);

impl<D: Digest + Send> DigestState for HasherState<D> {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> ContentHash {
        let Self(hasher) = *self;
        ContentHash::from_digest(&hasher.finalize())
    }
}

/// BLAKE2b-512, matching `b2sum` output
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake2bDigest;

impl ContentDigest for Blake2bDigest {
    fn algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::Blake2b
    }

    fn start(&self) -> Box<dyn DigestState> {
        Box::new(HasherState(blake2::Blake2b512::new()))
    }
}

/// SHA-256
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Digest;

impl ContentDigest for Sha256Digest {
    fn algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    fn start(&self) -> Box<dyn DigestState> {
        Box::new(HasherState(sha2::Sha256::new()))
    }
}

/// Digest implementation for a configured algorithm
#[must_use]
pub fn digest_for(algorithm: HashAlgorithm) -> Arc<dyn ContentDigest> {
    match algorithm {
        HashAlgorithm::Blake2b => Arc::new(Blake2bDigest),
        HashAlgorithm::Sha256 => Arc::new(Sha256Digest),
    }
}
