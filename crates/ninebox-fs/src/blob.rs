//! Content-addressed blob storage.
//!
//! File contents are stored by the SHA-256 of their bytes, so identical
//! contents share one blob and a blob id fully determines its data. The
//! backend keeps only blob ids in its inodes; everything byte-shaped lives
//! behind [`BlobStore`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use sha2::{Digest, Sha256};

/// SHA-256 address of a blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId([u8; 32]);

impl BlobId {
    /// Computes the id of a byte string.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// The raw digest.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({self})")
    }
}

/// Keyed blob storage: sha256 → bytes.
pub trait BlobStore: Send + Sync {
    /// Stores `data`, returning its id. Storing identical bytes twice is a
    /// no-op returning the same id.
    fn put(&self, data: Vec<u8>) -> BlobId;

    /// Fetches a blob by id.
    fn get(&self, id: &BlobId) -> Option<Arc<Vec<u8>>>;

    /// True if the blob is present.
    fn contains(&self, id: &BlobId) -> bool;

    /// Number of distinct blobs held.
    fn count(&self) -> usize;
}

/// In-memory [`BlobStore`].
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobId, Arc<Vec<u8>>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, data: Vec<u8>) -> BlobId {
        let id = BlobId::of(&data);
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| Arc::new(data));
        id
    }

    fn get(&self, id: &BlobId) -> Option<Arc<Vec<u8>>> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn contains(&self, id: &BlobId) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn count(&self) -> usize {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
