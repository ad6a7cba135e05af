//! Short random identifiers, reserved atomically against the blob store.

use super::{
    blob_store::{BlobReservation, BlobStore},
    conversion::ConversionCache,
    error::{StorageError, StorageResult},
    metadata_store::MetadataStore,
};
use rand::{Rng, rngs::OsRng};
use std::sync::Arc;
use tracing::debug;

/// Upper bound on draws before giving up. Only reachable with a tiny id space.
const MAX_ATTEMPTS: usize = 64;

#[derive(Clone, Debug)]
pub struct IdAllocator {
    alphabet: Arc<[char]>,
    length: usize,
}

impl IdAllocator {
    /// Build an allocator. The alphabet must be non-empty and free of duplicates;
    /// configuration validation guarantees both before this is called.
    pub fn new(alphabet: &str, length: usize) -> Self {
        Self {
            alphabet: alphabet.chars().collect(),
            length,
        }
    }

    /// Whether `id` could have been produced by this allocator.
    pub fn is_valid(&self, id: &str) -> bool {
        id.chars().count() == self.length && id.chars().all(|c| self.alphabet.contains(&c))
    }

    fn candidate(&self) -> String {
        (0..self.length)
            .map(|_| self.alphabet[OsRng.gen_range(0..self.alphabet.len())])
            .collect()
    }

    /// Draw ids until one is free of any record, cached artifact or blob, and
    /// reserve it by exclusively creating its blob file.
    pub async fn allocate(
        &self,
        blobs: &BlobStore,
        cache: &ConversionCache,
        metadata: &dyn MetadataStore,
    ) -> StorageResult<BlobReservation> {
        for _ in 0..MAX_ATTEMPTS {
            let candidate = self.candidate();
            if metadata.find(&candidate).await?.is_some() || cache.has_any(&candidate).await? {
                debug!("id {} still has a record or artifact, redrawing", candidate);
                continue;
            }
            match blobs.reserve(&candidate).await? {
                Some(reservation) => return Ok(reservation),
                None => debug!("id {} collided with an existing blob, redrawing", candidate),
            }
        }
        Err(StorageError::IdSpaceExhausted(MAX_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{Harness, record};
    use std::collections::HashSet;

    #[test]
    fn candidates_use_configured_alphabet_and_length() {
        let allocator = IdAllocator::new("ab", 8);
        for _ in 0..100 {
            let id = allocator.candidate();
            assert_eq!(id.len(), 8);
            assert!(allocator.is_valid(&id));
        }
    }

    #[test]
    fn validation_rejects_foreign_shapes() {
        let allocator = IdAllocator::new("abc", 3);
        assert!(allocator.is_valid("cab"));
        assert!(!allocator.is_valid("ca"));
        assert!(!allocator.is_valid("cad"));
        assert!(!allocator.is_valid("../"));
    }

    #[tokio::test]
    async fn allocations_are_unique_while_live() {
        let h = Harness::new().await;
        let allocator = IdAllocator::new("abcd", 2);

        let mut seen = HashSet::new();
        for _ in 0..10 {
            let reservation = allocator
                .allocate(&h.blobs, &h.cache, h.metadata.as_ref())
                .await
                .unwrap();
            assert!(seen.insert(reservation.id().to_string()));
        }
    }

    #[tokio::test]
    async fn exhausted_space_is_reported() {
        let h = Harness::new().await;
        let allocator = IdAllocator::new("a", 1);

        let first = allocator
            .allocate(&h.blobs, &h.cache, h.metadata.as_ref())
            .await
            .unwrap();
        assert_eq!(first.id(), "a");

        let err = allocator
            .allocate(&h.blobs, &h.cache, h.metadata.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::IdSpaceExhausted(_)));
    }

    #[tokio::test]
    async fn ids_with_a_live_record_are_skipped() {
        let h = Harness::new().await;
        h.metadata.create(&record("a", 0, 10)).await.unwrap();
        let allocator = IdAllocator::new("ab", 1);

        let reservation = allocator
            .allocate(&h.blobs, &h.cache, h.metadata.as_ref())
            .await
            .unwrap();
        assert_eq!(reservation.id(), "b");
    }

    #[tokio::test]
    async fn ids_with_a_cached_artifact_are_skipped() {
        let h = Harness::new().await;
        std::fs::write(h.cache.base_path().join("a.png"), b"stale").unwrap();
        let allocator = IdAllocator::new("ab", 1);

        let reservation = allocator
            .allocate(&h.blobs, &h.cache, h.metadata.as_ref())
            .await
            .unwrap();
        assert_eq!(reservation.id(), "b");
    }
}
