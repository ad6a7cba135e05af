//! Heals divergence between the blob store and the metadata store.
//!
//! Ingest writes the blob before the record, and every delete removes the
//! record before the blob, so a crash can leave either half on its own. The
//! reconciler deletes whichever half is orphaned; it never tries to rebuild
//! an object from partial state.

use super::{
    blob_store::BlobStore, conversion::ConversionCache, error::StorageResult,
    metadata_store::MetadataStore,
};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tracing::{debug, info, instrument};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphan_blobs: usize,
    pub orphan_records: usize,
    pub orphan_artifacts: usize,
    pub stale_temp_files: usize,
}

pub struct Reconciler {
    metadata: Arc<dyn MetadataStore>,
    blobs: BlobStore,
    cache: ConversionCache,
    min_orphan_age: Duration,
}

impl Reconciler {
    pub fn new(metadata: Arc<dyn MetadataStore>, blobs: BlobStore, cache: ConversionCache) -> Self {
        Self {
            metadata,
            blobs,
            cache,
            min_orphan_age: Duration::ZERO,
        }
    }

    /// Leave blobs younger than `age` alone. Needed when running alongside
    /// live uploads, whose blobs exist briefly before their record.
    pub fn with_min_orphan_age(mut self, age: Duration) -> Self {
        self.min_orphan_age = age;
        self
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> StorageResult<ReconcileReport> {
        // Store first: an upload finishing between the two listings then shows
        // up as a young blob without a record, never as a record without a blob.
        let ids_in_store: HashSet<String> =
            self.metadata.list_all_ids().await?.into_iter().collect();
        let ids_on_disk: HashSet<String> = self.blobs.list_ids().await?.into_iter().collect();

        let mut report = ReconcileReport::default();

        for id in ids_on_disk.difference(&ids_in_store) {
            if !self.min_orphan_age.is_zero() {
                match self.blobs.age(id).await? {
                    Some(age) if age >= self.min_orphan_age => {}
                    _ => continue,
                }
            }
            if self.metadata.find(id).await?.is_some() {
                continue;
            }
            self.cache.delete_all(id).await?;
            if self.blobs.delete(id).await? {
                debug!("removed blob {} with no record", id);
                report.orphan_blobs += 1;
            }
        }

        for id in ids_in_store.difference(&ids_on_disk) {
            if self.blobs.exists(id).await? {
                continue;
            }
            if self.metadata.delete(id).await? {
                debug!("removed record {} with no blob", id);
                report.orphan_records += 1;
            }
            self.cache.delete_all(id).await?;
        }

        for id in self.cache.list_ids().await? {
            if self.metadata.find(&id).await?.is_none() {
                report.orphan_artifacts += self.cache.delete_all(&id).await?;
            }
        }

        report.stale_temp_files = self
            .cache
            .remove_stale_temp_files(self.min_orphan_age)
            .await?;

        info!(
            "Reconciliation removed {} orphan blobs, {} orphan records, {} orphan artifacts, {} stale temp files",
            report.orphan_blobs,
            report.orphan_records,
            report.orphan_artifacts,
            report.stale_temp_files
        );
        Ok(report)
    }
}
