//! Periodic purge of expired objects from both stores.

use super::{
    blob_store::BlobStore, clock::Clock, conversion::ConversionCache, error::StorageResult,
    metadata_store::MetadataStore,
};
use futures::{StreamExt, stream};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, instrument};

/// Expired ids purged in parallel within one tick.
const SWEEP_CONCURRENCY: usize = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: usize,
    pub failed: usize,
}

pub struct ExpirySweeper {
    metadata: Arc<dyn MetadataStore>,
    blobs: BlobStore,
    cache: ConversionCache,
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl ExpirySweeper {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: BlobStore,
        cache: ConversionCache,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> Self {
        Self {
            metadata,
            blobs,
            cache,
            clock,
            period,
        }
    }

    /// Run a single sweep.
    ///
    /// Only a failure to list expired ids is returned as an error. Per-id
    /// failures are logged and counted so the remaining ids still get purged.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> StorageResult<SweepReport> {
        let now = self.clock.now_ms();
        let expired = self.metadata.find_expired(now).await?;
        if expired.is_empty() {
            return Ok(SweepReport::default());
        }

        let results = stream::iter(expired)
            .map(|id| async move {
                let outcome = self.purge(&id).await;
                (id, outcome)
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut report = SweepReport::default();
        for (id, outcome) in results {
            match outcome {
                Ok(()) => report.purged += 1,
                Err(err) => {
                    error!("failed to purge expired object {}: {}", id, err);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Record first so lookups fail immediately, then artifacts, then the blob.
    async fn purge(&self, id: &str) -> StorageResult<()> {
        self.metadata.delete(id).await?;
        self.cache.delete_all(id).await?;
        self.blobs.delete(id).await?;
        debug!("purged expired object {}", id);
        Ok(())
    }

    /// Spawn the sweep loop. A tick always runs to completion; shutdown is
    /// only observed between ticks.
    pub fn start(self: Arc<Self>) -> SweeperHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!("Starting expiry sweeper every {:?}", self.period);
            let mut tick = interval(self.period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match self.run_once().await {
                            Ok(report) if report.purged > 0 || report.failed > 0 => {
                                info!(
                                    "Sweep purged {} expired objects ({} failed)",
                                    report.purged, report.failed
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!("Error listing expired objects: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Expiry sweeper shutting down");
                        break;
                    }
                }
            }
        });

        SweeperHandle { shutdown, task }
    }
}

pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal shutdown and wait for the in-flight tick, if any, to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            error!("expiry sweeper task ended abnormally: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            format::TargetFormat,
            object::{ObjectRecord, UploadOptions},
        },
        services::{
            error::StorageError,
            metadata_store::SqliteMetadataStore,
            test_support::{Harness, body_bytes, ingest_bytes, png_bytes, record},
        },
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Delegates to SQLite, but refuses to delete one id and can fail the
    /// next expiry listing.
    struct FlakyStore {
        inner: Arc<SqliteMetadataStore>,
        stuck_id: String,
        fail_next_listing: AtomicBool,
    }

    #[async_trait]
    impl MetadataStore for FlakyStore {
        async fn create(&self, record: &ObjectRecord) -> StorageResult<()> {
            self.inner.create(record).await
        }
        async fn find(&self, id: &str) -> StorageResult<Option<ObjectRecord>> {
            self.inner.find(id).await
        }
        async fn find_expired(&self, now_ms: i64) -> StorageResult<Vec<String>> {
            if self.fail_next_listing.swap(false, Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("database is locked")));
            }
            self.inner.find_expired(now_ms).await
        }
        async fn delete(&self, id: &str) -> StorageResult<bool> {
            if id == self.stuck_id {
                return Err(StorageError::Io(std::io::Error::other("disk I/O error")));
            }
            self.inner.delete(id).await
        }
        async fn list_all_ids(&self) -> StorageResult<Vec<String>> {
            self.inner.list_all_ids().await
        }
        async fn ping(&self) -> StorageResult<()> {
            self.inner.ping().await
        }
    }

    fn flaky_sweeper(h: &Harness, stuck_id: &str, fail_next_listing: bool) -> ExpirySweeper {
        ExpirySweeper::new(
            Arc::new(FlakyStore {
                inner: h.metadata.clone(),
                stuck_id: stuck_id.to_string(),
                fail_next_listing: AtomicBool::new(fail_next_listing),
            }),
            h.blobs.clone(),
            h.cache.clone(),
            h.clock.clone(),
            Duration::from_millis(10),
        )
    }

    fn sweeper_for(h: &Harness) -> ExpirySweeper {
        ExpirySweeper::new(
            h.metadata.clone(),
            h.blobs.clone(),
            h.cache.clone(),
            h.clock.clone(),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn expired_objects_are_purged_after_one_tick() {
        let h = Harness::new().await;
        let sweeper = sweeper_for(&h);

        let payload = b"ten bytes!";
        let receipt = ingest_bytes(&h.service, payload, UploadOptions {
            name: "ten.txt".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let object = h.service.retrieve(&receipt.id, None).await.unwrap();
        assert_eq!(body_bytes(object.body).await, payload);

        assert_eq!(sweeper.run_once().await.unwrap(), SweepReport::default());

        h.clock.advance(Duration::from_secs(3601));
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport { purged: 1, failed: 0 });

        assert!(h.metadata.find(&receipt.id).await.unwrap().is_none());
        assert!(!h.blobs.exists(&receipt.id).await.unwrap());
        assert!(matches!(
            h.service.retrieve(&receipt.id, None).await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn sweep_removes_cached_artifacts() {
        let h = Harness::new().await;
        let sweeper = sweeper_for(&h);
        let receipt = ingest_bytes(&h.service, &png_bytes(), UploadOptions {
            name: "pic.png".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        for format in TargetFormat::ALL {
            h.service.retrieve(&receipt.id, Some(format)).await.unwrap();
        }
        assert!(h.cache.has_any(&receipt.id).await.unwrap());

        h.clock.advance(Duration::from_secs(7200));
        sweeper.run_once().await.unwrap();

        assert!(!h.cache.has_any(&receipt.id).await.unwrap());
        assert!(h.cache.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_objects_survive_and_missing_pieces_are_tolerated() {
        let h = Harness::new().await;
        let sweeper = sweeper_for(&h);
        let keep = ingest_bytes(&h.service, b"keep", UploadOptions {
            name: "keep.txt".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        // An expired record whose blob is already gone.
        h.metadata
            .create(&record("ghost1", 0, 1))
            .await
            .unwrap();

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport { purged: 1, failed: 0 });
        assert!(h.metadata.find(&keep.id).await.unwrap().is_some());
        assert!(h.blobs.exists(&keep.id).await.unwrap());
    }

    #[tokio::test]
    async fn one_failing_id_does_not_stop_the_tick() {
        let h = Harness::new().await;
        for id in ["aaaaa1", "aaaaa2", "aaaaa3", "aaaaa4"] {
            h.metadata.create(&record(id, 0, 1)).await.unwrap();
            std::fs::write(h.blobs.base_path().join(id), b"expired").unwrap();
        }
        let sweeper = flaky_sweeper(&h, "aaaaa2", false);

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport { purged: 3, failed: 1 });

        for id in ["aaaaa1", "aaaaa3", "aaaaa4"] {
            assert!(h.metadata.find(id).await.unwrap().is_none());
            assert!(!h.blobs.exists(id).await.unwrap());
        }
        assert!(h.metadata.find("aaaaa2").await.unwrap().is_some());
        assert!(h.blobs.exists("aaaaa2").await.unwrap());
    }

    #[tokio::test]
    async fn failed_listing_is_retried_next_tick() {
        let h = Harness::new().await;
        h.metadata.create(&record("bbbbb1", 0, 1)).await.unwrap();
        let sweeper = flaky_sweeper(&h, "", true);

        assert!(sweeper.run_once().await.is_err());
        assert!(h.metadata.find("bbbbb1").await.unwrap().is_some());

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport { purged: 1, failed: 0 });
        assert!(h.metadata.find("bbbbb1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn started_sweeper_purges_and_stops() {
        let h = Harness::new().await;
        let receipt = ingest_bytes(&h.service, b"short lived", UploadOptions {
            name: "tmp.txt".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        h.clock.advance(Duration::from_secs(3600));

        let handle = Arc::new(sweeper_for(&h)).start();
        for _ in 0..100 {
            if h.metadata.find(&receipt.id).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;

        assert!(h.metadata.find(&receipt.id).await.unwrap().is_none());
        assert!(!h.blobs.exists(&receipt.id).await.unwrap());
    }
}
