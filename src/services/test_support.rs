//! Shared fixtures for service tests.

use super::{
    blob_store::BlobStore,
    clock::ManualClock,
    conversion::{ConversionCache, Transcoder},
    error::StorageResult,
    id_allocator::IdAllocator,
    metadata_store::SqliteMetadataStore,
    storage_service::{IngestLimits, StorageService},
};
use crate::models::{
    format::TargetFormat,
    object::{IngestReceipt, ObjectBody, ObjectRecord, UploadOptions},
};
use bytes::Bytes;
use futures::stream;
use image::{ImageFormat, Rgba, RgbaImage};
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

pub const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
pub const START_MS: i64 = 1_700_000_000_000;

pub async fn memory_store() -> SqliteMetadataStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    let store = SqliteMetadataStore::new(Arc::new(pool));
    store.migrate().await.expect("migrate");
    store
}

pub fn record(id: &str, uploaded_at: i64, expire_at: i64) -> ObjectRecord {
    ObjectRecord {
        id: id.to_string(),
        uploaded_at,
        expire_at,
        management_token: format!("token-{}", id),
        name: format!("{}.bin", id),
        content_type: "application/octet-stream".into(),
        is_disposable: false,
        is_encrypted: false,
    }
}

/// A small valid PNG.
pub fn png_bytes() -> Bytes {
    let image = RgbaImage::from_pixel(4, 4, Rgba([200, 30, 30, 128]));
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("encode png");
    Bytes::from(out)
}

/// Records how often it runs; emits a tagged copy of its input.
#[derive(Default)]
pub struct CountingTranscoder {
    calls: AtomicUsize,
}

impl CountingTranscoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transcoder for CountingTranscoder {
    fn transcode(&self, source: &[u8], format: TargetFormat) -> StorageResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = format.extension().as_bytes().to_vec();
        out.extend_from_slice(source);
        Ok(out)
    }
}

pub async fn ingest_bytes(
    service: &StorageService,
    payload: &[u8],
    options: UploadOptions,
) -> StorageResult<IngestReceipt> {
    let chunk = Bytes::copy_from_slice(payload);
    service
        .ingest(stream::iter(vec![Ok(chunk)]), options)
        .await
}

pub async fn body_bytes(body: ObjectBody) -> Vec<u8> {
    match body {
        ObjectBody::Bytes(bytes) => bytes.to_vec(),
        ObjectBody::File(mut file) => {
            let mut out = Vec::new();
            file.read_to_end(&mut out).await.expect("read body");
            out
        }
    }
}

/// A fully wired service over temp directories and in-memory SQLite.
pub struct Harness {
    pub service: StorageService,
    pub metadata: Arc<SqliteMetadataStore>,
    pub blobs: BlobStore,
    pub cache: ConversionCache,
    pub clock: Arc<ManualClock>,
    pub transcoder: Arc<CountingTranscoder>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_max_upload(1024 * 1024).await
    }

    pub async fn with_max_upload(max_upload_size: u64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let uploads = dir.path().join("uploads");
        let converted = dir.path().join("cache");
        std::fs::create_dir_all(&uploads).expect("uploads dir");
        std::fs::create_dir_all(&converted).expect("cache dir");

        let metadata = Arc::new(memory_store().await);
        let blobs = BlobStore::new(uploads);
        let transcoder = Arc::new(CountingTranscoder::default());
        let cache = ConversionCache::new(converted, 1024 * 1024, max_upload_size, transcoder.clone());
        let clock = Arc::new(ManualClock::new(START_MS));
        let service = StorageService::new(
            metadata.clone(),
            blobs.clone(),
            cache.clone(),
            IdAllocator::new(ALPHABET, 6),
            clock.clone(),
            IngestLimits {
                ttl: Duration::from_secs(3600),
                max_upload_size,
            },
        );

        Self {
            service,
            metadata,
            blobs,
            cache,
            clock,
            transcoder,
            _dir: dir,
        }
    }
}
