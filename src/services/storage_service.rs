//! src/services/storage_service.rs
//!
//! StorageService: ingest and retrieval pipelines over the blob store
//! (local disk, one file per id) and the metadata store (SQLite). The two
//! stores are written in two phases and are not transactional together; the
//! reconciler closes the gap after a crash.

use super::{
    blob_store::BlobStore,
    clock::Clock,
    conversion::ConversionCache,
    error::{StorageError, StorageResult},
    id_allocator::IdAllocator,
    metadata_store::MetadataStore,
};
use crate::models::{
    format::TargetFormat,
    object::{
        IngestReceipt, ObjectBody, ObjectInfo, ObjectRecord, RetrievedObject, UploadOptions,
        display_name, sanitize_content_type,
    },
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use rand::{RngCore, rngs::OsRng};
use std::{io, sync::Arc, time::Duration};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

const MANAGEMENT_TOKEN_BYTES: usize = 32;

/// Ceilings applied by the ingest pipeline.
#[derive(Clone, Copy, Debug)]
pub struct IngestLimits {
    pub ttl: Duration,
    pub max_upload_size: u64,
}

/// StorageService provides the object lifecycle operations:
/// - Ingest (reserve id, stream blob with hashing, commit record)
/// - Retrieve (optionally converted; consumes disposable objects)
/// - Delete with a management token
/// - Verify a token and read metadata without consuming
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct StorageService {
    metadata: Arc<dyn MetadataStore>,
    blobs: BlobStore,
    cache: ConversionCache,
    allocator: IdAllocator,
    clock: Arc<dyn Clock>,
    limits: IngestLimits,
}

impl StorageService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: BlobStore,
        cache: ConversionCache,
        allocator: IdAllocator,
        clock: Arc<dyn Clock>,
        limits: IngestLimits,
    ) -> Self {
        Self {
            metadata,
            blobs,
            cache,
            allocator,
            clock,
            limits,
        }
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Externally supplied ids never reach the filesystem unless they match
    /// the allocator's alphabet and length.
    fn ensure_id_valid(&self, id: &str) -> StorageResult<()> {
        if self.allocator.is_valid(id) {
            Ok(())
        } else {
            Err(StorageError::NotFound(id.to_string()))
        }
    }

    /// `uploaded_at + ttl` in epoch milliseconds, without wrapping.
    fn expiry_for(&self, uploaded_at: i64) -> StorageResult<i64> {
        i64::try_from(self.limits.ttl.as_millis())
            .ok()
            .and_then(|ttl| uploaded_at.checked_add(ttl))
            .ok_or(StorageError::TtlOutOfRange(self.limits.ttl))
    }

    /// Look up a record that is present and not yet expired.
    async fn live_record(&self, id: &str) -> StorageResult<ObjectRecord> {
        self.ensure_id_valid(id)?;
        match self.metadata.find(id).await? {
            Some(record) if !record.is_expired(self.clock.now_ms()) => Ok(record),
            _ => Err(StorageError::NotFound(id.to_string())),
        }
    }

    /// Stream a new object to disk and commit its record.
    ///
    /// - Rejects a declared length of zero or above the upload ceiling before
    ///   anything is written.
    /// - Reserves an id with an exclusive create, then hashes while writing.
    /// - Rejects empty payloads and payloads that differ from the declared
    ///   length, removing the blob.
    ///
    /// A failed metadata commit leaves the blob behind for the reconciler.
    pub async fn ingest<S>(&self, stream: S, options: UploadOptions) -> StorageResult<IngestReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let limit = self.limits.max_upload_size;
        match options.declared_length {
            Some(0) => return Err(StorageError::BadRequest("empty payload".into())),
            Some(size) if size > limit => {
                return Err(StorageError::PayloadTooLarge { size, limit });
            }
            _ => {}
        }
        let name = display_name(&options.name);
        if name.is_empty() {
            return Err(StorageError::BadRequest("file name must not be empty".into()));
        }
        // Refuse before touching disk if the ttl cannot produce an expiry.
        self.expiry_for(self.clock.now_ms())?;

        let reservation = self
            .allocator
            .allocate(&self.blobs, &self.cache, self.metadata.as_ref())
            .await?;
        let id = reservation.id().to_string();
        let written = self.blobs.create(reservation, stream, limit).await?;

        let mismatch = match options.declared_length {
            _ if written.size == 0 => Some("empty payload".to_string()),
            Some(declared) if declared != written.size => Some(format!(
                "declared {} bytes but received {}",
                declared, written.size
            )),
            _ => None,
        };
        if let Some(reason) = mismatch {
            self.blobs.delete(&id).await?;
            return Err(StorageError::BadRequest(reason));
        }

        let uploaded_at = self.clock.now_ms();
        let expire_at = match self.expiry_for(uploaded_at) {
            Ok(expire_at) => expire_at,
            Err(err) => {
                self.blobs.delete(&id).await?;
                return Err(err);
            }
        };
        let record = ObjectRecord {
            id: id.clone(),
            uploaded_at,
            expire_at,
            management_token: generate_management_token(),
            name,
            content_type: sanitize_content_type(options.content_type.as_deref()),
            is_disposable: options.is_disposable,
            is_encrypted: options.is_encrypted,
        };
        if let Err(err) = self.metadata.create(&record).await {
            warn!(
                "metadata commit failed for {}; blob left for reconciliation: {}",
                id, err
            );
            return Err(err);
        }

        info!(
            "File \"{}\" uploaded as \"{}\" with hash \"{}\" ({} bytes, disposable={})",
            record.name, id, written.sha256, written.size, record.is_disposable
        );

        Ok(IngestReceipt {
            id,
            sha256: written.sha256,
            management_token: record.management_token,
            size: written.size,
        })
    }

    /// Fetch an object, converting it when `format` is set.
    ///
    /// Disposable objects are claimed by deleting their record first; only the
    /// caller whose delete removed the row proceeds, every other caller sees
    /// `NotFound`. The blob is then removed as part of the same call.
    pub async fn retrieve(
        &self,
        id: &str,
        format: Option<TargetFormat>,
    ) -> StorageResult<RetrievedObject> {
        let record = self.live_record(id).await?;
        if record.is_encrypted && format.is_some() {
            return Err(StorageError::BadRequest(
                "encrypted objects cannot be converted".into(),
            ));
        }

        let disposable = record.is_disposable;
        if disposable && !self.metadata.delete(id).await? {
            return Err(StorageError::NotFound(id.to_string()));
        }

        let (content_type, body, size) = match format {
            None => {
                let file = self.blobs.open(id).await.inspect_err(|err| {
                    if matches!(err, StorageError::NotFound(_)) {
                        warn!("record {} has no blob on disk", id);
                    }
                })?;
                let size = file.metadata().await?.len();
                if disposable {
                    // The open handle keeps the content readable after unlink.
                    self.blobs.delete(id).await?;
                }
                (record.content_type, ObjectBody::File(file), size)
            }
            Some(format) => {
                let blobs = &self.blobs;
                let limit = self.cache.max_source_size();
                let converted = self
                    .cache
                    .get_or_create(id, format, !disposable, || async move {
                        let source = blobs.read(id, limit).await;
                        if disposable {
                            blobs.delete(id).await?;
                        }
                        source
                    })
                    .await?;
                // A delete or sweep that ran during the conversion has already
                // cleared the cache; drop the artifact written after it.
                if !disposable && self.metadata.find(id).await?.is_none() {
                    warn!("object {} removed during conversion; dropping artifacts", id);
                    self.cache.delete_all(id).await?;
                }
                let size = converted.len() as u64;
                (
                    format.mime_type().to_string(),
                    ObjectBody::Bytes(converted),
                    size,
                )
            }
        };

        info!(
            "File \"{}\" downloaded{}",
            id,
            format.map(|f| format!(" as {}", f)).unwrap_or_default()
        );

        Ok(RetrievedObject {
            name: record.name,
            content_type,
            is_encrypted: record.is_encrypted,
            size,
            body,
        })
    }

    /// Delete an object with its management token.
    ///
    /// The record goes first so new lookups fail immediately; artifacts and
    /// the blob follow. Missing pieces are ignored.
    pub async fn delete_by_token(&self, id: &str, token: &str) -> StorageResult<()> {
        let record = self.live_record(id).await?;
        if !tokens_match(&record.management_token, token) {
            return Err(StorageError::Forbidden(id.to_string()));
        }

        self.metadata.delete(id).await?;
        self.cache.delete_all(id).await?;
        self.blobs.delete(id).await?;

        info!("File \"{}\" deleted by its owner", id);
        Ok(())
    }

    /// Whether `token` is the management token of a live object.
    pub async fn verify(&self, id: &str, token: &str) -> StorageResult<bool> {
        match self.live_record(id).await {
            Ok(record) => Ok(tokens_match(&record.management_token, token)),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Metadata for a live object. Does not consume disposable objects.
    pub async fn info(&self, id: &str) -> StorageResult<ObjectInfo> {
        let record = self.live_record(id).await?;
        Ok(ObjectInfo {
            expire_at: DateTime::<Utc>::from_timestamp_millis(record.expire_at)
                .unwrap_or_default(),
            id: record.id,
            name: record.name,
            content_type: record.content_type,
            is_encrypted: record.is_encrypted,
            is_disposable: record.is_disposable,
        })
    }
}

fn generate_management_token() -> String {
    let mut raw = [0u8; MANAGEMENT_TOKEN_BYTES];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

fn tokens_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}
