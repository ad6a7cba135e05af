//! Derived renditions of blobs, cached at `<cache-dir>/<id>.<ext>`.
//!
//! An artifact is produced at most once per `(id, format)` while its object
//! lives. Disposable objects are converted but never cached: the source read
//! consumes the object, so a cached copy would outlive it.

use super::error::{StorageError, StorageResult};
use crate::models::format::TargetFormat;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, codecs::jpeg::JpegEncoder};
use std::{
    future::Future,
    io::{Cursor, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const JPEG_QUALITY: u8 = 95;

/// Prefix of in-progress artifact writes.
const TEMP_PREFIX: &str = ".tmp-";

/// CPU-bound format conversion. Runs on the blocking pool.
pub trait Transcoder: Send + Sync + 'static {
    fn transcode(&self, source: &[u8], format: TargetFormat) -> StorageResult<Vec<u8>>;
}

/// Re-encodes raster images with the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageTranscoder;

impl Transcoder for ImageTranscoder {
    fn transcode(&self, source: &[u8], format: TargetFormat) -> StorageResult<Vec<u8>> {
        let decoded = image::load_from_memory(source)
            .map_err(|err| StorageError::Conversion(err.to_string()))?;

        let mut out = Vec::new();
        let encoded = match format {
            TargetFormat::Jpeg => {
                // JPEG has no alpha channel.
                let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
                rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))
            }
            TargetFormat::Png => decoded.write_to(&mut Cursor::new(&mut out), ImageFormat::Png),
        };
        encoded.map_err(|err| StorageError::Conversion(err.to_string()))?;
        Ok(out)
    }
}

#[derive(Clone)]
pub struct ConversionCache {
    base_path: PathBuf,
    max_source_size: u64,
    max_artifact_size: u64,
    transcoder: Arc<dyn Transcoder>,
}

impl ConversionCache {
    pub fn new(
        base_path: impl Into<PathBuf>,
        max_source_size: u64,
        max_artifact_size: u64,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            max_source_size,
            max_artifact_size,
            transcoder,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn max_source_size(&self) -> u64 {
        self.max_source_size
    }

    fn artifact_path(&self, id: &str, format: TargetFormat) -> PathBuf {
        self.base_path.join(format!("{}.{}", id, format.extension()))
    }

    /// Return the `format` rendition of `id`, converting on a cache miss.
    ///
    /// `source` is invoked only on a miss. When `cacheable` is false the
    /// cache is neither consulted nor written.
    pub async fn get_or_create<F, Fut>(
        &self,
        id: &str,
        format: TargetFormat,
        cacheable: bool,
        source: F,
    ) -> StorageResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<Bytes>>,
    {
        let path = self.artifact_path(id, format);
        if cacheable {
            match fs::read(&path).await {
                Ok(cached) => {
                    debug!("conversion cache hit for {}.{}", id, format);
                    return Ok(Bytes::from(cached));
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        let original = source().await?;
        let size = original.len() as u64;
        if size > self.max_source_size {
            return Err(StorageError::PayloadTooLarge {
                size,
                limit: self.max_source_size,
            });
        }
        if !infer::is_image(&original) {
            let detected = infer::get(&original)
                .map(|kind| kind.mime_type())
                .unwrap_or("application/octet-stream");
            return Err(StorageError::UnsupportedMediaType(detected.to_string()));
        }

        let transcoder = Arc::clone(&self.transcoder);
        let converted = tokio::task::spawn_blocking(move || transcoder.transcode(&original, format))
            .await
            .map_err(|err| StorageError::Conversion(err.to_string()))??;
        let converted = Bytes::from(converted);

        if cacheable && converted.len() as u64 <= self.max_artifact_size {
            if let Err(err) = self.persist(&path, &converted).await {
                warn!("failed to cache {}.{}: {}", id, format, err);
            }
        }
        Ok(converted)
    }

    /// Write through a hidden temp file and rename, so readers never see a
    /// half-written artifact.
    async fn persist(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let tmp_path = self.base_path.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let written = async {
            let mut file = options.open(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        Ok(())
    }

    /// Remove every rendition of `id`. Missing artifacts are not an error.
    pub async fn delete_all(&self, id: &str) -> StorageResult<usize> {
        let mut removed = 0;
        for format in TargetFormat::ALL {
            let path = self.artifact_path(id, format);
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("removed artifact {}", path.display());
                    removed += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
        Ok(removed)
    }

    pub async fn has_any(&self, id: &str) -> StorageResult<bool> {
        for format in TargetFormat::ALL {
            if fs::try_exists(self.artifact_path(id, format)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove temp files left behind by interrupted writes. Files younger
    /// than `min_age` may belong to a write still in progress and are kept.
    pub async fn remove_stale_temp_files(&self, min_age: Duration) -> StorageResult<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_str().is_some_and(|n| n.starts_with(TEMP_PREFIX)) {
                continue;
            }
            if !min_age.is_zero() {
                let modified = entry.metadata().await?.modified()?;
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or_default();
                if age < min_age {
                    continue;
                }
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!("removed stale temp file {}", entry.path().display());
                    removed += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
        Ok(removed)
    }

    /// Ids that own at least one artifact.
    pub async fn list_ids(&self) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some((id, ext)) = name.rsplit_once('.') {
                if TargetFormat::from_extension(ext).is_some() && !ids.iter().any(|i| i == id) {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{CountingTranscoder, png_bytes};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_with(dir: &Path, transcoder: Arc<dyn Transcoder>) -> ConversionCache {
        ConversionCache::new(dir, 1024 * 1024, 1024 * 1024, transcoder)
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Arc::new(CountingTranscoder::default());
        let cache = cache_with(dir.path(), transcoder.clone());
        let source_calls = AtomicUsize::new(0);
        let png = png_bytes();

        let mut outputs = Vec::new();
        for _ in 0..3 {
            let out = cache
                .get_or_create("img001", TargetFormat::Jpeg, true, || async {
                    source_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(png.clone())
                })
                .await
                .unwrap();
            outputs.push(out);
        }

        assert_eq!(transcoder.calls(), 1);
        assert_eq!(source_calls.load(Ordering::SeqCst), 1);
        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
        assert!(dir.path().join("img001.jpeg").exists());
    }

    #[tokio::test]
    async fn uncacheable_conversions_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Arc::new(CountingTranscoder::default());
        let cache = cache_with(dir.path(), transcoder.clone());
        let png = png_bytes();

        for _ in 0..2 {
            cache
                .get_or_create("once01", TargetFormat::Png, false, || async { Ok(png.clone()) })
                .await
                .unwrap();
        }

        assert_eq!(transcoder.calls(), 2);
        assert!(!cache.has_any("once01").await.unwrap());
    }

    #[tokio::test]
    async fn oversized_sources_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Arc::new(CountingTranscoder::default());
        let cache = ConversionCache::new(dir.path(), 16, 1024, transcoder.clone());

        let err = cache
            .get_or_create("huge01", TargetFormat::Jpeg, true, || async {
                Ok(png_bytes())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::PayloadTooLarge { limit: 16, .. }));
        assert_eq!(transcoder.calls(), 0);
    }

    #[tokio::test]
    async fn non_images_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(dir.path(), Arc::new(ImageTranscoder));

        let err = cache
            .get_or_create("text01", TargetFormat::Png, true, || async {
                Ok(Bytes::from_static(b"just some text"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::UnsupportedMediaType(_)));
    }

    #[tokio::test]
    async fn image_transcoder_produces_requested_formats() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(dir.path(), Arc::new(ImageTranscoder));
        let png = png_bytes();

        let jpeg = cache
            .get_or_create("photo1", TargetFormat::Jpeg, true, || async { Ok(png.clone()) })
            .await
            .unwrap();
        assert!(infer::image::is_jpeg(&jpeg));

        let again = cache
            .get_or_create("photo1", TargetFormat::Png, true, || async { Ok(jpeg.clone()) })
            .await
            .unwrap();
        assert!(infer::image::is_png(&again));
    }

    #[tokio::test]
    async fn delete_all_removes_every_format() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(dir.path(), Arc::new(ImageTranscoder));
        std::fs::write(dir.path().join("gone01.jpeg"), b"j").unwrap();
        std::fs::write(dir.path().join("gone01.png"), b"p").unwrap();
        std::fs::write(dir.path().join(".tmp-leftover"), b"t").unwrap();

        assert_eq!(cache.list_ids().await.unwrap(), vec!["gone01".to_string()]);
        assert_eq!(cache.delete_all("gone01").await.unwrap(), 2);
        assert_eq!(cache.delete_all("gone01").await.unwrap(), 0);
        assert!(cache.list_ids().await.unwrap().is_empty());
    }
}
