//! On-disk payload storage: one file per object at `<upload-dir>/<id>`.
//!
//! Writes go through an exclusive-create reservation so that reserving an id
//! and checking it is free are the same atomic step. The SHA-256 digest is
//! computed while streaming, so the payload is never buffered or re-read.

use super::error::{StorageError, StorageResult};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::debug;

/// An id whose blob file has been exclusively created but not yet filled.
///
/// If a reservation is dropped without being passed to [`BlobStore::create`],
/// the empty file stays behind and is later removed by the reconciler.
#[derive(Debug)]
pub struct BlobReservation {
    id: String,
    path: PathBuf,
    file: File,
}

impl BlobReservation {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBlob {
    pub size: u64,
    pub sha256: String,
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.base_path.join(id)
    }

    /// Exclusively create the blob file for `id` with owner-only permissions.
    ///
    /// Returns `None` when a blob for `id` already exists.
    pub async fn reserve(&self, id: &str) -> StorageResult<Option<BlobReservation>> {
        let path = self.blob_path(id);
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        match options.open(&path).await {
            Ok(file) => Ok(Some(BlobReservation {
                id: id.to_string(),
                path,
                file,
            })),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Stream `stream` into a reserved blob, hashing as it goes.
    ///
    /// Fails with `PayloadTooLarge` as soon as more than `limit` bytes arrive.
    /// On any failure the partial file is removed before the error is returned.
    pub async fn create<S>(
        &self,
        reservation: BlobReservation,
        stream: S,
        limit: u64,
    ) -> StorageResult<WrittenBlob>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let BlobReservation { id, path, mut file } = reservation;
        match write_hashed(&mut file, stream, limit).await {
            Ok(written) => {
                debug!("wrote blob {} ({} bytes)", id, written.size);
                Ok(written)
            }
            Err(err) => {
                drop(file);
                if let Err(rm_err) = fs::remove_file(&path).await {
                    if rm_err.kind() != ErrorKind::NotFound {
                        debug!("failed to remove partial blob {}: {}", path.display(), rm_err);
                    }
                }
                Err(err)
            }
        }
    }

    /// Open a blob for streaming.
    pub async fn open(&self, id: &str) -> StorageResult<File> {
        File::open(self.blob_path(id))
            .await
            .map_err(|err| not_found_or_io(err, id))
    }

    /// Read a whole blob into memory, refusing blobs larger than `limit`.
    pub async fn read(&self, id: &str, limit: u64) -> StorageResult<Bytes> {
        let path = self.blob_path(id);
        let size = fs::metadata(&path)
            .await
            .map_err(|err| not_found_or_io(err, id))?
            .len();
        if size > limit {
            return Err(StorageError::PayloadTooLarge { size, limit });
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|err| not_found_or_io(err, id))?;
        Ok(Bytes::from(bytes))
    }

    /// Remove a blob. Absence is not an error; returns whether a file was removed.
    pub async fn delete(&self, id: &str) -> StorageResult<bool> {
        let path = self.blob_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("removed blob {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    pub async fn exists(&self, id: &str) -> StorageResult<bool> {
        Ok(fs::try_exists(self.blob_path(id)).await?)
    }

    /// Time since the blob was last written, or `None` if it is gone.
    pub async fn age(&self, id: &str) -> StorageResult<Option<Duration>> {
        match fs::metadata(self.blob_path(id)).await {
            Ok(meta) => {
                let modified = meta.modified()?;
                Ok(Some(modified.elapsed().unwrap_or_default()))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Ids of every blob on disk. Hidden entries and directories are skipped.
    pub async fn list_ids(&self) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }
}

async fn write_hashed<S>(file: &mut File, stream: S, limit: u64) -> StorageResult<WrittenBlob>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    pin_mut!(stream);
    let mut digest = Sha256::new();
    let mut size: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        if size > limit {
            return Err(StorageError::PayloadTooLarge { size, limit });
        }
        digest.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(WrittenBlob {
        size,
        sha256: hex::encode(digest.finalize()),
    })
}

fn not_found_or_io(err: io::Error, id: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(id.to_string())
    } else {
        StorageError::Io(err)
    }
}
