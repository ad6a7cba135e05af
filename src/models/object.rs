//! Represents a stored object (file) and the values exchanged with the
//! ingest and retrieval pipelines.

use bytes::Bytes;
use serde::Serialize;
use sqlx::FromRow;
use tokio::fs::File;

/// Fallback MIME type for missing or unsafe content types.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Metadata row describing a single blob.
///
/// Records are immutable once committed; the only mutation is deletion.
/// The payload bytes live in the blob store under the same `id`.
#[derive(Clone, FromRow, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Short identifier drawn from the configured alphabet.
    pub id: String,

    /// Upload time in epoch milliseconds.
    pub uploaded_at: i64,

    /// Expiry time in epoch milliseconds; always later than `uploaded_at`.
    pub expire_at: i64,

    /// Capability required to delete the object.
    pub management_token: String,

    /// Display filename. Never used to address storage.
    pub name: String,

    /// Sanitized MIME type.
    pub content_type: String,

    /// Whether the object is removed after its first successful retrieval.
    pub is_disposable: bool,

    /// Whether the payload is opaque to the server (no conversion allowed).
    pub is_encrypted: bool,
}

impl ObjectRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_at <= now_ms
    }
}

/// Caller-supplied attributes for a new upload.
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    pub name: String,
    pub content_type: Option<String>,
    pub is_disposable: bool,
    pub is_encrypted: bool,
    /// Length announced by the transport, checked before any bytes are written.
    pub declared_length: Option<u64>,
}

/// Result of a successful ingest. The token is never returned again.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub id: String,
    pub sha256: String,
    pub management_token: String,
    pub size: u64,
}

/// Non-consuming view of an object.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub is_encrypted: bool,
    pub is_disposable: bool,
    pub expire_at: chrono::DateTime<chrono::Utc>,
}

/// Payload handed back by the retrieval pipeline.
#[derive(Debug)]
pub enum ObjectBody {
    /// Raw blob, streamed straight from disk.
    File(File),
    /// Converted rendition held in memory.
    Bytes(Bytes),
}

#[derive(Debug)]
pub struct RetrievedObject {
    pub name: String,
    pub content_type: String,
    pub is_encrypted: bool,
    pub size: u64,
    pub body: ObjectBody,
}

/// Normalize a client-supplied content type.
///
/// Multipart and message types are coerced to `application/octet-stream` so a
/// browser never interprets a stored payload as a structured document.
pub fn sanitize_content_type(raw: Option<&str>) -> String {
    let Some(value) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return OCTET_STREAM.to_string();
    };
    if !value.bytes().all(|b| b == b'\t' || (0x20..0x7f).contains(&b)) {
        return OCTET_STREAM.to_string();
    }
    let essence = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence.starts_with("multipart/") || essence.starts_with("message/") {
        return OCTET_STREAM.to_string();
    }
    value.to_string()
}

/// Reduce a client-supplied filename to its last path component.
pub fn display_name(raw: &str) -> String {
    raw.rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw)
        .trim()
        .to_string()
}
