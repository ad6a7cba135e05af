use std::{io, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("management token does not match object `{0}`")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("content of type `{0}` cannot be converted")]
    UnsupportedMediaType(String),
    #[error("conversion failed: {0}")]
    Conversion(String),
    #[error("no free identifier found after {0} attempts")]
    IdSpaceExhausted(usize),
    #[error("ttl of {0:?} does not fit the expiry timestamp")]
    TtlOutOfRange(Duration),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
