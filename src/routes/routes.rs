//! Defines routes for uploads, downloads and object management.
//!
//! ## Structure
//! - **Short links**
//!   - `PUT    /{file_name}`: raw-body upload
//!   - `PUT    /d/{file_name}`: raw-body upload, disposable
//!   - `GET    /{id}`: inline download (`?jpeg`, `?jpg`, `?png` convert)
//!   - `GET    /{id}/{file_name}`: download as attachment
//!
//! - **API endpoints**
//!   - `POST   /api/file/upload`: multipart upload
//!   - `GET    /api/file/{id}`: raw bytes plus attribute headers (`?conv=`)
//!   - `GET    /api/file/{id}/info`: metadata, does not consume
//!   - `GET    /api/file/{id}/verify`: management token check
//!   - `DELETE /api/file/{id}`: delete with management token
//!
//! The first path segment shares the `{id}` name across methods because the
//! router requires one name per position; `PUT /{id}` reads it as a file name.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            delete_object, download_object, download_object_as, fetch_object, object_info,
            upload_disposable_object, upload_multipart, upload_object, verify_object,
        },
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build and return the router for all routes.
///
/// The request body limit is disabled; the ingest pipeline enforces the
/// configured upload ceiling while streaming.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // API routes
        .route("/api/file/upload", post(upload_multipart))
        .route("/api/file/{id}", get(fetch_object).delete(delete_object))
        .route("/api/file/{id}/info", get(object_info))
        .route("/api/file/{id}/verify", get(verify_object))
        // Short links
        .route("/d/{file_name}", put(upload_disposable_object))
        .route("/{id}", put(upload_object).get(download_object))
        .route("/{id}/{file_name}", get(download_object_as))
        .layer(DefaultBodyLimit::disable())
}
