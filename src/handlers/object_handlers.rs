//! HTTP handlers for uploads, downloads and object management.
//! Bodies are streamed in both directions; storage concerns live in
//! `StorageService`.

use crate::{
    errors::AppError,
    models::{
        format::TargetFormat,
        object::{ObjectBody, RetrievedObject, UploadOptions, display_name},
    },
    services::storage_service::StorageService,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, io};
use tokio_util::io::ReaderStream;
use tracing::warn;

pub const MANAGEMENT_TOKEN_HEADER: &str = "x-management-token";
pub const CONTENT_SHA256_HEADER: &str = "x-content-sha256";
pub const FILE_NAME_HEADER: &str = "x-file-name";
pub const ENCRYPTED_HEADER: &str = "x-encrypted";

/// JSON carried in the `options` part of a multipart upload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartOptions {
    pub name: String,
    pub content_type: Option<String>,
    #[serde(default)]
    pub is_disposable: bool,
    #[serde(default)]
    pub is_encrypted: bool,
}

/// Query accepted by `GET /api/file/{id}`.
#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    pub conv: Option<String>,
}

/// `PUT /{file_name}`: raw-body upload.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path(file_name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    upload_raw(service, file_name, headers, body, false).await
}

/// `PUT /d/{file_name}`: raw-body upload consumed by its first download.
pub async fn upload_disposable_object(
    State(service): State<StorageService>,
    Path(file_name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    upload_raw(service, file_name, headers, body, true).await
}

async fn upload_raw(
    service: StorageService,
    file_name: String,
    headers: HeaderMap,
    body: Body,
    is_disposable: bool,
) -> Result<Response, AppError> {
    let declared_length = match headers.get(header::CONTENT_LENGTH) {
        None => {
            return Err(AppError::new(
                StatusCode::LENGTH_REQUIRED,
                "Content-Length header is required",
            ));
        }
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| AppError::bad_request("invalid Content-Length header"))?,
    };
    let host = header_str(&headers, header::HOST.as_str())
        .ok_or_else(|| AppError::bad_request("Host header is required"))?
        .to_string();

    let name = display_name(&file_name);
    let options = UploadOptions {
        name: name.clone(),
        content_type: header_str(&headers, header::CONTENT_TYPE.as_str()).map(str::to_string),
        is_disposable,
        is_encrypted: false,
        declared_length: Some(declared_length),
    };

    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    let receipt = service.ingest(stream, options).await?;

    let url = format!(
        "https://{}/{}/{}\n",
        host,
        receipt.id,
        urlencoding::encode(&name)
    );
    let mut response = (StatusCode::OK, url).into_response();
    let headers = response.headers_mut();
    insert_header(headers, MANAGEMENT_TOKEN_HEADER, &receipt.management_token);
    insert_header(headers, CONTENT_SHA256_HEADER, &receipt.sha256);
    Ok(response)
}

/// `POST /api/file/upload`: multipart upload with an `options` part
/// followed by the `file` part.
pub async fn upload_multipart(
    State(service): State<StorageService>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut options: Option<MultipartOptions> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        let part = field.name().unwrap_or_default().to_string();
        match part.as_str() {
            "options" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(format!("unreadable options: {}", e)))?;
                let parsed = serde_json::from_str::<MultipartOptions>(&text)
                    .map_err(|e| AppError::bad_request(format!("invalid options: {}", e)))?;
                options = Some(parsed);
            }
            "file" => {
                let opts = options
                    .take()
                    .ok_or_else(|| AppError::bad_request("options part must precede file part"))?;
                let upload = UploadOptions {
                    name: opts.name,
                    content_type: opts.content_type,
                    is_disposable: opts.is_disposable,
                    is_encrypted: opts.is_encrypted,
                    declared_length: None,
                };
                let stream = field.map(|chunk| chunk.map_err(io::Error::other));
                let receipt = service.ingest(stream, upload).await?;
                return Ok((StatusCode::OK, Json(receipt)).into_response());
            }
            other => warn!("ignoring unexpected multipart part {:?}", other),
        }
    }

    Err(AppError::bad_request("missing file part"))
}

/// `GET /{id}`: inline download. Bare `?jpeg`, `?jpg` or `?png` flags ask
/// for a converted rendition.
pub async fn download_object(
    State(service): State<StorageService>,
    Path(id): Path<String>,
    Query(flags): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let format = TargetFormat::from_flags(flags.keys().map(String::as_str));
    let object = service.retrieve(&id, format).await?;
    Ok(file_response(object, None))
}

/// `GET /{id}/{file_name}`: download as an attachment named `file_name`.
pub async fn download_object_as(
    State(service): State<StorageService>,
    Path((id, file_name)): Path<(String, String)>,
    Query(flags): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let format = TargetFormat::from_flags(flags.keys().map(String::as_str));
    let object = service.retrieve(&id, format).await?;
    Ok(file_response(object, Some(&file_name)))
}

/// `GET /api/file/{id}?conv=`: raw bytes with the stored attributes in
/// response headers.
pub async fn fetch_object(
    State(service): State<StorageService>,
    Path(id): Path<String>,
    Query(q): Query<FetchQuery>,
) -> Result<Response, AppError> {
    let format = q.conv.as_deref().and_then(TargetFormat::parse);
    let object = service.retrieve(&id, format).await?;

    let name = match format {
        Some(format) => rendition_name(&object.name, format),
        None => object.name.clone(),
    };
    let encrypted = object.is_encrypted;
    let mut response = body_response(object);
    let headers = response.headers_mut();
    insert_header(headers, FILE_NAME_HEADER, &urlencoding::encode(&name));
    insert_header(headers, ENCRYPTED_HEADER, if encrypted { "true" } else { "false" });
    Ok(response)
}

/// `GET /api/file/{id}/info`
pub async fn object_info(
    State(service): State<StorageService>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let info = service.info(&id).await?;
    Ok(Json(info).into_response())
}

/// `GET /api/file/{id}/verify`: whether the management token matches.
pub async fn verify_object(
    State(service): State<StorageService>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let token = management_token(&headers)?;
    let exists = service.verify(&id, token).await?;
    Ok(Json(json!({ "exists": exists })).into_response())
}

/// `DELETE /api/file/{id}`
pub async fn delete_object(
    State(service): State<StorageService>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let token = management_token(&headers)?;
    service.delete_by_token(&id, token).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn management_token(headers: &HeaderMap) -> Result<&str, AppError> {
    header_str(headers, MANAGEMENT_TOKEN_HEADER)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::bad_request("X-Management-Token header is required"))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Downloaded renditions carry the extension of the format they were
/// converted to.
fn rendition_name(name: &str, format: TargetFormat) -> String {
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    format!("{}.{}", stem, format.extension())
}

fn file_response(object: RetrievedObject, attachment: Option<&str>) -> Response {
    let disposition = match attachment {
        Some(file_name) => format!(
            "attachment; filename*=UTF-8''{}",
            urlencoding::encode(file_name)
        ),
        None => "inline".to_string(),
    };
    let mut response = body_response(object);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

fn body_response(object: RetrievedObject) -> Response {
    let body = match object.body {
        ObjectBody::File(file) => Body::from_stream(ReaderStream::new(file)),
        ObjectBody::Bytes(bytes) => Body::from(bytes),
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendition_names_swap_the_extension() {
        assert_eq!(rendition_name("cat.webp", TargetFormat::Png), "cat.png");
        assert_eq!(rendition_name("cat", TargetFormat::Jpeg), "cat.jpeg");
        assert_eq!(rendition_name(".hidden", TargetFormat::Png), ".hidden.png");
        assert_eq!(rendition_name("a.b.gif", TargetFormat::Jpeg), "a.b.jpeg");
    }

    #[test]
    fn multipart_options_default_flags() {
        let opts: MultipartOptions = serde_json::from_str(r#"{"name":"a.txt"}"#).unwrap();
        assert_eq!(opts.name, "a.txt");
        assert!(opts.content_type.is_none());
        assert!(!opts.is_disposable && !opts.is_encrypted);

        let opts: MultipartOptions = serde_json::from_str(
            r#"{"name":"b.bin","contentType":"image/png","isDisposable":true,"isEncrypted":true}"#,
        )
        .unwrap();
        assert_eq!(opts.content_type.as_deref(), Some("image/png"));
        assert!(opts.is_disposable && opts.is_encrypted);
    }
}
