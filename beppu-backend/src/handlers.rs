use axum::{
    body::Body,
    extract::{Form, Multipart, Path, Query, State},
    http::{header, HeaderMap, Response, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast;

use crate::{
    auth::{AccessScope, Credentials},
    error::{AppError, Result},
    gate::{DownloadBody, FileRef, GrantedDownload},
    processor::FinalizeOptions,
    AppState,
};
use beppu_entity::file;
use beppu_types::{
    human_size, ChunkUploadResponse, CompleteUploadRequest, CompleteUploadResponse, FileApiOutput,
    FileListResponse, PasswordSubmission,
};

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub id: String,
}

// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "beppu-backend",
        "timestamp": chrono::Utc::now()
    }))
}

/// An upload credential is a live session or an API key with the upload
/// capability; the owning user id comes along for the record.
fn require_upload_credential(state: &AppState, headers: &HeaderMap) -> Result<i64> {
    let creds = Credentials::from_headers(headers, None);

    if let Some(token) = &creds.session_token {
        if let Some(user_id) = state.sessions.verify(token) {
            return Ok(user_id);
        }
    }
    if let Some(key) = &creds.api_key {
        if let Some(user_id) = state.api_keys.verify(key, |caps| caps.upload) {
            return Ok(user_id);
        }
    }

    Err(AppError::Unauthorized)
}

// Receive one chunk of a session (dropzone-style field names)
pub async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>> {
    require_upload_credential(&state, &headers)?;

    let mut session_id: Option<String> = None;
    let mut offset: Option<i64> = None;
    let mut total_size: Option<i64> = None;
    let mut chunk_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| AppError::BadRequest("Invalid multipart data".to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "dzuuid" => {
                let value = field
                    .text()
                    .await
                    .map_err(|_| AppError::BadRequest("Failed to read dzuuid".to_string()))?;
                session_id = Some(value);
            }
            "dzchunkbyteoffset" => {
                let value = field.text().await.map_err(|_| {
                    AppError::BadRequest("Failed to read dzchunkbyteoffset".to_string())
                })?;
                offset = Some(value.parse().map_err(|_| {
                    AppError::BadRequest("Invalid dzchunkbyteoffset".to_string())
                })?);
            }
            "dztotalfilesize" => {
                let value = field.text().await.map_err(|_| {
                    AppError::BadRequest("Failed to read dztotalfilesize".to_string())
                })?;
                total_size = Some(value.parse().map_err(|_| {
                    AppError::BadRequest("Invalid dztotalfilesize".to_string())
                })?);
            }
            "file" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|_| AppError::BadRequest("Failed to read chunk data".to_string()))?;
                chunk_data = Some(data.to_vec());
            }
            _ => {
                // Skip unknown fields
                let _ = field.bytes().await;
            }
        }
    }

    let session_id =
        session_id.ok_or_else(|| AppError::BadRequest("Missing dzuuid".to_string()))?;
    let offset = offset.unwrap_or(0);
    let total_size =
        total_size.ok_or_else(|| AppError::BadRequest("Missing dztotalfilesize".to_string()))?;
    let chunk_data =
        chunk_data.ok_or_else(|| AppError::BadRequest("Missing chunk data".to_string()))?;

    if total_size > state.config.max_file_size as i64 {
        return Err(AppError::FileTooLarge);
    }

    let accepted = state
        .assembler
        .submit_chunk(&session_id, offset, total_size, &chunk_data)
        .await?;

    Ok(Json(ChunkUploadResponse {
        result: "OK".to_string(),
        received_bytes: accepted.received_bytes,
        total_size: accepted.total_size,
        complete: accepted.complete,
    }))
}

// Finalize a completed chunk set into a durable file
pub async fn complete_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CompleteUploadRequest>,
) -> Result<Json<CompleteUploadResponse>> {
    let user_id = require_upload_credential(&state, &headers)?;

    if request.file_size > state.config.max_file_size as i64 {
        return Err(AppError::FileTooLarge);
    }
    if let Some(bucket) = request.bucket.as_deref().filter(|b| !b.is_empty()) {
        if !state.storage.has_bucket(bucket) {
            return Err(AppError::BadRequest(format!(
                "Unknown storage bucket: {}",
                bucket
            )));
        }
    }

    let expires_at = request
        .expires_in_hours
        .map(|hours| chrono::Utc::now() + chrono::Duration::hours(hours));

    let options = FinalizeOptions {
        password: request.password.clone(),
        expires_at,
        max_downloads: request.max_downloads,
        encryption: request.encryption,
        bucket: request.bucket.clone().filter(|b| !b.is_empty()),
        with_hotlink: request.with_hotlink,
        user_id,
        declared_size: Some(request.file_size),
    };

    if request.nonblocking {
        // Outcome observable on the status feed only
        let processor = state.processor.clone();
        let session_id = request.session_id.clone();
        let filename = request.filename.clone();
        let content_type = request.content_type.clone();
        tokio::spawn(async move {
            if let Err(e) = processor
                .finalize(&session_id, &filename, content_type, options)
                .await
            {
                tracing::warn!("Background finalize of {} failed: {}", session_id, e);
            }
        });

        return Ok(Json(CompleteUploadResponse {
            result: "OK".to_string(),
            file: None,
        }));
    }

    let record = state
        .processor
        .finalize(
            &request.session_id,
            &request.filename,
            request.content_type.clone(),
            options,
        )
        .await?;

    Ok(Json(CompleteUploadResponse {
        result: "OK".to_string(),
        file: Some(to_api_output(&record, &state.config.base_url)),
    }))
}

// Live status feed for one upload session
pub async fn upload_status_feed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    require_upload_credential(&state, &headers)?;

    let rx = state.status.subscribe(&session_id);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(Event::default().data(data)), rx));
                }
                // Overflow drops the oldest events; keep draining
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// API-scoped file listing
pub async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<FileListResponse>> {
    let creds = Credentials::from_headers(&headers, None);
    let key = creds.api_key.as_deref().unwrap_or_default();
    if state.api_keys.verify(key, |caps| caps.list).is_none() {
        return Err(AppError::Unauthorized);
    }

    let files = crate::database::file_ops::list_all(&state.db)
        .await?
        .iter()
        .filter(|f| !f.is_pending_deletion())
        .map(|f| to_api_output(f, &state.config.base_url))
        .collect();

    Ok(Json(FileListResponse {
        result: "OK".to_string(),
        files,
    }))
}

// Web download, query form: GET /d?id=<id>
pub async fn download_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse> {
    let credentials = Credentials::from_headers(&headers, Some(&query.id));
    let granted = state
        .gate
        .authorize(FileRef::Id(&query.id), AccessScope::Web, &credentials)
        .await?;
    stream_download(granted)
}

// Web download with a password submission: POST /d?id=<id>
pub async fn download_file_with_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
    Form(submission): Form<PasswordSubmission>,
) -> Result<impl IntoResponse> {
    let mut credentials = Credentials::from_headers(&headers, Some(&query.id));
    credentials.password = Some(submission.password);

    let granted = state
        .gate
        .authorize(FileRef::Id(&query.id), AccessScope::Web, &credentials)
        .await?;
    stream_download(granted)
}

// Web download, path-embedded filename form: GET /d/<id>/<filename>
pub async fn download_file_named(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, _filename)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let credentials = Credentials::from_headers(&headers, Some(&id));
    let granted = state
        .gate
        .authorize(FileRef::Id(&id), AccessScope::Web, &credentials)
        .await?;
    stream_download(granted)
}

// Short hotlink form: GET /h/<hotlink_id>
pub async fn hotlink_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hotlink_id): Path<String>,
) -> Result<impl IntoResponse> {
    let credentials = Credentials::from_headers(&headers, None);
    let granted = state
        .gate
        .authorize(
            FileRef::Hotlink(&hotlink_id),
            AccessScope::Hotlink,
            &credentials,
        )
        .await?;
    stream_download(granted)
}

// Hotlink filename form, used when the short form is disabled:
// GET /dh/<id>/<filename>
pub async fn hotlink_file_named(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, _filename)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let credentials = Credentials::from_headers(&headers, Some(&id));
    let granted = state
        .gate
        .authorize(FileRef::Id(&id), AccessScope::Hotlink, &credentials)
        .await?;
    stream_download(granted)
}

/// Build the streaming response for a granted download. The caller never
/// learns which backend produced the bytes.
fn stream_download(granted: GrantedDownload) -> Result<Response<Body>> {
    let record = &granted.record;

    // Sanitize filename for the Content-Disposition header
    let sanitized_filename = record
        .name
        .replace('\"', "\\\"")
        .replace(['\n', '\r'], " ");

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            record
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream"),
        )
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", sanitized_filename),
        )
        .header(header::CONTENT_LENGTH, record.size_bytes.to_string())
        .header("X-File-Id", record.file_id.clone())
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate");

    if let Some(proof) = &granted.password_cookie {
        builder = builder.header(
            header::SET_COOKIE,
            format!("p{}={}; Path=/; SameSite=Strict", record.file_id, proof),
        );
    }

    let body = match granted.body {
        DownloadBody::Buffered(bytes) => Body::from(bytes),
        DownloadBody::Streamed(stream) => Body::from_stream(stream),
    };

    builder
        .body(body)
        .map_err(|e| AppError::ServerError(format!("Failed to build download response: {}", e)))
}

/// Project a file record into the API metadata shape.
pub fn to_api_output(record: &file::Model, base_url: &str) -> FileApiOutput {
    let base = base_url.trim_end_matches('/');
    FileApiOutput {
        id: record.file_id.clone(),
        name: record.name.clone(),
        size: human_size(record.size_bytes),
        size_bytes: record.size_bytes,
        content_type: record.content_type.clone(),
        sha256: record.sha256.clone(),
        expire_at: record.expires_at,
        expire_at_string: record
            .expires_at
            .map(|t| t.format("%a %b %d %Y %H:%M:%S").to_string())
            .unwrap_or_else(|| "Never".to_string()),
        downloads_remaining: record.downloads_remaining.unwrap_or(0),
        unlimited_downloads: record.downloads_remaining.is_none(),
        unlimited_time: record.expires_at.is_none(),
        download_count: record.download_count,
        is_password_protected: record.is_password_protected(),
        is_encrypted: record.is_encrypted,
        is_end_to_end_encrypted: record.is_end_to_end_encrypted(),
        is_local_storage: record.is_local_storage(),
        is_pending_deletion: record.is_pending_deletion(),
        user_id: record.user_id,
        hotlink_id: record.hotlink_id.clone(),
        url_download: format!("{}/d?id={}", base, record.file_id),
        url_hotlink: record
            .hotlink_id
            .as_ref()
            .map(|h| format!("{}/h/{}", base, h)),
    }
}
