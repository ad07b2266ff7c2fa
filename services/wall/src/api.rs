use crate::config::ApiConfig;
use crate::feed::ChangeEvent;
use crate::ingest::{IngestError, PhotoUpload};
use crate::moderation::ModerationError;
use crate::photo::{PhotoId, PhotoRecord, MAX_PHOTO_BYTES};
use crate::store::StoreError;
use crate::wall::PhotoWall;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Request bodies above this are refused before they reach validation
const BODY_LIMIT: usize = MAX_PHOTO_BYTES as usize + 64 * 1024;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub wall: PhotoWall,
}

/// A photo as returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoResponse {
    #[serde(flatten)]
    pub record: PhotoRecord,
    /// Where a browser can fetch the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PhotoListResponse {
    pub photos: Vec<PhotoResponse>,
    pub count: usize,
}

/// Query parameters for uploads; the image itself is the request body
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: Option<String>,
    pub uploader: Option<String>,
    /// Declared size; defaults to the body length
    pub size: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub removed: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn store_error(context: &str, e: StoreError) -> ApiError {
    error!(error = %e, "{context}");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, context, "STORAGE_FAILURE")
}

fn ingest_error(e: IngestError) -> ApiError {
    let status = match e {
        IngestError::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        IngestError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        IngestError::TooSmall { .. } | IngestError::SizeMismatch { .. } => StatusCode::BAD_REQUEST,
        IngestError::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "Upload failed");
        return api_error(status, "Failed to store photo", e.code());
    }
    api_error(status, e.to_string(), e.code())
}

fn moderation_error(e: ModerationError) -> ApiError {
    error!(error = %e, "Moderation failed");
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Failed to remove photo",
        "STORAGE_FAILURE",
    )
}

/// Body extraction failures. An oversized body is reported like any other
/// oversized photo.
fn body_error(rejection: BytesRejection, headers: &HeaderMap) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(BODY_LIMIT as u64 + 1);
        metrics::counter!("wall.ingest.rejected", "reason" => "TOO_LARGE").increment(1);
        return ingest_error(IngestError::TooLarge {
            size,
            max: MAX_PHOTO_BYTES,
        });
    }
    warn!(error = %rejection, "Failed to read upload body");
    api_error(rejection.status(), rejection.body_text(), "BAD_REQUEST")
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/api/photos",
            get(list_photos).post(upload_photo).delete(clear_photos),
        )
        .route("/api/photos/:id", get(get_photo).delete(delete_photo))
        .route("/api/photos/:id/file", get(get_photo_file))
        .route("/api/events", get(events))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "event-wall"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.wall.backend().name;
    match state.wall.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "backend": backend
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "backend": backend,
                "error": e.to_string()
            })),
        ),
    }
}

async fn with_url(wall: &PhotoWall, record: PhotoRecord) -> PhotoResponse {
    let url = match wall.resolve_url(&record.blob_ref).await {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(error = %e, photo_id = %record.id, "Failed to resolve photo URL");
            None
        }
    };
    PhotoResponse { record, url }
}

/// All photos, newest first
#[instrument(skip(state))]
async fn list_photos(State(state): State<AppState>) -> Result<Json<PhotoListResponse>, ApiError> {
    let records = state
        .wall
        .list_photos()
        .await
        .map_err(|e| store_error("Failed to list photos", e))?;

    let mut photos = Vec::with_capacity(records.len());
    for record in records {
        photos.push(with_url(&state.wall, record).await);
    }

    Ok(Json(PhotoListResponse {
        count: photos.len(),
        photos,
    }))
}

/// Upload one photo as the raw request body
#[instrument(skip_all)]
async fn upload_photo(
    State(state): State<AppState>,
    Query(params): Query<UploadQuery>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<PhotoResponse>), ApiError> {
    let body = body.map_err(|rejection| body_error(rejection, &headers))?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut upload = PhotoUpload::new(
        body,
        content_type,
        params.filename.unwrap_or_else(|| "upload".to_string()),
    );
    if let Some(size) = params.size {
        upload = upload.with_declared_size(size);
    }
    if let Some(uploader) = params.uploader {
        upload = upload.with_uploader(uploader);
    }

    let record = state.wall.upload_photo(upload).await.map_err(ingest_error)?;
    Ok((StatusCode::CREATED, Json(with_url(&state.wall, record).await)))
}

/// Single photo metadata
#[instrument(skip(state))]
async fn get_photo(
    State(state): State<AppState>,
    Path(id): Path<PhotoId>,
) -> Result<Json<PhotoResponse>, ApiError> {
    let record = state
        .wall
        .get_photo(id)
        .await
        .map_err(|e| store_error("Failed to get photo", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Photo not found", "NOT_FOUND"))?;

    Ok(Json(with_url(&state.wall, record).await))
}

/// The image bytes, with their stored content type
#[instrument(skip(state))]
async fn get_photo_file(
    State(state): State<AppState>,
    Path(id): Path<PhotoId>,
) -> Result<impl IntoResponse, ApiError> {
    let (record, bytes) = state
        .wall
        .photo_bytes(id)
        .await
        .map_err(|e| store_error("Failed to read photo", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Photo not found", "NOT_FOUND"))?;

    Ok((
        [
            (header::CONTENT_TYPE, record.content_type.mime()),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable"),
        ],
        bytes,
    ))
}

#[instrument(skip(state))]
async fn delete_photo(
    State(state): State<AppState>,
    Path(id): Path<PhotoId>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let outcome = state.wall.delete_photo(id).await.map_err(moderation_error)?;
    Ok(Json(DeleteResponse {
        deleted: outcome.deleted(),
    }))
}

#[instrument(skip(state))]
async fn clear_photos(State(state): State<AppState>) -> Result<Json<ClearResponse>, ApiError> {
    let removed = state.wall.clear_photos().await.map_err(moderation_error)?;
    Ok(Json(ClearResponse { removed }))
}

/// Change feed as Server-Sent Events
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("Change stream subscriber connected");

    let stream = state.wall.events().filter_map(|event| match sse_event(&event) {
        Ok(sse) => Some(Ok(sse)),
        Err(e) => {
            warn!(error = %e, kind = event.kind(), "Failed to encode change event");
            None
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("ping"),
    )
}

fn sse_event(event: &ChangeEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.kind()).json_data(event)
}

/// Start the wall API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting wall API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
