//! HTTP endpoints for picshelf.
//!
//! The caller's identity comes from the `x-owner-id` header, set by whatever
//! handles authentication in front of us.

use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{
        rejection::{BytesRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shelfcas::{
    mime_for_extension, AssetDescriptor, CasError, Fingerprint, ImagePayload, OwnerId,
    SweepReport, UploadOutcome,
};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

use crate::app::{AppContext, ObjectSource};

/// Header carrying the caller's owner id.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Largest accepted upload body.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Shared state for web handlers
#[derive(Clone)]
pub struct WebState {
    pub app: AppContext,
    pub start_time: Instant,
}

impl WebState {
    pub fn new(app: AppContext) -> Self {
        Self {
            app,
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(serve_root))
        .route("/health", get(health))
        .route("/session", post(start_session))
        .route("/images", post(upload_image).get(list_images))
        .route("/images/{fingerprint}", get(get_image).delete(delete_image))
        .route("/cleanup", post(cleanup))
        .route("/objects/{backend}/{*key}", get(serve_object))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<CasError> for ApiError {
    fn from(err: CasError) -> Self {
        match &err {
            CasError::InvalidInput(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_input", err.to_string()),
            CasError::DuplicateKey { .. } => Self::new(StatusCode::CONFLICT, "duplicate_key", err.to_string()),
            CasError::UploadFailed { .. } => {
                tracing::warn!(error = %err, "upload failed");
                Self::new(StatusCode::BAD_GATEWAY, "upload_failed", err.to_string())
            }
            CasError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, "not_found", err.to_string()),
            CasError::InvalidConfig(_) | CasError::Storage(_) => {
                tracing::error!(error = %err, "request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal storage error",
                )
            }
        }
    }
}

/// Malformed query strings, paths and bodies get the same JSON shape as
/// domain errors.
fn rejected(status: StatusCode, message: String) -> ApiError {
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "payload_too_large"
    } else if status.is_client_error() {
        "invalid_input"
    } else {
        "internal"
    };
    ApiError::new(status, code, message)
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        rejected(rejection.status(), rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        rejected(rejection.status(), rejection.body_text())
    }
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        rejected(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "error": self.message,
                "code": self.code,
            })),
        )
            .into_response()
    }
}

/// The owner named by the `x-owner-id` header.
pub struct Owner(pub OwnerId);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts.headers.get(OWNER_HEADER).ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "missing_owner",
                format!("missing {OWNER_HEADER} header"),
            )
        })?;
        let id = value.to_str().map_err(|_| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "invalid_input",
                format!("{OWNER_HEADER} is not valid text"),
            )
        })?;
        Ok(Owner(OwnerId::new(id.trim())?))
    }
}

/// Serve root discovery endpoint
async fn serve_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "picshelf",
        "version": env!("CARGO_PKG_VERSION"),
        "links": {
            "health": "/health",
            "session": "/session",
            "images": "/images",
            "cleanup": "/cleanup",
        }
    }))
}

async fn health(State(state): State<WebState>) -> Json<serde_json::Value> {
    let assets = state.app.router.registry().count();
    let status = if assets.is_ok() { "healthy" } else { "degraded" };

    Json(serde_json::json!({
        "status": status,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "assets": assets.ok(),
    }))
}

#[derive(Serialize)]
struct SessionResponse {
    sweep: SweepReport,
    assets: Vec<AssetDescriptor>,
}

/// Called on login: drop the owner's dead assets, then return their gallery.
async fn start_session(
    State(state): State<WebState>,
    Owner(owner): Owner,
) -> Result<Json<SessionResponse>, ApiError> {
    let probe = state.app.sweep_on_session.then(|| state.app.probe.as_ref());
    let session = state.app.router.begin_session(&owner, probe).await?;
    Ok(Json(SessionResponse {
        sweep: session.report,
        assets: session.assets,
    }))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    /// Client file name; its extension decides whether the upload is accepted.
    name: String,
}

#[derive(Serialize)]
struct UploadResponse {
    status: &'static str,
    asset: AssetDescriptor,
}

async fn upload_image(
    State(state): State<WebState>,
    Owner(owner): Owner,
    query: Result<Query<UploadQuery>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let Query(query) = query?;
    let body = body?;
    let outcome = state
        .app
        .router
        .upload(&owner, ImagePayload::new(body, query.name))
        .await?;

    let (status, label) = match &outcome {
        UploadOutcome::Stored(_) => (StatusCode::CREATED, "stored"),
        UploadOutcome::Duplicate(_) => (StatusCode::OK, "duplicate"),
    };
    Ok((
        status,
        Json(UploadResponse {
            status: label,
            asset: outcome.into_descriptor(),
        }),
    ))
}

async fn list_images(
    State(state): State<WebState>,
    Owner(owner): Owner,
) -> Result<Json<Vec<AssetDescriptor>>, ApiError> {
    Ok(Json(state.app.router.gallery(&owner)?))
}

fn parse_fingerprint(raw: &str) -> Result<Fingerprint, ApiError> {
    Fingerprint::parse(raw).map_err(|e| ApiError::from(CasError::from(e)))
}

async fn get_image(
    State(state): State<WebState>,
    Owner(owner): Owner,
    fingerprint: Result<Path<String>, PathRejection>,
) -> Result<Json<AssetDescriptor>, ApiError> {
    let Path(fingerprint) = fingerprint?;
    let fingerprint = parse_fingerprint(&fingerprint)?;
    let descriptor = state
        .app
        .router
        .registry()
        .lookup(&owner, &fingerprint)?
        .ok_or(CasError::NotFound { owner, fingerprint })?;
    Ok(Json(descriptor))
}

async fn delete_image(
    State(state): State<WebState>,
    Owner(owner): Owner,
    fingerprint: Result<Path<String>, PathRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let Path(fingerprint) = fingerprint?;
    let fingerprint = parse_fingerprint(&fingerprint)?;
    let removed = state.app.router.remove(&owner, &fingerprint).await?;
    Ok(Json(UploadResponse {
        status: "removed",
        asset: removed,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct CleanupQuery {
    /// Sweep every owner's assets instead of just the caller's.
    #[serde(default)]
    all: bool,
}

async fn cleanup(
    State(state): State<WebState>,
    Owner(owner): Owner,
    query: Result<Query<CleanupQuery>, QueryRejection>,
) -> Result<Json<SweepReport>, ApiError> {
    let Query(query) = query?;
    let scope = (!query.all).then_some(&owner);
    let report = state
        .app
        .router
        .sweep(scope, state.app.probe.as_ref())
        .await?;
    Ok(Json(report))
}

/// Serve an object stored in one of our own backends.
async fn serve_object(
    State(state): State<WebState>,
    path: Result<Path<(String, String)>, PathRejection>,
) -> Response {
    let (backend, key) = match path {
        Ok(Path(parts)) => parts,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };
    let Some(source) = state.app.objects.get(&backend) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let extension = std::path::Path::new(&key)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let (body, mime_type) = match source {
        ObjectSource::Fs(fs) => {
            let path = match fs.object_path(&key) {
                Ok(p) => p,
                Err(_) => return StatusCode::BAD_REQUEST.into_response(),
            };
            let file = match tokio::fs::File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return StatusCode::NOT_FOUND.into_response()
                }
                Err(e) => {
                    tracing::warn!("Failed to open {}: {}", path.display(), e);
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };
            (
                Body::from_stream(ReaderStream::new(file)),
                mime_for_extension(&extension).to_string(),
            )
        }
        ObjectSource::Memory(mem) => match mem.object(&key) {
            Some((data, mime_type)) => (Body::from(data), mime_type),
            None => return StatusCode::NOT_FOUND.into_response(),
        },
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime_type)
        .header(header::CACHE_CONTROL, "public, max-age=31536000, immutable")
        .body(body)
        .map_err(|e| {
            tracing::error!("Failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
        .unwrap_or_else(|status| status.into_response())
}
