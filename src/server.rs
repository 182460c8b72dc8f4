//! HTTP surface: `POST /ocr` and `GET /health`.
//!
//! The handler only parses the multipart body and maps the outcome to a
//! status code; everything else happens in [`Ingestor::ingest`]. The run is
//! spawned onto its own task, so a client that hangs up mid-request does not
//! cancel a persist or sink call that is already in flight.

use crate::error::IngestError;
use crate::ingest::Ingestor;
use crate::output::UploadJob;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Multipart field the upload widget posts the image in.
pub const UPLOAD_FIELD: &str = "image";

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    /// Copied from [`ServerConfig::body_limit`] by [`create_router`].
    body_limit: usize,
}

impl AppState {
    pub fn new(ingestor: Ingestor) -> Self {
        Self {
            ingestor: Arc::new(ingestor),
            body_limit: ServerConfig::default().body_limit,
        }
    }
}

/// Listener and request-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Default: 8080.
    pub port: u16,
    /// Allowed CORS origin. `None` or `"*"` allows any origin.
    pub cors_origin: Option<String>,
    /// Maximum request body in bytes. Default: 10 MiB.
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origin: None,
            body_limit: 10 * 1024 * 1024,
        }
    }
}

/// Build the application router.
///
/// # Errors
/// [`IngestError::InvalidConfig`] if the CORS origin is not a valid header value.
pub fn create_router(state: AppState, config: &ServerConfig) -> Result<Router, IngestError> {
    let state = AppState {
        body_limit: config.body_limit,
        ..state
    };
    Ok(Router::new()
        .route("/ocr", post(ocr))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(config.body_limit))
        .layer(cors_layer(config.cors_origin.as_deref())?)
        .with_state(state))
}

fn cors_layer(origin: Option<&str>) -> Result<CorsLayer, IngestError> {
    match origin.map(str::trim) {
        None | Some("") | Some("*") => Ok(CorsLayer::permissive()),
        Some(origin) => {
            let value = HeaderValue::from_str(origin).map_err(|e| {
                IngestError::InvalidConfig(format!("CORS origin '{origin}': {e}"))
            })?;
            Ok(CorsLayer::new()
                .allow_origin(value)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any))
        }
    }
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, config: &ServerConfig) -> Result<(), IngestError> {
    let app = create_router(state, config)?;
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(|e| {
            IngestError::InvalidConfig(format!("cannot bind {}:{}: {e}", config.host, config.port))
        })?;
    let addr = listener
        .local_addr()
        .map_err(|e| IngestError::Internal(e.to_string()))?;
    info!("Starting server at http://{}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| IngestError::Internal(format!("server: {e}")))
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ocr(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let job = match multipart {
        Ok(mut multipart) => match read_upload(&mut multipart, state.body_limit).await {
            Ok(job) => job,
            Err(e) => return error_response(&e),
        },
        Err(rejection) => {
            return error_response(&IngestError::InvalidUpload(rejection.body_text()));
        }
    };

    let ingestor = state.ingestor.clone();
    let run = tokio::spawn(async move { ingestor.ingest(job).await });
    match run.await {
        Ok(Ok(output)) => (StatusCode::OK, Json(output.response())).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            error!("Pipeline task aborted: {e}");
            error_response(&IngestError::Internal(format!("pipeline task aborted: {e}")))
        }
    }
}

/// Take the file from the `image` field, or failing that the first file field.
async fn read_upload(multipart: &mut Multipart, limit: usize) -> Result<UploadJob, IngestError> {
    let mut fallback = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| upload_error(e, limit))?
    {
        let is_image = field.name() == Some(UPLOAD_FIELD);
        let filename = field.file_name().map(str::to_string);
        if !is_image && filename.is_none() {
            continue;
        }
        let content_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| upload_error(e, limit))?;
        let job = UploadJob::new(
            filename.unwrap_or_else(|| "upload".to_string()),
            bytes.to_vec(),
            content_type,
        );
        if is_image {
            return Ok(job);
        }
        fallback.get_or_insert(job);
    }
    fallback.ok_or_else(|| {
        IngestError::InvalidUpload(format!("no file in field '{UPLOAD_FIELD}'"))
    })
}

fn upload_error(err: MultipartError, limit: usize) -> IngestError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        IngestError::PayloadTooLarge { limit }
    } else {
        IngestError::InvalidUpload(err.body_text())
    }
}

/// `{error, stage}` with the status the error maps to.
fn error_response(err: &IngestError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let stage = err.stage().map(|s| s.as_str()).unwrap_or(err.kind());
    (
        status,
        Json(json!({ "error": err.to_string(), "stage": stage })),
    )
        .into_response()
}
