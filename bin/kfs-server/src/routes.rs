//! HTTP routes
//!
//! - `GET /`               version banner
//! - `GET /exists/{hash}`  `yes` or `no`
//! - `POST /upload`        multipart form: `hash`, `size`, optional `path`,
//!   then `file`
//!
//! Upload with:
//! ```text
//! curl -X POST \
//!     -F "hash=$(b2sum blob | awk '{ print $1 }')" \
//!     -F "size=$(stat -c %s blob)" \
//!     -F "path=$(pwd)" \
//!     -F "file=@blob" \
//!     localhost:8080/upload
//! ```

use crate::ingest::{IngestOutcome, Ingestor};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::TryStreamExt;
use kfs_common::{ContentHash, Error};
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub struct AppState {
    pub ingestor: Arc<Ingestor>,
}

/// Error response: status from [`Error::http_status_code`], message as body
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            info!("Request rejected: {}", self.0);
        }
        (status, format!("{}\n", self.0)).into_response()
    }
}

fn malformed(e: impl std::fmt::Display) -> ApiError {
    ApiError(Error::invalid_request(format!("malformed multipart body: {e}")))
}

pub fn router(state: Arc<AppState>, max_upload_bytes: u64) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/exists/{hash}", get(exists))
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::max(
            usize::try_from(max_upload_bytes).unwrap_or(usize::MAX),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> String {
    format!("KFS version: {}\n", env!("CARGO_PKG_VERSION"))
}

async fn exists(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<&'static str, ApiError> {
    let hash = ContentHash::new(hash).map_err(Error::from)?;
    if state.ingestor.has_hash(&hash).await? {
        debug!("hash {} exists", hash);
        Ok("yes")
    } else {
        debug!("hash {} does not exist", hash);
        Ok("no")
    }
}

async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<&'static str, ApiError> {
    let mut hash: Option<ContentHash> = None;
    let mut size: Option<u64> = None;
    let mut client_path = String::new();

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "hash" => {
                let text = field.text().await.map_err(malformed)?;
                hash = Some(ContentHash::new(text.trim()).map_err(Error::from)?);
            }
            "size" => {
                let text = field.text().await.map_err(malformed)?;
                let parsed = text.trim().parse::<u64>().map_err(|e| {
                    Error::invalid_request(format!("invalid size '{}': {e}", text.trim()))
                })?;
                size = Some(parsed);
            }
            "path" => client_path = field.text().await.map_err(malformed)?,
            "file" => {
                let Some(hash) = hash.take() else {
                    return Err(Error::invalid_request("'hash' must precede 'file'").into());
                };
                let Some(size) = size else {
                    return Err(Error::invalid_request("'size' must precede 'file'").into());
                };
                let file_name = field.file_name().unwrap_or_default().to_string();
                info!(
                    "Receiving '{}/{}', size {} bytes, hash {}",
                    client_path, file_name, size, hash
                );

                let body = StreamReader::new(Box::pin(field.map_err(std::io::Error::other)));
                match state.ingestor.ingest(&hash, size, body).await? {
                    IngestOutcome::AlreadyStored => info!("Skipping, already have {}", hash),
                    IngestOutcome::Stored(report) => debug!(
                        "{} written to {} replicas",
                        hash,
                        report.outcomes.len()
                    ),
                }
                return Ok("ok");
            }
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    Err(Error::invalid_request("file upload requires a 'file' field").into())
}
