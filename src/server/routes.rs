//! HTTP routes of the distribution endpoint.

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::content::{content_disposition, content_type};
use super::templates::{SharePageView, TemplateEngine};
use crate::daemon::protocol::{AccessMode, ShareId, ShareRecord};
use crate::daemon::registry::{Registry, RegistryError};

/// A fetch that passed all checks and started streaming.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub id: ShareId,
    pub mode: AccessMode,
    pub bytes: u64,
    pub remote: Option<SocketAddr>,
}

/// Observer called once per started fetch.
pub type FetchHook = Arc<dyn Fn(&FetchEvent) + Send + Sync>;

/// Hook that records fetches in the log.
pub fn logging_hook() -> FetchHook {
    Arc::new(|event: &FetchEvent| {
        info!(
            share_id = %event.id,
            mode = %event.mode,
            bytes = event.bytes,
            remote = ?event.remote,
            "Share fetched"
        );
    })
}

/// Shared application state.
pub struct DistributionState {
    pub registry: Arc<Registry>,
    pub template_engine: TemplateEngine,
    pub public_url: String,
    pub hook: FetchHook,
}

/// Errors surfaced to fetchers
#[derive(Debug, Error)]
pub enum DistributionError {
    /// Unknown, malformed and expired ids all look the same from outside
    #[error("Share not found")]
    NotFound,

    #[error("This share does not allow {0} access")]
    ModeNotEnabled(AccessMode),

    #[error("Shared file is unavailable: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shared file changed size: expected {expected} bytes, found {actual}")]
    SizeChanged { expected: u64, actual: u64 },

    #[error("Template error: {0}")]
    Render(#[from] minijinja::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for DistributionError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) | RegistryError::Expired(_) => DistributionError::NotFound,
            RegistryError::ModeNotEnabled { mode, .. } => DistributionError::ModeNotEnabled(mode),
            other => DistributionError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for DistributionError {
    fn into_response(self) -> Response {
        let status = match &self {
            DistributionError::NotFound => StatusCode::NOT_FOUND,
            DistributionError::ModeNotEnabled(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Fetch failed: {}", self);
            return (status, "Internal server error").into_response();
        }
        debug!("Fetch rejected: {}", self);
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    pub mode: Option<AccessMode>,
}

/// User agents of download tools, matched case-insensitively as prefixes.
const DOWNLOADER_AGENTS: &[&str] = &[
    "wget",
    "curl",
    "httpie",
    "aria2",
    "python-requests",
    "go-http-client",
    "powershell",
    "libfetch",
];

/// Pick the access mode for a request without an explicit `?mode=`.
///
/// Download tools and requests without a User-Agent get the raw bytes,
/// everything else gets the share page.
pub fn detect_mode(user_agent: Option<&str>) -> AccessMode {
    let Some(agent) = user_agent.map(|ua| ua.trim().to_ascii_lowercase()) else {
        return AccessMode::Wget;
    };
    if agent.is_empty() || DOWNLOADER_AGENTS.iter().any(|tool| agent.starts_with(tool)) {
        AccessMode::Wget
    } else {
        AccessMode::Website
    }
}

/// Build the router with all routes.
pub fn build_router(state: Arc<DistributionState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/:id", get(share_handler))
        .route("/:id/download", get(download_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

fn parse_id(raw: &str) -> Result<ShareId, DistributionError> {
    raw.parse().map_err(|_| DistributionError::NotFound)
}

/// Serve a share in the mode requested or implied by the User-Agent.
async fn share_handler(
    State(state): State<Arc<DistributionState>>,
    Path(raw_id): Path<String>,
    Query(query): Query<FetchQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, DistributionError> {
    let id = parse_id(&raw_id)?;
    let mode = query.mode.unwrap_or_else(|| {
        detect_mode(
            headers
                .get(header::USER_AGENT)
                .and_then(|value| value.to_str().ok()),
        )
    });
    let record = state.registry.get_for_access(id, mode)?;

    match mode {
        AccessMode::Wget => stream_file(&state, record, mode, connect_info.map(|c| c.0)).await,
        AccessMode::Website => {
            let view = SharePageView::from_record(&record, &state.public_url, state.registry.now());
            let html = state.template_engine.render_share(&view)?;
            Ok(Html(html).into_response())
        }
    }
}

/// Download link of the share page.
async fn download_handler(
    State(state): State<Arc<DistributionState>>,
    Path(raw_id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, DistributionError> {
    let id = parse_id(&raw_id)?;
    let record = state.registry.get_for_access(id, AccessMode::Website)?;
    stream_file(&state, record, AccessMode::Website, connect_info.map(|c| c.0)).await
}

/// Stream a share's bytes. The file is opened and its length checked
/// before any header is sent.
async fn stream_file(
    state: &DistributionState,
    record: ShareRecord,
    mode: AccessMode,
    remote: Option<SocketAddr>,
) -> Result<Response, DistributionError> {
    let file = tokio::fs::File::open(&record.path).await?;
    let actual = file.metadata().await?.len();
    if actual != record.size {
        return Err(DistributionError::SizeChanged {
            expected: record.size,
            actual,
        });
    }

    let body = Body::from_stream(ReaderStream::new(file.take(record.size)));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type(&record.file_type))
        .header(header::CONTENT_LENGTH, record.size)
        .header(header::CONTENT_DISPOSITION, content_disposition(&record.name))
        .body(body)
        .map_err(|e| DistributionError::Internal(format!("Failed to build response: {}", e)))?;

    (state.hook)(&FetchEvent {
        id: record.id,
        mode,
        bytes: record.size,
        remote,
    });
    Ok(response)
}
