//! HTTP API over a [`PodProvider`].
//!
//! ## Endpoints
//!
//! - `POST /sandboxes` - Run a pod sandbox
//! - `GET /sandboxes?id=&state=&label=k=v` - List pod sandboxes
//! - `GET /sandboxes/:id` - Pod sandbox status
//! - `POST /sandboxes/:id/stop` - Stop a pod sandbox
//! - `DELETE /sandboxes/:id` - Remove a pod sandbox
//! - `POST /sandboxes/:id/exec` - Run a command through the sandbox client
//! - `GET /images` - List images
//! - `GET /health` - Health check

use crate::types::{filter_from_query, ErrorResponse, ExecRequest, RunPodSandboxResponse};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use vmpod_core::{CoreError, PodProvider, PodSandboxConfig, SandboxId};

type AppState = Arc<dyn PodProvider>;

/// An error rendered as `{ "error": ... }` with a mapped status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match &e {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
            CoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            CoreError::Provision { .. }
            | CoreError::Connect { .. }
            | CoreError::Connection(_)
            | CoreError::AgentTimeout(_)
            | CoreError::Rpc { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %e, %status, "Request failed");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

fn parse_id(raw: &str) -> Result<SandboxId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::bad_request(format!("invalid sandbox id {raw:?}: {e}")))
}

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(provider: Arc<dyn PodProvider>) -> Router {
    tracing::debug!(provider = provider.name(), "Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/sandboxes", post(run_handler).get(list_handler))
        .route("/sandboxes/:id", get(status_handler).delete(remove_handler))
        .route("/sandboxes/:id/stop", post(stop_handler))
        .route("/sandboxes/:id/exec", post(exec_handler))
        .route("/images", get(images_handler))
        .with_state(provider)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(provider): State<AppState>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "vmpod-server",
        "provider": provider.name(),
    }))
}

async fn run_handler(
    State(provider): State<AppState>,
    Json(config): Json<PodSandboxConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let sandbox_id = provider.run_pod_sandbox(config).await?;
    Ok((StatusCode::CREATED, Json(RunPodSandboxResponse { sandbox_id })))
}

async fn list_handler(
    State(provider): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = filter_from_query(&pairs).map_err(ApiError::bad_request)?;
    Ok(Json(provider.list_pod_sandbox(&filter).await?))
}

async fn status_handler(
    State(provider): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(provider.pod_sandbox_status(id).await?))
}

async fn stop_handler(
    State(provider): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    provider.stop_pod_sandbox(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_handler(
    State(provider): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    provider.remove_pod_sandbox(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn exec_handler(
    State(provider): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let client = provider.get_client(id).await?;
    tracing::debug!(sandbox_id = %id, cmd = %request.cmd, "Executing command");
    Ok(Json(client.exec(&request.cmd).await?))
}

async fn images_handler(State(provider): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(provider.list_images(None).await?))
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal. In-flight requests are allowed to finish.
pub async fn serve(
    provider: Arc<dyn PodProvider>,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(provider);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
