//! HTTP API for world management.
//!
//! ## Endpoints
//!
//! ### Worlds
//! - `GET /worlds` - List all worlds
//! - `POST /worlds` - Create a world (201)
//! - `GET /worlds/{id}` - World status
//! - `DELETE /worlds/{id}` - Stop (if running) and delete a world
//! - `POST /worlds/{id}/start` - Start a world
//! - `POST /worlds/{id}/stop?force=bool` - Stop a world
//! - `POST /worlds/{id}/command` - Send a console command
//! - `POST /worlds/{id}/auth` - Start device authentication
//! - `GET /worlds/{id}/logs?lines=N` - Recent output (1-1000, default 100)
//!
//! ### Streaming (server-sent events)
//! - `GET /worlds/{id}/logs/stream?tail=N` - Live output
//! - `POST /worlds/stream` - Create and start, streaming progress then output
//! - `POST /worlds/{id}/start/stream` - Start, streaming progress then output
//!
//! ### System
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics
//!
//! Every JSON response uses the envelope
//! `{success, message?, data?, code?, detail?}`. `detail` carries backend
//! diagnostics and is only filled in development.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Request, rejection::JsonRejection},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{Environment, HycoreConfig};
use crate::error::Error;
use crate::metrics;
use crate::supervisor::Supervisor;

mod handlers;
mod stream;
pub mod types;
pub mod validation;

use handlers::{
    authenticate_world, create_world, create_world_stream, delete_world, get_logs, get_world,
    health, list_worlds, send_command, start_world, start_world_stream, stop_world, stream_logs,
};
use types::ApiResponse;
use validation::ValidationError;

// =============================================================================
// App State
// =============================================================================

/// Shared application state for HTTP handlers.
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub environment: Environment,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>, environment: Environment) -> Self {
        Self {
            supervisor,
            environment,
            started_at: Instant::now(),
        }
    }

    /// Convert a supervisor error into a response, hiding diagnostics in
    /// production.
    pub(crate) fn fail(&self, error: Error) -> AppError {
        AppError::from_error(&error, !self.environment.is_production())
    }
}

pub type SharedState = Arc<AppState>;

// =============================================================================
// HTTP API Server
// =============================================================================

/// Build the API router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/worlds", get(list_worlds).post(create_world))
        .route("/worlds/stream", post(create_world_stream))
        .route("/worlds/{id}", get(get_world).delete(delete_world))
        .route("/worlds/{id}/start", post(start_world))
        .route("/worlds/{id}/start/stream", post(start_world_stream))
        .route("/worlds/{id}/stop", post(stop_world))
        .route("/worlds/{id}/command", post(send_command))
        .route("/worlds/{id}/auth", post(authenticate_world))
        .route("/worlds/{id}/logs", get(get_logs))
        .route("/worlds/{id}/logs/stream", get(stream_logs))
        .route("/metrics", get(metrics_endpoint))
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
}

/// Serve the API until Ctrl+C or SIGTERM.
pub async fn serve(config: &HycoreConfig, supervisor: Arc<Supervisor>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.server.host))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(%addr, backend = %supervisor.backend_kind(), "hycore API listening");

    let state = Arc::new(AppState::new(supervisor, config.environment));
    run(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `signal` resolves.
///
/// Worlds are shut down and every log stream is ended before the server
/// waits for open connections, so connected streaming clients cannot hold
/// the daemon up.
pub async fn run<F>(
    listener: tokio::net::TcpListener,
    state: SharedState,
    signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let supervisor = Arc::clone(&state.supervisor);
    let shutdown = async move {
        signal.await;
        tracing::info!("Starting graceful shutdown...");
        supervisor.shutdown().await;
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping hycore...");
}

/// Middleware to record HTTP request metrics.
async fn metrics_middleware(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let response = next.run(request).await;
    metrics::record_http_request(&method, response.status().as_u16());
    response
}

/// GET /metrics - Prometheus metrics endpoint.
async fn metrics_endpoint() -> impl IntoResponse {
    let body = metrics::get_handle()
        .map(metrics_exporter_prometheus::PrometheusHandle::render)
        .unwrap_or_default();
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

// =============================================================================
// Error Handling
// =============================================================================

/// An error response in the API envelope.
#[derive(Debug)]
pub(crate) struct AppError {
    status: StatusCode,
    body: ApiResponse<()>,
}

impl AppError {
    fn from_error(error: &Error, with_detail: bool) -> Self {
        let status =
            StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut body = if status.is_server_error() {
            tracing::error!(error = %error, detail = ?error.diagnostics(), "Request failed");
            ApiResponse::failure("Internal server error")
        } else {
            ApiResponse::failure(error.to_string())
        };
        body.code = error.code();

        if with_detail && status.is_server_error() {
            body.detail = Some(match error.diagnostics() {
                Some(output) => format!("{error}\n{output}"),
                None => error.to_string(),
            });
        }

        Self { status, body }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        let mut body = ApiResponse::failure(err.message);
        body.code = Error::InvalidRequest(String::new()).code();
        body.missing_fields = err.missing;
        Self {
            status: StatusCode::BAD_REQUEST,
            body,
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::from(ValidationError {
            message: rejection.body_text(),
            missing: Vec::new(),
        })
    }
}
