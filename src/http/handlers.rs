//! World management handlers.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::sse::{Event, Sse},
};
use futures::Stream;

use super::stream::sse;
use super::types::{
    ApiResponse, CommandRequest, CreateWorldRequest, HealthResponse, LogsQuery, LogsResponse,
    StopQuery, StreamQuery, WorldRef, WorldResponse, format_uptime,
};
use super::validation;
use super::{AppError, SharedState};

type JsonResponse<T> = Json<ApiResponse<T>>;

/// GET /health - Liveness and basic daemon facts.
pub(crate) async fn health(State(state): State<SharedState>) -> JsonResponse<HealthResponse> {
    let uptime = chrono::Duration::from_std(state.started_at.elapsed()).unwrap_or_default();
    Json(ApiResponse::ok(HealthResponse {
        status: "ok",
        agent: "hycore",
        version: env!("CARGO_PKG_VERSION"),
        backend: state.supervisor.backend_kind(),
        environment: if state.environment.is_production() {
            "production"
        } else {
            "development"
        },
        uptime: format_uptime(uptime),
        worlds: state.supervisor.list().len(),
    }))
}

/// GET /worlds - List all worlds.
pub(crate) async fn list_worlds(
    State(state): State<SharedState>,
) -> JsonResponse<Vec<WorldResponse>> {
    let worlds: Vec<WorldResponse> = state
        .supervisor
        .list()
        .into_iter()
        .map(WorldResponse::from)
        .collect();
    Json(ApiResponse::ok(worlds))
}

/// POST /worlds - Create a world.
pub(crate) async fn create_world(
    State(state): State<SharedState>,
    payload: Result<Json<CreateWorldRequest>, JsonRejection>,
) -> Result<(StatusCode, JsonResponse<WorldResponse>), AppError> {
    let Json(req) = payload?;
    let spec = validation::create_request(req)?;

    let world = state
        .supervisor
        .create(spec)
        .await
        .map_err(|e| state.fail(e))?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(WorldResponse::from(world)).with_message("World created successfully")),
    ))
}

/// GET /worlds/{id} - Status of one world.
pub(crate) async fn get_world(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<JsonResponse<WorldResponse>, AppError> {
    let id = validation::world_id(&id)?;
    let world = state.supervisor.status(id).map_err(|e| state.fail(e))?;
    Ok(Json(ApiResponse::ok(WorldResponse::from(world))))
}

/// DELETE /worlds/{id} - Stop (if needed) and remove a world.
pub(crate) async fn delete_world(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<JsonResponse<WorldRef>, AppError> {
    let id = validation::world_id(&id)?;
    state.supervisor.delete(id).await.map_err(|e| state.fail(e))?;
    Ok(Json(
        ApiResponse::ok(WorldRef { id: id.to_string() }).with_message("World deleted successfully"),
    ))
}

/// POST /worlds/{id}/start - Start a world.
pub(crate) async fn start_world(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<JsonResponse<WorldResponse>, AppError> {
    let id = validation::world_id(&id)?;
    let world = state.supervisor.start(id).await.map_err(|e| state.fail(e))?;
    Ok(Json(
        ApiResponse::ok(WorldResponse::from(world)).with_message("World started successfully"),
    ))
}

/// POST /worlds/{id}/stop?force=bool - Stop a world.
pub(crate) async fn stop_world(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<JsonResponse<WorldResponse>, AppError> {
    let id = validation::world_id(&id)?;
    let world = state
        .supervisor
        .stop(id, query.force)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(
        ApiResponse::ok(WorldResponse::from(world)).with_message("World stopped successfully"),
    ))
}

/// POST /worlds/{id}/command - Send a console command.
pub(crate) async fn send_command(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<JsonResponse<WorldRef>, AppError> {
    let Json(req) = payload?;
    let id = validation::world_id(&id)?;
    let command = validation::command(&req.command)?;

    state
        .supervisor
        .send_command(id, command)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(
        ApiResponse::ok(WorldRef { id: id.to_string() }).with_message("Command sent"),
    ))
}

/// POST /worlds/{id}/auth - Start device authentication.
pub(crate) async fn authenticate_world(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<JsonResponse<WorldRef>, AppError> {
    let id = validation::world_id(&id)?;

    state
        .supervisor
        .authenticate(id)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(
        ApiResponse::ok(WorldRef { id: id.to_string() })
            .with_message("Authentication initiated, check the world logs for the device code"),
    ))
}

/// GET /worlds/{id}/logs?lines=N - Recent output.
pub(crate) async fn get_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<JsonResponse<LogsResponse>, AppError> {
    let id = validation::world_id(&id)?;
    let lines = validation::log_lines(query.lines.as_deref())?;

    let logs = state
        .supervisor
        .logs(id, lines)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(ApiResponse::ok(LogsResponse {
        id: id.to_string(),
        lines,
        logs,
    })))
}

/// GET /worlds/{id}/logs/stream?tail=N - Live output as server-sent events.
pub(crate) async fn stream_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let id = validation::world_id(&id)?;
    let tail = query.tail.unwrap_or(validation::DEFAULT_LOG_LINES);
    let rx = state
        .supervisor
        .follow_stream(id, tail)
        .map_err(|e| state.fail(e))?;
    Ok(sse(rx))
}

/// POST /worlds/stream - Create and start a world, streaming progress.
pub(crate) async fn create_world_stream(
    State(state): State<SharedState>,
    payload: Result<Json<CreateWorldRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let Json(req) = payload?;
    let spec = validation::create_request(req)?;
    Ok(sse(state.supervisor.create_with_stream(spec)))
}

/// POST /worlds/{id}/start/stream - Start a world, streaming progress.
pub(crate) async fn start_world_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let id = validation::world_id(&id)?;
    state.supervisor.status(id).map_err(|e| state.fail(e))?;
    Ok(sse(state.supervisor.start_with_stream(id)))
}
