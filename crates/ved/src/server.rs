//! HTTP and WebSocket control plane.
//!
//! REST over work units and the attention queue, plus a push channel for the
//! dashboard. JSON is the default; the two operator POSTs also accept
//! `x-www-form-urlencoded` bodies from the dashboard forms and answer with a
//! 303 redirect back to `/`.

use crate::broadcast::Broadcaster;
use crate::dashboard;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::{StateStore, StorageError};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use ve_core::{
    OrchestratorState, StatusLogEntry, WorkUnit, WorkUnitPhase, WorkUnitStatus,
};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub store: Arc<StateStore>,
    pub scheduler: Arc<Scheduler>,
    pub broadcaster: Arc<Broadcaster>,
    pub artifacts: ve_core::ArtifactStore,
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Build the router with every endpoint.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(dashboard_page))
        .route("/status", get(daemon_status))
        .route("/work-units", get(list_work_units).post(create_work_unit))
        .route(
            "/work-units/{chunk}",
            get(get_work_unit).patch(patch_work_unit).delete(delete_work_unit),
        )
        .route("/work-units/{chunk}/history", get(work_unit_history))
        .route("/work-units/{chunk}/answer", axum::routing::post(answer_work_unit))
        .route("/work-units/{chunk}/resolve", axum::routing::post(resolve_work_unit))
        .route("/attention", get(attention_queue))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Wire shapes ---

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn storage_error(e: &StorageError) -> ApiError {
    match e {
        StorageError::UnitNotFound(chunk) => {
            api_error(StatusCode::NOT_FOUND, format!("work unit '{chunk}' not found"))
        }
        StorageError::UnitExists(chunk) => api_error(
            StatusCode::CONFLICT,
            format!("work unit for chunk '{chunk}' already exists"),
        ),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

fn scheduler_error(e: &SchedulerError) -> ApiError {
    match e {
        SchedulerError::Storage(inner) => storage_error(inner),
        SchedulerError::InvalidOperation(msg) => api_error(StatusCode::BAD_REQUEST, msg.clone()),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkUnitRequest {
    pub chunk: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub blocked_by: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PatchWorkUnitRequest {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub blocked_by: Option<Vec<String>>,
    #[serde(default)]
    pub worktree: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    answer: String,
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    other_chunk: String,
    verdict: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
struct WorkUnitsResponse {
    work_units: Vec<WorkUnit>,
}

#[derive(Debug, Serialize)]
struct WorkUnitResponse {
    work_unit: WorkUnit,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    history: Vec<StatusLogEntry>,
}

#[derive(Debug, Serialize)]
struct AttentionItem {
    #[serde(flatten)]
    work_unit: WorkUnit,
    blocking_count: i64,
}

#[derive(Debug, Serialize)]
struct AttentionResponse {
    attention: Vec<AttentionItem>,
}

// --- Handlers ---

async fn dashboard_page(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    let units = state
        .store
        .list_work_units(None)
        .await
        .map_err(|e| storage_error(&e))?;
    let attention = state
        .store
        .attention_queue()
        .await
        .map_err(|e| storage_error(&e))?;
    Ok(Html(dashboard::render(&units, &attention)))
}

async fn daemon_status(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let counts = state
        .store
        .count_by_status()
        .await
        .map_err(|e| storage_error(&e))?;
    let uptime = (Utc::now() - state.started_at).num_milliseconds() as f64 / 1000.0;
    Ok(Json(OrchestratorState {
        running: true,
        pid: Some(std::process::id()),
        uptime_seconds: Some(uptime),
        started_at: Some(state.started_at),
        work_unit_counts: counts,
        config: Some(state.scheduler.config().clone()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

async fn list_work_units(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(WorkUnitStatus::parse(raw).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unknown status '{raw}'"))
        })?),
        None => None,
    };
    let work_units = state
        .store
        .list_work_units(status)
        .await
        .map_err(|e| storage_error(&e))?;
    Ok(Json(WorkUnitsResponse { work_units }))
}

async fn create_work_unit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWorkUnitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.chunk.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "chunk cannot be empty"));
    }
    // The existence probe touches the artifact store on disk; keep it off
    // the event loop.
    let artifacts = state.artifacts.clone();
    let chunk = req.chunk.clone();
    let artifact_exists =
        tokio::task::spawn_blocking(move || artifacts.exists(ve_core::ArtifactKind::Chunk, &chunk))
            .await
            .map_err(|e| {
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("artifact check failed: {e}"),
                )
            })?;
    if !artifact_exists {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("no chunk artifact named '{}'", req.chunk),
        ));
    }

    let mut unit = WorkUnit::new(req.chunk);
    if let Some(phase) = req.phase.as_deref() {
        unit.phase = WorkUnitPhase::parse(phase).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unknown phase '{phase}'"))
        })?;
    }
    if let Some(priority) = req.priority {
        unit.priority = priority;
    }
    if let Some(blocked_by) = req.blocked_by {
        unit.blocked_by = blocked_by;
        if !unit.blocked_by.is_empty() {
            unit.status = WorkUnitStatus::Blocked;
        }
    }

    state
        .store
        .create_work_unit(&unit)
        .await
        .map_err(|e| storage_error(&e))?;
    info!(chunk = %unit.chunk, "work unit created");
    state.broadcaster.work_unit_update(&unit);
    Ok((StatusCode::CREATED, Json(WorkUnitResponse { work_unit: unit })))
}

async fn get_work_unit(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let work_unit = state
        .store
        .get_work_unit(&chunk)
        .await
        .map_err(|e| storage_error(&e))?;
    Ok(Json(WorkUnitResponse { work_unit }))
}

async fn patch_work_unit(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
    Json(req): Json<PatchWorkUnitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut unit = state
        .store
        .get_work_unit(&chunk)
        .await
        .map_err(|e| storage_error(&e))?;

    if let Some(phase) = req.phase.as_deref() {
        unit.phase = WorkUnitPhase::parse(phase).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unknown phase '{phase}'"))
        })?;
    }
    if let Some(status) = req.status.as_deref() {
        let new_status = WorkUnitStatus::parse(status).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unknown status '{status}'"))
        })?;
        if new_status != unit.status {
            // Any explicit transition consumes a stashed operator answer.
            unit.pending_answer = None;
        }
        unit.status = new_status;
    }
    if let Some(blocked_by) = req.blocked_by {
        unit.blocked_by = blocked_by;
    }
    if let Some(worktree) = req.worktree {
        unit.worktree = if worktree.is_empty() {
            None
        } else {
            Some(worktree)
        };
    }

    let work_unit = state
        .store
        .update_work_unit(&unit)
        .await
        .map_err(|e| storage_error(&e))?;
    state.broadcaster.work_unit_update(&work_unit);
    Ok(Json(WorkUnitResponse { work_unit }))
}

async fn delete_work_unit(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .scheduler
        .delete_unit(&chunk)
        .await
        .map_err(|e| scheduler_error(&e))?;
    if deleted {
        info!(chunk, "work unit deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            format!("work unit '{chunk}' not found"),
        ))
    }
}

async fn work_unit_history(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // A unit must exist (or have existed); an empty log for an unknown chunk
    // reads as 404.
    let history = state
        .store
        .status_history(&chunk)
        .await
        .map_err(|e| storage_error(&e))?;
    if history.is_empty() && state.store.try_get_work_unit(&chunk).await.map_err(|e| storage_error(&e))?.is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("work unit '{chunk}' not found"),
        ));
    }
    Ok(Json(HistoryResponse { history }))
}

async fn attention_queue(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let attention = state
        .store
        .attention_queue()
        .await
        .map_err(|e| storage_error(&e))?
        .into_iter()
        .map(|(work_unit, blocking_count)| AttentionItem {
            work_unit,
            blocking_count,
        })
        .collect();
    Ok(Json(AttentionResponse { attention }))
}

/// Whether the request came from a dashboard form (HTML flow, 303 redirect)
/// rather than an API client (JSON, 200).
fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

fn parse_dual<T: serde::de::DeserializeOwned>(headers: &HeaderMap, body: &str) -> Result<T, ApiError> {
    if is_form(headers) {
        serde_urlencoded::from_str(body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid form body: {e}")))
    } else {
        serde_json::from_str(body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))
    }
}

async fn answer_work_unit(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    let req: AnswerBody = parse_dual(&headers, &body)?;
    if req.answer.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "answer cannot be empty"));
    }
    let work_unit = state
        .scheduler
        .answer(&chunk, req.answer)
        .await
        .map_err(|e| scheduler_error(&e))?;

    if is_form(&headers) {
        Ok(Redirect::to("/").into_response())
    } else {
        Ok(Json(WorkUnitResponse { work_unit }).into_response())
    }
}

async fn resolve_work_unit(
    State(state): State<Arc<AppState>>,
    Path(chunk): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    let req: ResolveBody = parse_dual(&headers, &body)?;
    let work_unit = state
        .scheduler
        .resolve_conflict(&chunk, &req.other_chunk, &req.verdict)
        .await
        .map_err(|e| scheduler_error(&e))?;

    if is_form(&headers) {
        Ok(Redirect::to("/").into_response())
    } else {
        Ok(Json(WorkUnitResponse { work_unit }).into_response())
    }
}

// --- WebSocket ---

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    // Snapshot first, so a client never renders from nothing.
    let work_units = state.store.list_work_units(None).await.unwrap_or_default();
    let attention_items: Vec<serde_json::Value> = state
        .store
        .attention_queue()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(unit, blocking_count)| {
            let mut value = serde_json::to_value(&unit).unwrap_or_default();
            if let Some(obj) = value.as_object_mut() {
                obj.insert("blocking_count".to_string(), blocking_count.into());
            }
            value
        })
        .collect();

    let initial = serde_json::json!({
        "type": "initial_state",
        "data": {
            "work_units": work_units,
            "attention_items": attention_items,
        },
    });
    if socket
        .send(Message::Text(initial.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut rx = state.broadcaster.subscribe();
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        // Broken client: drop out silently.
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket client lagged; continuing");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // Inbound frames are ignored; the socket is push-only.
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}
