use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::AppState;
use crate::error::Error;
use crate::models::*;
use crate::registry::RunInfo;

type ApiResult<T> = Result<T, (StatusCode, String)>;

// ============================================================
// Error Handling
// ============================================================

/// Map a core error to a response. Caller mistakes are returned as-is;
/// anything else is logged server-side and the client only sees a generic
/// message.
fn api_error(e: Error) -> (StatusCode, String) {
    let status = match &e {
        Error::Validation(_) | Error::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::ScopeViolation { .. } => StatusCode::FORBIDDEN,
        Error::Conflict(_) | Error::NotReady { .. } => StatusCode::CONFLICT,
        _ => {
            tracing::error!("Internal error: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            );
        }
    };
    tracing::warn!("Request rejected: {}", e);
    (status, e.to_string())
}

fn task_not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "Task not found".to_string())
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Projects
// ============================================================

pub async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Vec<Project>>> {
    state.db().get_all_projects().map(Json).map_err(api_error)
}

pub async fn create_project(
    State(state): State<AppState>,
    Json(input): Json<CreateProjectInput>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    state
        .db()
        .create_project(input)
        .map(|p| (StatusCode::CREATED, Json(p)))
        .map_err(api_error)
}

pub async fn advance_phase(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Project>> {
    state.lifecycle.advance_phase(id).map(Json).map_err(api_error)
}

/// Query parameters for reading a project's audit log.
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Newest N entries, returned oldest first. Defaults to 100.
    pub limit: Option<usize>,
}

pub async fn list_project_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    state
        .db()
        .get_logs_by_project(id, query.limit.unwrap_or(100))
        .map(Json)
        .map_err(api_error)
}

// ============================================================
// Components
// ============================================================

pub async fn create_component(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(input): Json<CreateComponentInput>,
) -> ApiResult<(StatusCode, Json<Component>)> {
    state
        .db()
        .create_component(project_id, input)
        .map(|c| (StatusCode::CREATED, Json(c)))
        .map_err(api_error)
}

pub async fn get_component_tree(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ComponentTreeNode>>> {
    state
        .db()
        .get_component_tree(project_id)
        .map(Json)
        .map_err(api_error)
}

pub async fn delete_component(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let outcome = state
        .lifecycle
        .delete_component(id, state.delete_policy)
        .map_err(api_error)?;

    if outcome.deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, "Component not found".to_string()))
    }
}

// ============================================================
// Tasks
// ============================================================

pub async fn list_component_tasks(
    State(state): State<AppState>,
    Path(component_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Task>>> {
    state
        .db()
        .get_tasks_by_component(component_id)
        .map(Json)
        .map_err(api_error)
}

pub async fn create_task(
    State(state): State<AppState>,
    Path(component_id): Path<Uuid>,
    Json(input): Json<CreateTaskInput>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    state
        .lifecycle
        .create_task(component_id, input)
        .map(|t| (StatusCode::CREATED, Json(t)))
        .map_err(api_error)
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    state
        .db()
        .get_task(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(task_not_found)
}

pub async fn get_task_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProgressSnapshot>> {
    let task = state
        .db()
        .get_task(id)
        .map_err(api_error)?
        .ok_or_else(task_not_found)?;

    state.tracker().progress_of(&task).map(Json).map_err(api_error)
}

/// Execution events survive task deletion, so this never 404s.
pub async fn list_task_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    state.db().get_logs_by_task(id).map(Json).map_err(api_error)
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    state.lifecycle.retry(id).map(Json).map_err(api_error)
}

/// Ask the worker running a task to stop. The task fails as cancelled at the
/// start of the worker's next round.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<RunInfo>)> {
    if state.db().get_task(id).map_err(api_error)?.is_none() {
        return Err(task_not_found());
    }
    if !state.registry.cancel(id) {
        return Err((StatusCode::CONFLICT, "Task is not running".to_string()));
    }

    state
        .registry
        .get(id)
        .map(|run| (StatusCode::ACCEPTED, Json(run)))
        .ok_or((StatusCode::CONFLICT, "Task is not running".to_string()))
}

// ============================================================
// Live progress
// ============================================================

pub async fn list_progress(State(state): State<AppState>) -> Json<Vec<ProgressSnapshot>> {
    Json(state.tracker().snapshots())
}

/// Runs registered in this process, oldest first.
pub async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunInfo>> {
    Json(state.registry.active())
}
