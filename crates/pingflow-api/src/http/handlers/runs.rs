//! Read-only run views.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use pingflow_types::workflow::{RunFilter, RunState, WorkflowRun};
use serde::Deserialize;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

const MAX_RUN_LIMIT: u32 = 200;

/// Query parameters for listing runs.
#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    /// pending, running, sleeping, completed or failed.
    pub state: Option<String>,
    pub definition: Option<String>,
    /// Maximum number of runs to return (default 20, capped at 200).
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    20
}

/// GET /api/v1/runs/{id} - Full run record including the step memo table.
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let run = state.engine.get_run(&id).await?.ok_or(AppError::RunNotFound(id))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(run, request_id, elapsed).with_link("self", &format!("/api/v1/runs/{id}"));
    Ok(Json(resp))
}

/// GET /api/v1/runs - List runs, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowRun>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let state_filter = query
        .state
        .as_deref()
        .map(str::parse::<RunState>)
        .transpose()
        .map_err(AppError::Validation)?;
    let filter = RunFilter {
        state: state_filter,
        definition_id: query.definition.filter(|d| !d.is_empty()),
    };

    let runs = state
        .engine
        .list_runs(&filter, query.limit.clamp(1, MAX_RUN_LIMIT))
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(runs, request_id, elapsed).with_link("self", "/api/v1/runs");
    Ok(Json(resp))
}
