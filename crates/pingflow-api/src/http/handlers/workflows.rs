//! Registered workflow definitions.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use pingflow_types::workflow::TriggerConfig;
use serde::Serialize;
use uuid::Uuid;

use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub trigger: TriggerConfig,
    pub steps: Vec<String>,
}

/// GET /api/v1/workflows - Definitions registered with the engine.
pub async fn list_workflows(State(state): State<AppState>) -> Json<ApiResponse<Vec<WorkflowSummary>>> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let summaries = workflow_summaries(&state);

    let elapsed = start.elapsed().as_millis() as u64;
    Json(ApiResponse::success(summaries, request_id, elapsed).with_link("self", "/api/v1/workflows"))
}

pub fn workflow_summaries(state: &AppState) -> Vec<WorkflowSummary> {
    let registry = state.engine.registry();
    registry
        .ids()
        .into_iter()
        .filter_map(|id| registry.get(id))
        .map(|def| WorkflowSummary {
            id: def.id.clone(),
            trigger: def.trigger.clone(),
            steps: def.step_names().map(str::to_string).collect(),
        })
        .collect()
}
