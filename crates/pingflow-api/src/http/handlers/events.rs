//! Event intake.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use pingflow_types::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitEventRequest {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    /// Redelivering with the same key resolves to the same runs.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitEventResponse {
    pub event: String,
    /// One run per matching workflow; empty when nothing listens.
    pub run_ids: Vec<Uuid>,
}

/// POST /api/v1/events - Submit an event and create the matching runs.
pub async fn submit_event(
    State(state): State<AppState>,
    Json(body): Json<SubmitEventRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SubmitEventResponse>>), AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("event name must not be empty".to_string()));
    }

    let mut event = Event::from_json(name, body.data, state.engine.now());
    if let Some(key) = body.idempotency_key.filter(|k| !k.is_empty()) {
        event = event.with_idempotency_key(key);
    }

    let run_ids = state.engine.submit(event).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let mut resp = ApiResponse::success(
        SubmitEventResponse {
            event: name.to_string(),
            run_ids: run_ids.clone(),
        },
        request_id,
        elapsed,
    );
    for id in &run_ids {
        resp = resp.with_link(&id.to_string(), &format!("/api/v1/runs/{id}"));
    }

    Ok((StatusCode::ACCEPTED, Json(resp)))
}
