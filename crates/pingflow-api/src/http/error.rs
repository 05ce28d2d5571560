//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pingflow_core::engine::EngineError;
use uuid::Uuid;

use super::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    RunNotFound(Uuid),
    Validation(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::RunNotFound(id) | AppError::Engine(EngineError::RunNotFound(id)) => {
                (StatusCode::NOT_FOUND, "RUN_NOT_FOUND", format!("Run {id} not found"))
            }
            AppError::Engine(e @ (EngineError::DuplicateClaim(_) | EngineError::NotClaimed(_))) => {
                (StatusCode::CONFLICT, "RUN_CLAIMED", e.to_string())
            }
            AppError::Engine(e @ EngineError::Store(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_ERROR", e.to_string())
            }
            AppError::Engine(e @ EngineError::Registration(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }
        let body = ApiResponse::error(code, &message, Uuid::now_v7().to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingflow_types::error::RepositoryError;

    #[test]
    fn status_mapping() {
        let id = Uuid::now_v7();
        assert_eq!(AppError::RunNotFound(id).parts().0, StatusCode::NOT_FOUND);
        assert_eq!(AppError::Engine(EngineError::RunNotFound(id)).parts().1, "RUN_NOT_FOUND");
        assert_eq!(
            AppError::Engine(EngineError::DuplicateClaim(id)).parts().0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Engine(EngineError::Store(RepositoryError::Connection)).parts().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Validation("bad".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
