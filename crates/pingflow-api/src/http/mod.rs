//! HTTP/REST API layer for pingflow.
//!
//! Axum-based REST API at `/api/v1/` with an envelope response format and
//! CORS support: event intake plus the read-only run views.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
