//! Liveness handler.
//!
//! - GET /health -> `{"status":"Ok"}`, never signed and never touching a backend

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "Ok" }))
}
