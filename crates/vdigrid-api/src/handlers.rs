//! REST API handlers.
//!
//! Each handler reads/writes via the `RecordStore` and returns JSON responses.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ApiState;
use crate::apps::{ApiError, ApplicationRequest, upsert_application};

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// ── Applications ──────────────────────────────────────────────────

/// GET /api/v1/applications
pub async fn list_applications(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_applications() {
        Ok(apps) => ApiResponse::ok(apps).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/applications/{id}
pub async fn get_application(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_application(&id) {
        Ok(Some(app)) => ApiResponse::ok(app).into_response(),
        Ok(None) => error_response("application not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/applications
pub async fn put_application(
    State(state): State<ApiState>,
    Json(req): Json<ApplicationRequest>,
) -> impl IntoResponse {
    match upsert_application(state.store.as_ref(), &req, epoch_secs()) {
        Ok(app) => {
            info!(app = %app.id, "application saved");
            (StatusCode::CREATED, ApiResponse::ok(app)).into_response()
        }
        Err(ApiError::Invalid(msg)) => {
            error_response(&msg, StatusCode::BAD_REQUEST).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// DELETE /api/v1/applications/{id}
pub async fn delete_application(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_application(&id) {
        Ok(true) => {
            info!(app = %id, "application removed");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("application not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Instances ─────────────────────────────────────────────────────

/// GET /api/v1/applications/{id}/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_instances_for_application(&id) {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}
