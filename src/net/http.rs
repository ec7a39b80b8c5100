// HTTP API
// Anchor timestamp intake, on-demand position requests and the state snapshot

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower_http::services::ServeDir;
use tracing::debug;

use crate::coordinator::{unix_now, Coordinator, IngestOutcome};
use crate::error::PositionError;
use crate::net::messages::{
    ErrorMessage, PositionMessage, PositionRequest, PositionRequestPayload, TimestampPayload, TimestampResponse,
};
use crate::report::RawReport;

pub type ApiResponse = (StatusCode, Json<Value>);

/// HTTP status for a rejected request
pub fn status_for(e: &PositionError) -> StatusCode {
    if e.is_solver_fault() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::BAD_REQUEST
    }
}

fn error_response(e: &PositionError) -> ApiResponse {
    let body = serde_json::to_value(ErrorMessage::from(e)).unwrap_or(Value::Null);
    (status_for(e), Json(body))
}

fn ok_response<T: serde::Serialize>(body: &T) -> ApiResponse {
    match serde_json::to_value(body) {
        Ok(v) => (StatusCode::OK, Json(v)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "Internal", "message": e.to_string()})),
        ),
    }
}

/// Bodies are parsed here rather than by the Json extractor so that every
/// bad body gets the same MalformedReport shape.
fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, PositionError> {
    serde_json::from_str(body).map_err(|e| PositionError::MalformedReport(format!("invalid JSON body: {}", e)))
}

pub fn router(coordinator: Arc<Coordinator>, work_dir: Option<&str>) -> Router {
    let router = Router::new()
        .route("/api/timestamps", post(post_timestamp))
        .route("/api/calculate_position", post(post_calculate_position))
        .route("/api/state", get(get_state))
        .route("/api/anchors/:anchor_id/reset", post(post_reset_anchor))
        .with_state(coordinator);

    match work_dir {
        Some(dir) => router.nest_service("/state", ServeDir::new(dir)),
        None => router,
    }
}

pub async fn post_timestamp(State(coordinator): State<Arc<Coordinator>>, body: String) -> ApiResponse {
    let report = match parse_body::<TimestampPayload>(&body).and_then(RawReport::try_from) {
        Ok(report) => report,
        Err(e) => {
            debug!("Rejected timestamp body: {}", e);
            return error_response(&e);
        }
    };

    match coordinator.ingest(report, unix_now()).await {
        Ok(outcome) => {
            let position = match outcome {
                IngestOutcome::Position(estimate) => Some(PositionMessage::from_estimate(&estimate, true)),
                _ => None,
            };
            ok_response(&TimestampResponse {
                message: "Timestamp received".to_string(),
                position,
            })
        }
        Err(e) => error_response(&e),
    }
}

pub async fn post_calculate_position(State(coordinator): State<Arc<Coordinator>>, body: String) -> ApiResponse {
    let request = match parse_body::<PositionRequestPayload>(&body).and_then(PositionRequest::try_from) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    match coordinator.calculate_position(&request, unix_now()).await {
        Ok(estimate) => ok_response(&PositionMessage::from_estimate(&estimate, false)),
        Err(e) => error_response(&e),
    }
}

/// Clear an anchor's counter and clock state, e.g. after a `RolloverAmbiguity`.
pub async fn post_reset_anchor(
    State(coordinator): State<Arc<Coordinator>>,
    Path(anchor_id): Path<String>,
) -> ApiResponse {
    match coordinator.reset_anchor(&anchor_id).await {
        Ok(()) => ok_response(&serde_json::json!({"message": "Anchor reset"})),
        Err(e) => error_response(&e),
    }
}

pub async fn get_state(State(coordinator): State<Arc<Coordinator>>) -> ApiResponse {
    ok_response(&coordinator.snapshot().await)
}
