//! Health and status endpoints.
//!
//! `/status` lists every PR the bot has reviewed, oldest first, together with
//! the number of PR locks currently tracked and reviews in flight.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::record_store::ProcessedRecord;
use crate::AppState;

/// Summary statistics for the status page.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct StatusSummary {
    pub processed_prs: usize,
    pub repositories: usize,
    pub tracked_locks: usize,
    pub in_flight_reviews: usize,
}

/// Full status data for rendering.
#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub summary: StatusSummary,
    pub prs: Vec<ProcessedRecord>,
}

impl StatusData {
    pub fn from_records(
        records: Vec<ProcessedRecord>,
        tracked_locks: usize,
        in_flight_reviews: usize,
        version: String,
    ) -> Self {
        let repositories: BTreeSet<&str> = records
            .iter()
            .map(|r| r.repository_name.as_str())
            .collect();

        let summary = StatusSummary {
            processed_prs: records.len(),
            repositories: repositories.len(),
            tracked_locks,
            in_flight_reviews,
        };

        Self {
            version,
            summary,
            prs: records,
        }
    }
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "reviewbot",
        "version": crate::get_bot_version()
    }))
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"status": "error", "message": message})),
    )
        .into_response()
}

/// Check `Authorization: Bearer <token>` when a status token is configured.
#[allow(clippy::result_large_err)]
fn validate_auth(headers: &HeaderMap, auth_token: Option<&str>) -> Result<(), Response> {
    let Some(expected_token) = auth_token else {
        return Ok(());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header.map(|value| value.strip_prefix("Bearer ")) {
        Some(Some(provided_token)) if provided_token == expected_token => Ok(()),
        Some(Some(_)) => Err(unauthorized("Invalid token")),
        Some(None) => Err(unauthorized(
            "Invalid Authorization header format. Expected: Bearer <token>",
        )),
        None => Err(unauthorized(
            "Missing Authorization header. Expected: Bearer <token>",
        )),
    }
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusData>, Response> {
    validate_auth(&headers, state.status_auth_token.as_deref())?;

    let records = state.record_store.list_records().await.map_err(|e| {
        error!("Failed to list review records: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": e.to_string()})),
        )
            .into_response()
    })?;

    Ok(Json(StatusData::from_records(
        records,
        state.dispatcher.locks().len().await,
        state.dispatcher.in_flight(),
        crate::get_bot_version().to_string(),
    )))
}
