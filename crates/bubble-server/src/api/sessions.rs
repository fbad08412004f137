//! Session log and daily snapshot endpoints.
//!
//! Read-only views over the persisted restriction and bubble-outside
//! intervals (30 days) and the daily task snapshots (90 days).

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use bubble_core::{DailySnapshot, SessionKind, SessionLogEntry};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the sessions router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/restriction", get(get_restriction_sessions))
        .route("/bubble-outside", get(get_bubble_outside_sessions))
}

/// A session log with its total.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "entries": [{
        "startTime": "2025-05-05T09:00:00Z",
        "endTime": "2025-05-05T09:25:00Z",
        "durationSeconds": 1500.0,
        "relatedTaskId": "focus"
    }],
    "total_seconds": 1500.0
}))]
pub struct SessionsResponse {
    /// Closed intervals, oldest first.
    pub entries: Vec<SessionLogEntry>,

    /// Sum of all durations.
    pub total_seconds: f64,
}

impl SessionsResponse {
    fn new(entries: Vec<SessionLogEntry>) -> Self {
        let total_seconds = entries.iter().map(|entry| entry.duration_seconds).sum();
        Self {
            entries,
            total_seconds,
        }
    }
}

/// Daily task completion snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SnapshotsResponse {
    /// One snapshot per day, oldest first.
    pub snapshots: Vec<DailySnapshot>,
}

/// Get restriction sessions.
#[utoipa::path(
    get,
    path = "/api/sessions/restriction",
    tag = "sessions",
    operation_id = "getRestrictionSessions",
    summary = "Get restriction sessions",
    description = "Returns every interval during which restriction was applied in \
        the last 30 days.",
    responses(
        (status = 200, description = "Sessions retrieved", body = SessionsResponse),
        (status = 500, description = "Log unreadable", body = crate::api::ErrorResponse)
    )
)]
pub async fn get_restriction_sessions(
    State(state): State<SharedState>,
) -> ApiResult<Json<SessionsResponse>> {
    let entries = state.storage.load_sessions(SessionKind::Restriction)?;
    Ok(Json(SessionsResponse::new(entries)))
}

/// Get bubble-outside sessions.
#[utoipa::path(
    get,
    path = "/api/sessions/bubble-outside",
    tag = "sessions",
    operation_id = "getBubbleOutsideSessions",
    summary = "Get bubble-outside sessions",
    description = "Returns every interval spent outside the secure bubble in the \
        last 30 days.",
    responses(
        (status = 200, description = "Sessions retrieved", body = SessionsResponse),
        (status = 500, description = "Log unreadable", body = crate::api::ErrorResponse)
    )
)]
pub async fn get_bubble_outside_sessions(
    State(state): State<SharedState>,
) -> ApiResult<Json<SessionsResponse>> {
    let entries = state.storage.load_sessions(SessionKind::BubbleOutside)?;
    Ok(Json(SessionsResponse::new(entries)))
}

/// Get daily snapshots.
#[utoipa::path(
    get,
    path = "/api/snapshots",
    tag = "sessions",
    operation_id = "getSnapshots",
    summary = "Get daily task snapshots",
    description = "Returns the number of tasks due and completed for each of the last \
        90 days.",
    responses(
        (status = 200, description = "Snapshots retrieved", body = SnapshotsResponse),
        (status = 500, description = "Store unreadable", body = crate::api::ErrorResponse)
    )
)]
pub async fn get_snapshots(State(state): State<SharedState>) -> ApiResult<Json<SnapshotsResponse>> {
    let snapshots = state.storage.load_snapshots()?;
    Ok(Json(SnapshotsResponse { snapshots }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_total_seconds_sums_entries() {
        let start = Utc.with_ymd_and_hms(2025, 5, 5, 9, 0, 0).unwrap();
        let response = SessionsResponse::new(vec![
            SessionLogEntry::new(start, start + chrono::Duration::minutes(10), None),
            SessionLogEntry::new(start, start + chrono::Duration::minutes(5), None),
        ]);
        assert!((response.total_seconds - 900.0).abs() < 1e-9);
    }
}
