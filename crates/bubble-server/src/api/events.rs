//! Event trigger endpoints.
//!
//! External collaborators (the task store, the geofence, the host application
//! lifecycle) notify the engine through these routes. Every trigger is queued
//! to the coordinator and acknowledged with `202 Accepted`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use bubble_core::{AppPhase, Event, RegionEvent};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the events router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/tasks-changed", post(tasks_changed))
        .route("/task-completed", post(task_completed))
        .route("/region", post(region))
        .route("/lifecycle", post(lifecycle))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Geofence transition.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "event": "entered" }))]
pub struct RegionRequest {
    /// Entered or left the home region.
    pub event: RegionEvent,
}

/// Application lifecycle change.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "phase": "background" }))]
pub struct LifecycleRequest {
    /// New phase.
    pub phase: AppPhase,
}

/// Acknowledgement for a queued event.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "accepted": true, "event": "tasks_changed" }))]
pub struct EventAccepted {
    /// Always true; the event was queued.
    pub accepted: bool,

    /// Event name.
    #[schema(example = "tasks_changed")]
    pub event: String,
}

type Accepted = (StatusCode, Json<EventAccepted>);

fn accepted(event: &str) -> Accepted {
    (
        StatusCode::ACCEPTED,
        Json(EventAccepted {
            accepted: true,
            event: event.to_string(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Tasks changed.
#[utoipa::path(
    post,
    path = "/api/events/tasks-changed",
    tag = "events",
    operation_id = "tasksChanged",
    summary = "Notify that tasks changed",
    description = "Re-evaluates the restriction decision against the current task list.",
    responses(
        (status = 202, description = "Event queued", body = EventAccepted),
        (status = 503, description = "Engine stopped", body = crate::api::ErrorResponse)
    )
)]
pub async fn tasks_changed(State(state): State<SharedState>) -> ApiResult<Accepted> {
    state.engine.post(Event::TasksChanged)?;
    Ok(accepted("tasks_changed"))
}

/// A task was completed.
#[utoipa::path(
    post,
    path = "/api/events/task-completed",
    tag = "events",
    operation_id = "taskCompleted",
    summary = "Notify that a task was completed",
    description = "Lifts restriction if every task due today is now complete.",
    responses(
        (status = 202, description = "Event queued", body = EventAccepted),
        (status = 503, description = "Engine stopped", body = crate::api::ErrorResponse)
    )
)]
pub async fn task_completed(State(state): State<SharedState>) -> ApiResult<Accepted> {
    state.engine.post(Event::TaskCompleted)?;
    Ok(accepted("task_completed"))
}

/// Geofence transition.
#[utoipa::path(
    post,
    path = "/api/events/region",
    tag = "events",
    operation_id = "regionEvent",
    summary = "Report a geofence transition",
    description = "Entering the home region starts reconnection to known accessories. \
        It never changes the bubble state by itself.",
    request_body = RegionRequest,
    responses(
        (status = 202, description = "Event queued", body = EventAccepted),
        (status = 503, description = "Engine stopped", body = crate::api::ErrorResponse)
    )
)]
pub async fn region(
    State(state): State<SharedState>,
    Json(request): Json<RegionRequest>,
) -> ApiResult<Accepted> {
    state.engine.post(Event::Region(request.event))?;
    Ok(accepted(match request.event {
        RegionEvent::Entered => "region_entered",
        RegionEvent::Exited => "region_exited",
    }))
}

/// Lifecycle change.
#[utoipa::path(
    post,
    path = "/api/events/lifecycle",
    tag = "events",
    operation_id = "lifecycleEvent",
    summary = "Report a foreground/background change",
    description = "Switches the watchdog between the one-minute foreground tick and the \
        background execution window with five-minute follow-ups.",
    request_body = LifecycleRequest,
    responses(
        (status = 202, description = "Event queued", body = EventAccepted),
        (status = 503, description = "Engine stopped", body = crate::api::ErrorResponse)
    )
)]
pub async fn lifecycle(
    State(state): State<SharedState>,
    Json(request): Json<LifecycleRequest>,
) -> ApiResult<Accepted> {
    state.engine.post(Event::Lifecycle(request.phase))?;
    Ok(accepted(match request.phase {
        AppPhase::Foreground => "foreground",
        AppPhase::Background => "background",
    }))
}
