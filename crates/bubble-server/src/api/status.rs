//! Engine status endpoint.

use axum::extract::State;
use axum::Json;
use bubble_core::{AccessoryId, AppPhase, BubbleState, LinkSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Current engine status.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "version": "0.1.0",
    "uptime_secs": 3600,
    "engine_running": true,
    "bubble": "inside",
    "restriction_active": true,
    "phase": "foreground",
    "background_window_open": true,
    "authoritative_accessory": 1,
    "links": [],
    "generated_at": "2025-05-05T09:00:00Z"
}))]
pub struct StatusResponse {
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Seconds since the engine started.
    #[schema(example = 3600)]
    pub uptime_secs: u64,

    /// Whether the coordinator is still processing events.
    pub engine_running: bool,

    /// Published secure-bubble state.
    pub bubble: BubbleState,

    /// Whether restriction is currently applied.
    pub restriction_active: bool,

    /// Foreground or background.
    pub phase: AppPhase,

    /// Whether background work is currently allowed.
    pub background_window_open: bool,

    /// Accessory whose distances drive the bubble, if any is ranging.
    #[schema(value_type = Option<u32>)]
    pub authoritative_accessory: Option<AccessoryId>,

    /// Every live accessory link.
    pub links: Vec<LinkSnapshot>,

    /// When this snapshot was taken.
    pub generated_at: DateTime<Utc>,
}

/// Get engine status.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "status",
    operation_id = "getStatus",
    summary = "Get engine status",
    description = "Returns the secure-bubble state, the restriction decision, the \
        application phase and the state of every accessory link.",
    responses(
        (status = 200, description = "Status retrieved", body = StatusResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    let engine = &state.engine;
    let watchdog = *engine.watchdog().borrow();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        engine_running: !engine.mailbox().is_closed(),
        bubble: *engine.bubble().borrow(),
        restriction_active: *engine.restriction_active().borrow(),
        phase: watchdog.phase,
        background_window_open: watchdog.window_open,
        authoritative_accessory: *engine.authoritative().borrow(),
        links: engine.links().borrow().clone(),
        generated_at: Utc::now(),
    })
}
