//! Accessory API endpoints.
//!
//! Lists remembered accessories and live links, and lets a client connect,
//! stop ranging with, or forget an accessory. Mutations are posted to the
//! engine and take effect asynchronously.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bubble_core::{AccessoryId, AccessoryRecord, Event, LinkSnapshot, LinkState};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the accessories router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_accessories))
        .route("/{unique_id}", delete(forget_accessory))
        .route("/{unique_id}/connect", post(connect_accessory))
        .route("/{unique_id}/stop", post(stop_accessory))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Remembered accessories and live links.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccessoriesResponse {
    /// Accessories remembered for unattended reconnection, oldest first.
    pub known: Vec<AccessoryRecord>,

    /// Every accessory currently visible or connected.
    pub links: Vec<LinkSnapshot>,
}

/// Acknowledgement for a command posted to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "accepted": true,
    "unique_id": 1,
    "action": "connect"
}))]
pub struct AccessoryCommandResponse {
    /// Always true; the command was queued.
    pub accepted: bool,

    /// Target accessory.
    #[schema(example = 1)]
    pub unique_id: u32,

    /// What was requested.
    #[schema(example = "connect")]
    pub action: String,
}

impl AccessoryCommandResponse {
    fn accepted(unique_id: u32, action: &str) -> (StatusCode, Json<Self>) {
        (
            StatusCode::ACCEPTED,
            Json(Self {
                accepted: true,
                unique_id,
                action: action.to_string(),
            }),
        )
    }
}

fn link(state: &SharedState, unique_id: u32) -> Option<LinkSnapshot> {
    state
        .engine
        .links()
        .borrow()
        .iter()
        .find(|link| link.accessory == AccessoryId(unique_id))
        .cloned()
}

// ============================================================================
// Handlers
// ============================================================================

/// List accessories.
#[utoipa::path(
    get,
    path = "/api/accessories",
    tag = "accessories",
    operation_id = "listAccessories",
    summary = "List accessories",
    description = "Returns the remembered accessories (at most five) and the state of \
        every live link.",
    responses(
        (status = 200, description = "Accessories listed", body = AccessoriesResponse)
    )
)]
pub async fn list_accessories(State(state): State<SharedState>) -> Json<AccessoriesResponse> {
    Json(AccessoriesResponse {
        known: state.engine.known().borrow().clone(),
        links: state.engine.links().borrow().clone(),
    })
}

/// Forget an accessory.
#[utoipa::path(
    delete,
    path = "/api/accessories/{unique_id}",
    tag = "accessories",
    operation_id = "forgetAccessory",
    summary = "Forget an accessory",
    description = "Stops ranging, disconnects, and removes the accessory from the \
        remembered list so it is no longer reconnected automatically.",
    params(("unique_id" = u32, Path, description = "Accessory identifier")),
    responses(
        (status = 202, description = "Forget queued", body = AccessoryCommandResponse),
        (status = 404, description = "Unknown accessory", body = crate::api::ErrorResponse),
        (status = 503, description = "Engine stopped", body = crate::api::ErrorResponse)
    )
)]
pub async fn forget_accessory(
    State(state): State<SharedState>,
    Path(unique_id): Path<u32>,
) -> ApiResult<(StatusCode, Json<AccessoryCommandResponse>)> {
    let known = state
        .engine
        .known()
        .borrow()
        .iter()
        .any(|record| record.unique_id == AccessoryId(unique_id));
    if !known && link(&state, unique_id).is_none() {
        return Err(ApiError::unknown_accessory(unique_id));
    }

    state.engine.post(Event::Forget(AccessoryId(unique_id)))?;
    Ok(AccessoryCommandResponse::accepted(unique_id, "forget"))
}

/// Connect to an accessory.
#[utoipa::path(
    post,
    path = "/api/accessories/{unique_id}/connect",
    tag = "accessories",
    operation_id = "connectAccessory",
    summary = "Connect to an accessory",
    description = "Starts the connect and pairing handshake with a discovered accessory. \
        Ranging starts automatically once the accessory delivers its configuration. \
        On a connected accessory whose pairing was abandoned, a fresh initialize is sent.",
    params(("unique_id" = u32, Path, description = "Accessory identifier")),
    responses(
        (status = 202, description = "Connect queued", body = AccessoryCommandResponse),
        (status = 404, description = "Accessory not visible", body = crate::api::ErrorResponse),
        (status = 409, description = "Already pairing or ranging", body = crate::api::ErrorResponse),
        (status = 503, description = "Engine stopped", body = crate::api::ErrorResponse)
    )
)]
pub async fn connect_accessory(
    State(state): State<SharedState>,
    Path(unique_id): Path<u32>,
) -> ApiResult<(StatusCode, Json<AccessoryCommandResponse>)> {
    let link = link(&state, unique_id).ok_or_else(|| ApiError::unknown_accessory(unique_id))?;
    if !matches!(link.state, LinkState::Discovered | LinkState::Connected) {
        return Err(ApiError::Conflict {
            error_code: "already_connected".to_string(),
            message: format!("{} is already pairing or ranging", link.accessory),
            state: Some(format!("{:?}", link.state)),
        });
    }

    state.engine.post(Event::Connect(AccessoryId(unique_id)))?;
    Ok(AccessoryCommandResponse::accepted(unique_id, "connect"))
}

/// Stop ranging with an accessory.
#[utoipa::path(
    post,
    path = "/api/accessories/{unique_id}/stop",
    tag = "accessories",
    operation_id = "stopAccessory",
    summary = "Stop ranging",
    description = "Tells the accessory to stop transmitting and tears down the local \
        ranging session. The link stays paired.",
    params(("unique_id" = u32, Path, description = "Accessory identifier")),
    responses(
        (status = 202, description = "Stop queued", body = AccessoryCommandResponse),
        (status = 404, description = "Unknown accessory", body = crate::api::ErrorResponse),
        (status = 503, description = "Engine stopped", body = crate::api::ErrorResponse)
    )
)]
pub async fn stop_accessory(
    State(state): State<SharedState>,
    Path(unique_id): Path<u32>,
) -> ApiResult<(StatusCode, Json<AccessoryCommandResponse>)> {
    if link(&state, unique_id).is_none() {
        return Err(ApiError::unknown_accessory(unique_id));
    }

    state.engine.post(Event::Stop(AccessoryId(unique_id)))?;
    Ok(AccessoryCommandResponse::accepted(unique_id, "stop"))
}
