//! Ranging endpoints.
//!
//! Linux hosts have no platform ranging primitive, so distances measured by an
//! external UWB driver are pushed in over HTTP and delivered to the matching
//! session. The permission probe exercises the same backend.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use bubble_core::{probe_permission, AccessoryId, BubbleError};
use serde::{Deserialize, Serialize};
use tracing::trace;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the ranging router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/permission-probe", post(permission_probe))
        .route("/{unique_id}/distance", post(push_distance))
}

/// A distance measured by the external driver.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "distance_m": 0.35 }))]
pub struct DistanceRequest {
    /// Distance to the accessory in metres.
    #[schema(example = 0.35, minimum = 0.0)]
    pub distance_m: f32,
}

/// Outcome of a permission probe.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PermissionProbeResponse {
    /// Whether ranging is permitted.
    pub granted: bool,
}

/// Probe ranging permission.
#[utoipa::path(
    post,
    path = "/api/ranging/permission-probe",
    tag = "ranging",
    operation_id = "probeRangingPermission",
    summary = "Probe ranging permission",
    description = "Starts a short-lived ranging session bound to no accessory so the \
        platform can ask for permission, then tears it down.",
    responses(
        (status = 200, description = "Permission granted", body = PermissionProbeResponse),
        (status = 403, description = "Permission denied", body = crate::api::ErrorResponse),
        (status = 424, description = "Probe failed", body = crate::api::ErrorResponse)
    )
)]
pub async fn permission_probe(
    State(state): State<SharedState>,
) -> ApiResult<Json<PermissionProbeResponse>> {
    probe_permission(&state.ranging)
        .await
        .map_err(BubbleError::from)?;
    Ok(Json(PermissionProbeResponse { granted: true }))
}

/// Push a distance measurement.
#[utoipa::path(
    post,
    path = "/api/ranging/{unique_id}/distance",
    tag = "ranging",
    operation_id = "pushDistance",
    summary = "Push a distance measurement",
    description = "Delivers one distance sample to the accessory's ranging session. \
        Only the accessory that started ranging first drives the secure bubble.",
    params(("unique_id" = u32, Path, description = "Accessory identifier")),
    request_body = DistanceRequest,
    responses(
        (status = 202, description = "Sample delivered"),
        (status = 400, description = "Invalid distance", body = crate::api::ErrorResponse),
        (status = 404, description = "No ranging session", body = crate::api::ErrorResponse)
    )
)]
pub async fn push_distance(
    State(state): State<SharedState>,
    Path(unique_id): Path<u32>,
    Json(request): Json<DistanceRequest>,
) -> ApiResult<StatusCode> {
    if !request.distance_m.is_finite() || request.distance_m < 0.0 {
        return Err(ApiError::BadRequest {
            error_code: "invalid_distance".to_string(),
            message: "distance_m must be a non-negative number".to_string(),
        });
    }

    let accessory = AccessoryId(unique_id);
    trace!(%accessory, distance_m = request.distance_m, "Distance pushed");
    if state.feed.push_distance(accessory, request.distance_m) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::NotFound {
            error_code: "no_ranging_session".to_string(),
            message: format!("{accessory} has no active ranging session"),
        })
    }
}
