//! OpenAPI specification generation for the bubble API.
//!
//! The document is served at `/api/openapi.json`, rendered by Swagger UI at
//! `/swagger-ui`, and written to disk by the `gen-openapi` binary.

use axum::Json;
use utoipa::OpenApi;

use bubble_core::{
    AccessoryRecord, AppPhase, BubbleState, DailySnapshot, HealthResponse, LinkSnapshot,
    LinkState, RangingErrorKind, RegionEvent, SessionLogEntry,
};

use super::accessories::{AccessoriesResponse, AccessoryCommandResponse};
use super::error::ErrorResponse;
use super::events::{EventAccepted, LifecycleRequest, RegionRequest};
use super::ranging::{DistanceRequest, PermissionProbeResponse};
use super::sessions::{SessionsResponse, SnapshotsResponse};
use super::status::StatusResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as a string (for writing to file).
/// Used by the gen-openapi binary.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for bubble.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "bubble API",
        version = "0.1.0",
        description = r#"
# bubble API

bubble restricts distracting apps while you are inside your focus area and
still have tasks due today.

## Overview

The daemon talks to a UWB accessory over Bluetooth LE, ranges against it, and
classifies each distance into a hysteresis "secure bubble". Restriction is
applied when you are inside the bubble and today's tasks call for it, and
lifted when you leave or finish your tasks.

1. **Status**: bubble state, restriction decision and accessory links
2. **Accessories**: connect, stop, forget
3. **Sessions**: restriction and bubble-outside history, daily task snapshots
4. **Events**: task, geofence and lifecycle triggers
5. **Ranging**: distance input from an external UWB driver
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local bubble daemon")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "status", description = "Engine state snapshot"),
        (name = "accessories", description = "Remembered accessories and live links"),
        (name = "sessions", description = "Session logs and daily snapshots"),
        (name = "events", description = "Triggers from external collaborators"),
        (name = "ranging", description = "Distance input and permission probing")
    ),
    paths(
        super::health::health_check,
        super::status::get_status,
        super::accessories::list_accessories,
        super::accessories::forget_accessory,
        super::accessories::connect_accessory,
        super::accessories::stop_accessory,
        super::sessions::get_restriction_sessions,
        super::sessions::get_bubble_outside_sessions,
        super::sessions::get_snapshots,
        super::events::tasks_changed,
        super::events::task_completed,
        super::events::region,
        super::events::lifecycle,
        super::ranging::permission_probe,
        super::ranging::push_distance,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            StatusResponse,
            BubbleState,
            AppPhase,
            LinkState,
            LinkSnapshot,
            RangingErrorKind,
            AccessoryRecord,
            AccessoriesResponse,
            AccessoryCommandResponse,
            SessionLogEntry,
            SessionsResponse,
            DailySnapshot,
            SnapshotsResponse,
            RegionEvent,
            RegionRequest,
            LifecycleRequest,
            EventAccepted,
            DistanceRequest,
            PermissionProbeResponse,
        )
    )
)]
pub struct ApiDoc;
