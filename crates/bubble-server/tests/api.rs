//! HTTP API tests against a running engine and a simulated accessory.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use bubble_core::{
    mailbox, Config, Event, FirmwareBehavior, PeripheralId, RadioEvent, SimulatedAccessory,
};
use bubble_server::api::create_router;
use bubble_server::state::{AppState, Running, SharedState};
use serde_json::{json, Value};
use tempfile::TempDir;

struct Fixture {
    server: TestServer,
    state: SharedState,
    _dir: TempDir,
}

fn start() -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = Some(dir.path().to_path_buf());

    let (mailbox, inbox) = mailbox();
    let radio = SimulatedAccessory::new(
        PeripheralId::new("00:00:00:00:B0:B0"),
        "Simulated Tag",
        FirmwareBehavior::default(),
        mailbox.clone(),
    );
    mailbox.post(Event::Radio(RadioEvent::PoweredOn));

    let Running { state, .. } =
        AppState::start_with_radio(config, Arc::new(radio), (mailbox, inbox)).unwrap();
    let server = TestServer::new(create_router(state.clone())).unwrap();
    Fixture {
        server,
        state,
        _dir: dir,
    }
}

/// Poll the status endpoint until `check` holds.
async fn wait_for_status(server: &TestServer, check: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..200 {
        let status: Value = server.get("/api/status").await.json();
        if check(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status never reached the expected shape");
}

fn first_link_state(status: &Value) -> Option<&str> {
    status["links"].get(0)?["state"].as_str()
}

#[tokio::test]
async fn test_health_reports_ok() {
    let f = start();
    let response = f.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_status_starts_outside_without_restriction() {
    let f = start();
    let status: Value = f.server.get("/api/status").await.json();
    assert_eq!(status["bubble"], "outside");
    assert_eq!(status["restriction_active"], false);
    assert_eq!(status["phase"], "foreground");
    assert_eq!(status["engine_running"], true);
}

#[tokio::test]
async fn test_simulated_accessory_is_listed_after_scan() {
    let f = start();
    wait_for_status(&f.server, |s| first_link_state(s) == Some("discovered")).await;

    let body: Value = f.server.get("/api/accessories").await.json();
    assert_eq!(body["links"][0]["accessory"], 1);
    assert_eq!(body["links"][0]["name"], "Simulated Tag");
    assert!(body["known"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_unknown_accessory_is_not_found() {
    let f = start();
    let response = f.server.post("/api/accessories/99/connect").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"], "unknown_accessory");
}

#[tokio::test]
async fn test_connect_ranges_and_distance_moves_bubble_inside() {
    let f = start();
    wait_for_status(&f.server, |s| first_link_state(s) == Some("discovered")).await;

    f.server
        .post("/api/accessories/1/connect")
        .await
        .assert_status(StatusCode::ACCEPTED);
    wait_for_status(&f.server, |s| first_link_state(s) == Some("ranging")).await;

    let again = f.server.post("/api/accessories/1/connect").await;
    again.assert_status(StatusCode::CONFLICT);

    f.server
        .post("/api/ranging/1/distance")
        .json(&json!({ "distance_m": 0.1 }))
        .await
        .assert_status(StatusCode::ACCEPTED);
    let status = wait_for_status(&f.server, |s| s["bubble"] == "inside").await;
    assert_eq!(status["authoritative_accessory"], 1);

    let body: Value = f.server.get("/api/accessories").await.json();
    assert_eq!(body["known"][0]["uniqueId"], 1);
}

#[tokio::test]
async fn test_distance_without_session_is_not_found() {
    let f = start();
    let response = f
        .server
        .post("/api/ranging/1/distance")
        .json(&json!({ "distance_m": 0.4 }))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"], "no_ranging_session");
}

#[tokio::test]
async fn test_negative_distance_is_rejected() {
    let f = start();
    let response = f
        .server
        .post("/api/ranging/1/distance")
        .json(&json!({ "distance_m": -1.0 }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_distance");
}

#[tokio::test]
async fn test_permission_probe_grants_by_default() {
    let f = start();
    let body: Value = f.server.post("/api/ranging/permission-probe").await.json();
    assert_eq!(body["granted"], true);
}

#[tokio::test]
async fn test_events_are_accepted() {
    let f = start();

    let response = f.server.post("/api/events/tasks-changed").await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["event"], "tasks_changed");

    f.server
        .post("/api/events/region")
        .json(&json!({ "event": "entered" }))
        .await
        .assert_status(StatusCode::ACCEPTED);

    f.server
        .post("/api/events/lifecycle")
        .json(&json!({ "phase": "background" }))
        .await
        .assert_status(StatusCode::ACCEPTED);
    wait_for_status(&f.server, |s| s["phase"] == "background").await;
}

#[tokio::test]
async fn test_session_logs_start_empty() {
    let f = start();
    for path in ["/api/sessions/restriction", "/api/sessions/bubble-outside"] {
        let body: Value = f.server.get(path).await.json();
        assert!(body["entries"].as_array().unwrap().is_empty());
        assert_eq!(body["total_seconds"], 0.0);
    }
    let body: Value = f.server.get("/api/snapshots").await.json();
    assert!(body["snapshots"].is_array());
}

#[tokio::test]
async fn test_events_after_shutdown_are_unavailable() {
    let f = start();
    f.state.engine.post(Event::Shutdown).unwrap();
    wait_for_status(&f.server, |s| s["engine_running"] == false).await;

    let response = f.server.post("/api/events/task-completed").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);

    let health: Value = f.server.get("/health").await.json();
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let f = start();
    let body: Value = f.server.get("/api/openapi.json").await.json();
    assert_eq!(body["info"]["title"], "bubble API");
    assert!(body["paths"]["/api/ranging/{unique_id}/distance"].is_object());
}
