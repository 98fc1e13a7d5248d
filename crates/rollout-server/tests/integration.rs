use axum::http::StatusCode;
use http_body_util::BodyExt;
use rollout_core::apply::MemoryChannel;
use rollout_core::engine::RunDb;
use rollout_core::store::MemoryStore;
use rollout_core::types::Artifact;
use rollout_core::{Engine, EngineSettings};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    _dir: TempDir,
    engine: Engine,
    store: MemoryStore,
    channel: MemoryChannel,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = RunDb::open(&dir.path().join("runs.db")).unwrap();
    let store = MemoryStore::new();
    let channel = MemoryChannel::new();

    let mut settings = EngineSettings::default();
    settings.engine.poll_interval_ms = 10;
    settings.engine.activity.initial_backoff_ms = 10;
    settings.engine.activity.max_attempts = 3;

    let engine = Engine::new(
        db,
        Arc::new(store.clone()),
        Arc::new(channel.clone()),
        settings,
    );
    Fixture {
        _dir: dir,
        engine,
        store,
        channel,
    }
}

fn app(f: &Fixture) -> axum::Router {
    rollout_server::build_router(f.engine.clone())
}

fn art(obj: &str, checksum: &str, label: &str, storage: &str) -> Artifact {
    Artifact {
        object_id: obj.into(),
        checksum: checksum.into(),
        display_label: label.into(),
        storage_id: storage.into(),
        updated_at: None,
    }
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn wait_for_state(app: axum::Router, id: &str, state: &str) -> serde_json::Value {
    for _ in 0..200 {
        let (status, body) = get(app.clone(), &format!("/api/runs/{id}")).await;
        if status == StatusCode::OK && body["state"]["state"] == state {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run {id} never reached {state}");
}

async fn seed_feature_x(f: &Fixture) {
    f.store
        .set_branch("feature-x", vec![art("R1", "c2", "router1", "s2")])
        .await;
    f.store
        .set_branch("main", vec![art("R1", "c1", "router1", "s1")])
        .await;
    f.store.set_rendered("router1", "c2", "s2").await;
    f.store.put_content("s2", "system:\n  name: router1\n").await;
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn proposed_change_round_trip() {
    let f = fixture();
    seed_feature_x(&f).await;

    let (status, body) = post_json(
        app(&f),
        "/proposed_change_workflow",
        serde_json::json!({"data": {"proposed_change_id": "42", "branch": "feature-x"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Workflow proposed-change-42 started.");

    let waiting = wait_for_state(app(&f), "proposed-change-42", "awaiting_readiness").await;
    assert_eq!(waiting["live"], true);
    assert!(f.channel.applied().await.is_empty());

    let (status, body) = post_json(
        app(&f),
        "/artifact_updated",
        serde_json::json!({"data": {"target_id": "R1", "checksum": "c2"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Signalled 1 running workflows");

    let done = wait_for_state(app(&f), "proposed-change-42", "gathered").await;
    assert_eq!(done["state"]["result"]["router1"]["/"][0], "NO CHANGES");
    assert_eq!(f.channel.applied().await.len(), 1);
}

#[tokio::test]
async fn duplicate_trigger_returns_409() {
    let f = fixture();
    seed_feature_x(&f).await;
    let payload = serde_json::json!({"data": {"proposed_change_id": "7", "branch": "feature-x"}});

    let (status, _) = post_json(app(&f), "/proposed_change_workflow", payload.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_json(app(&f), "/proposed_change_workflow", payload).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("proposed-change-7"));
}

#[tokio::test]
async fn top_level_branch_is_accepted() {
    let f = fixture();
    let (status, body) = post_json(
        app(&f),
        "/proposed_change_workflow",
        serde_json::json!({"branch": "feature-y", "data": {"proposed_change_id": 9}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Workflow proposed-change-9 started.");

    let (_, run) = get(app(&f), "/api/runs/proposed-change-9").await;
    assert_eq!(run["request"]["branch"], "feature-y");
}

#[tokio::test]
async fn missing_fields_return_400() {
    let f = fixture();
    let (status, body) = post_json(
        app(&f),
        "/proposed_change_workflow",
        serde_json::json!({"data": {"proposed_change_id": "1"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("data.branch"));

    let (status, _) = post_json(
        app(&f),
        "/artifact_updated",
        serde_json::json!({"data": {"target_id": "R1"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn portkey_configures_device() {
    let f = fixture();
    f.store.set_device_name("R9", "router9").await;
    f.store.set_rendered("router9", "c9", "s9").await;
    f.store.put_content("s9", "a: 1\n").await;

    let (status, body) = post_json(
        app(&f),
        "/portkey_workflow",
        serde_json::json!({"data": {"target_id": "R9", "checksum": "c9"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Workflow portkey-R9 started.");

    let done = wait_for_state(app(&f), "portkey-R9", "gathered").await;
    assert!(done["children"]["router9-portkey-R9"].is_object());
}

#[tokio::test]
async fn signal_with_no_runs_is_acknowledged() {
    let f = fixture();
    let (status, body) = post_json(
        app(&f),
        "/artifact_updated",
        serde_json::json!({"data": {"target_id": "R1", "checksum": "c2"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Signalled 0 running workflows");
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runs_list_and_unknown_run() {
    let f = fixture();
    let (status, body) = get(app(&f), "/api/runs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));

    seed_feature_x(&f).await;
    post_json(
        app(&f),
        "/proposed_change_workflow",
        serde_json::json!({"data": {"proposed_change_id": "1", "branch": "feature-x"}}),
    )
    .await;

    let (_, body) = get(app(&f), "/api/runs").await;
    let runs = body.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["id"], "proposed-change-1");
    assert_eq!(runs[0]["kind"], "proposed_change");

    let (status, body) = get(app(&f), "/api/runs/portkey-nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("portkey-nope"));
}
