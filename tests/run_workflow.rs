use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use gantry_core::config::{AppConfig, ServerConfig, StatusConfig};
use gantry_runner::{RunRequest, Runner};
use gantry_status::{CancelStore, FileCancelStore};

const PROMPT_ID: &str = "prompt-e2e-1";

struct MockState {
    prompts_received: AtomicUsize,
    /// Push events go out the moment a prompt is queued; a client that
    /// is not subscribed by then never sees them, same as the real
    /// server.
    events: broadcast::Sender<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            prompts_received: AtomicUsize::new(0),
            events: broadcast::channel(8).0,
        }
    }
}

async fn queue_prompt(State(state): State<Arc<MockState>>, Json(_body): Json<Value>) -> Json<Value> {
    state.prompts_received.fetch_add(1, Ordering::SeqCst);
    let event = json!({
        "type": "executing",
        "data": { "node": null, "prompt_id": PROMPT_ID }
    });
    // No subscribers means the event is simply lost.
    let _ = state.events.send(event.to_string());
    Json(json!({ "prompt_id": PROMPT_ID }))
}

async fn history() -> Json<Value> {
    Json(json!({
        PROMPT_ID: {
            "outputs": {
                "9": {
                    "images": [{ "filename": "result.png", "type": "output" }],
                    "text": ["done"]
                }
            }
        }
    }))
}

async fn object_info() -> Json<Value> {
    Json(json!({ "KSampler": {}, "CheckpointLoaderSimple": {}, "SaveImage": {} }))
}

async fn empty_node_list() -> Json<Value> {
    Json(json!({ "custom_nodes": [] }))
}

async fn empty_model_list() -> Json<Value> {
    Json(json!({ "models": [] }))
}

async fn push_channel(State(state): State<Arc<MockState>>, ws: WebSocketUpgrade) -> Response {
    // Subscribe before the upgrade completes so anything sent after the
    // client's handshake returns is guaranteed to be delivered.
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

async fn forward_events(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    while let Ok(event) = rx.recv().await {
        if socket.send(Message::Text(event.into())).await.is_err() {
            return;
        }
    }
}

async fn spawn_mock() -> (u16, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/prompt", post(queue_prompt))
        .route("/history/{prompt_id}", get(history))
        .route("/object_info", get(object_info))
        .route("/customnode/getmappings", get(|| async { Json(json!({})) }))
        .route("/customnode/getlist", get(empty_node_list))
        .route("/externalmodel/getlist", get(empty_model_list))
        .route("/queue", get(|| async {
            Json(json!({ "queue_running": [], "queue_pending": [] }))
        }))
        .route("/model/install", post(|| async { Json(json!({})) }))
        .route("/ws", get(push_channel))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server");
    });
    (port, state)
}

fn config_for(base_path: &Path, status_log: &Path, port: u16) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            addr: "http://127.0.0.1".into(),
            port,
            base_path: base_path.to_path_buf(),
            ..Default::default()
        },
        status: StatusConfig {
            log_path: status_log.to_path_buf(),
            refresh_interval_secs: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"x").unwrap();
}

fn sampler_graph(ckpt: &str) -> String {
    json!({
        "3": { "class_type": "KSampler", "inputs": { "seed": 1, "model": ["4", 0] } },
        "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": ckpt } },
        "9": { "class_type": "SaveImage", "inputs": { "images": ["3", 0] } }
    })
    .to_string()
}

#[tokio::test]
async fn test_happy_path_collects_outputs_without_installing() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("server");
    touch(&base.join("models/checkpoints/dreamshaper_8.safetensors"));
    touch(&base.join("output/result.png"));
    let out = dir.path().join("collected");

    let (port, state) = spawn_mock().await;
    let config = config_for(&base, &dir.path().join("status.jsonl"), port);

    let mut request = RunRequest::new(sampler_graph("dreamshaper_8.safetensors"), &out);
    request.output_node_ids = vec!["9".to_string()];
    let output = Runner::new(config).run(&request).await.unwrap();

    assert!(!output.cancelled);
    assert!(output.models_not_found.is_empty());
    assert_eq!(output.text_output, vec!["done".to_string()]);
    assert_eq!(output.file_paths.len(), 1);
    assert!(Path::new(&output.file_paths[0]).exists());
    assert!(output.file_paths[0].ends_with("result.png"));

    // The output tree is drained after collection.
    assert!(!base.join("output/result.png").exists());
    assert_eq!(state.prompts_received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_completion_emitted_at_dispatch_time_is_not_missed() {
    // The mock pushes the completion event while /prompt is still being
    // handled, before any post-dispatch subscription could land. A run
    // that subscribes after queueing never sees it and hangs.
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("server");
    touch(&base.join("models/checkpoints/dreamshaper_8.safetensors"));

    let (port, _state) = spawn_mock().await;
    let config = config_for(&base, &dir.path().join("status.jsonl"), port);

    let request = RunRequest::new(
        sampler_graph("dreamshaper_8.safetensors"),
        dir.path().join("collected"),
    );
    let output = tokio::time::timeout(
        Duration::from_secs(10),
        Runner::new(config).run(&request),
    )
    .await
    .expect("run must complete, not wait for an event it already missed")
    .unwrap();

    assert!(!output.cancelled);
    assert!(output.models_not_found.is_empty());
}

#[tokio::test]
async fn test_unknown_model_reports_missing_and_never_dispatches() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("server");
    std::fs::create_dir_all(base.join("models")).unwrap();

    let (port, state) = spawn_mock().await;
    let config = config_for(&base, &dir.path().join("status.jsonl"), port);

    let request = RunRequest::new(
        sampler_graph("ghost_model.safetensors"),
        dir.path().join("collected"),
    );
    let output = Runner::new(config).run(&request).await.unwrap();

    assert!(!output.cancelled);
    assert_eq!(output.models_not_found.len(), 1);
    assert_eq!(output.models_not_found[0].name, "ghost_model.safetensors");
    assert!(output.file_paths.is_empty());
    assert_eq!(state.prompts_received.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ignored_model_on_disk_satisfies_the_reference() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("server");
    touch(&base.join("models/checkpoints/hand_placed.safetensors"));
    touch(&base.join("output/result.png"));
    let out = dir.path().join("collected");

    let (port, state) = spawn_mock().await;
    let config = config_for(&base, &dir.path().join("status.jsonl"), port);

    let mut request = RunRequest::new(sampler_graph("hand_placed.safetensors"), &out);
    request.ignore_models = vec![gantry_core::types::IgnoredModel {
        filename: "hand_placed.safetensors".into(),
        filepath: None,
    }];
    let output = Runner::new(config).run(&request).await.unwrap();

    assert!(output.models_not_found.is_empty());
    assert_eq!(state.prompts_received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_flag_stops_the_run_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let status_log = dir.path().join("status.jsonl");
    // No mock server: a cancelled run must bail out before touching it.
    let config = config_for(&dir.path().join("server"), &status_log, 1);

    let request = RunRequest::new(
        sampler_graph("dreamshaper_8.safetensors"),
        dir.path().join("collected"),
    );

    let store = FileCancelStore::new(&StatusConfig {
        log_path: status_log.clone(),
        refresh_interval_secs: 0,
        ..Default::default()
    });
    store.mark_cancelled(&request.client_id).unwrap();

    let output = Runner::new(config).run(&request).await.unwrap();
    assert!(output.cancelled);
    assert!(output.file_paths.is_empty());
}

#[tokio::test]
async fn test_cancel_generation_with_empty_id_interrupts_immediately() {
    let interrupts = Arc::new(AtomicUsize::new(0));
    let counter = interrupts.clone();
    let app = Router::new().route(
        "/interrupt",
        post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Json(json!({})) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server");
    });

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(
        &dir.path().join("server"),
        &dir.path().join("status.jsonl"),
        port,
    );
    Runner::new(config).cancel_generation("").await.unwrap();
    assert_eq!(interrupts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_with_unreachable_server_still_records_the_flag() {
    let dir = tempfile::tempdir().unwrap();
    let status_log = dir.path().join("status.jsonl");
    // Nothing listens on port 1; every queue poll fails.
    let config = config_for(&dir.path().join("server"), &status_log, 1);

    Runner::new(config)
        .cancel_generation("gen-abc")
        .await
        .expect("an unreachable server must not fail the cancellation");

    let store = FileCancelStore::new(&StatusConfig {
        log_path: status_log,
        refresh_interval_secs: 0,
        ..Default::default()
    });
    assert!(store.is_cancelled("gen-abc"));
}

#[tokio::test]
async fn test_install_model_delegates_to_management_add_on() {
    let (port, _state) = spawn_mock().await;
    let client = gantry_client::ServerClient::new(format!("http://127.0.0.1:{}", port));

    let entry = gantry_client::RemoteModelEntry {
        filename: "dreamshaper_8.safetensors".into(),
        url: "https://example.com/dreamshaper_8.safetensors".into(),
        save_path: "checkpoints".into(),
        model_type: "checkpoints".into(),
    };
    assert!(client.install_model(&entry).await.unwrap());
}

#[test]
fn test_mock_history_shape_matches_client_expectations() {
    // Guards the fixtures above against drifting from the wire shape the
    // client parses.
    let raw = json!({
        PROMPT_ID: { "outputs": { "9": { "images": [{ "filename": "a.png" }] } } }
    });
    let outputs: HashMap<String, Value> =
        serde_json::from_value(raw[PROMPT_ID]["outputs"].clone()).unwrap();
    assert!(outputs.contains_key("9"));
}
