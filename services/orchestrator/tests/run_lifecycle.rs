//! Integration tests driving the orchestrator end-to-end over the Control
//! API and a loopback ZMQ pilot, against a `wiremock`-stubbed backend.
//! Mirrors the teacher's `tests/http_reads.rs` style (`make_server` helper
//! binding an ephemeral port, `reqwest` against it) generalized from a
//! Postgres-backed server to this orchestrator's backend-REST-plus-ZMQ
//! shape.

use std::sync::Arc;
use std::time::Duration;

use orch_test_utils::MockPilot;
use orchestrator::config::Config;
use orchestrator::supervisor::Supervisor;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(msg_port: u16, backend_url: String) -> Config {
    Config {
        name: "orch-test".to_owned(),
        msg_port,
        backend_url,
        backend_token: "test-token".to_owned(),
        redis_url: None,
        sink_url: "http://localhost:9200".to_owned(),
        log_level: "info".to_owned(),
        resend_interval: Duration::from_secs(5),
        ping_interval: Duration::from_secs(10),
        wait_idle_timeout: Duration::from_millis(200),
        hardware_release_interval: Duration::from_millis(10),
        sink_request_timeout: Duration::from_secs(2),
        queue_capacity: 100,
        data_workers: 1,
        watchdog_enabled: false,
        watchdog_poll_interval: Duration::from_secs(5),
        watchdog_stuck_threshold: Duration::from_secs(30),
        control_api_bind_addr: "127.0.0.1:0".to_owned(),
    }
}

async fn make_server(supervisor: Arc<Supervisor>) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = orchestrator::build_router(supervisor);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// §8 scenario 1: happy-path single-step start. `START /runs/:id/start`
/// resolves the pilot, builds the step-0 task, and sends it before marking
/// the backend running.
#[tokio::test]
async fn start_run_sends_step_zero_task_to_the_resolved_pilot() {
    let backend = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/session-runs/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 7, "session_id": 3, "pilot_id": 2, "subject_key": "bp_s3_r7", "status": "pending"
        })))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/pilots/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 2, "name": "alpha", "ip": null
        })))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "runs": [{ "protocol_id": 1, "subject_key": "bp_s3_r7", "subject_name": "bp_s3_r7" }]
        })))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/session-runs/7/with-progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 7, "session_id": 3, "pilot_id": 2, "subject_key": "bp_s3_r7", "status": "pending",
            "progress": null
        })))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/protocols/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 1,
            "steps": [{ "order_index": 0, "step_name": "warmup", "task_type": "WARMUP", "params": {} }]
        })))
        .mount(&backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/session-runs/7/mark-running"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&backend)
        .await;

    let config = test_config(18_501, backend.uri());
    let supervisor = Supervisor::new(&config, tokio::runtime::Handle::current());
    supervisor.start(&config).expect("gateway should start");

    let pilot = MockPilot::connect("alpha", "tcp://127.0.0.1:18501").expect("pilot should connect");
    pilot
        .handshake("orch-test", "10.0.0.9", vec![])
        .await
        .expect("handshake should send");
    // let the transport thread register the handshake before starting the run
    tokio::time::sleep(Duration::from_millis(200)).await;

    let addr = make_server(Arc::clone(&supervisor)).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/runs/7/start"))
        .send()
        .await
        .expect("start request should succeed");
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], serde_json::json!(true));
    assert_eq!(body["run_id"], serde_json::json!(7));

    let start = pilot.recv_key("START").await.expect("pilot should receive START");
    assert_eq!(start.value["task_type"], serde_json::json!("WARMUP"));
    assert_eq!(start.value["subject"], serde_json::json!("bp_s3_r7"));
    assert_eq!(start.value["run_id"], serde_json::json!(7));
    assert_eq!(start.value["current_trial"], serde_json::json!(0));
}

/// §8 scenario 3: a pilot-reported `TASK_ERROR` hard-stops the pilot and
/// marks the run errored in the backend, without the Control API in the
/// loop at all.
#[tokio::test]
async fn task_error_from_pilot_stops_it_and_marks_the_run_errored() {
    let backend = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/session-runs/by-subject-key/bp_s9_r1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 9, "session_id": 4, "pilot_id": 5, "subject_key": "bp_s9_r1", "status": "running"
        })))
        .mount(&backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/session-runs/9/error"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&backend)
        .await;

    let config = test_config(18_502, backend.uri());
    let supervisor = Supervisor::new(&config, tokio::runtime::Handle::current());
    supervisor.start(&config).expect("gateway should start");

    let pilot = MockPilot::connect("beta", "tcp://127.0.0.1:18502").expect("pilot should connect");
    pilot
        .task_error("orch-test", "bp_s9_r1", "camera disconnected")
        .await
        .expect("task_error should send");

    let stop = pilot.recv_key("STOP").await.expect("pilot should be hard-stopped");
    assert_eq!(stop.key, "STOP");

    // give the backend mock time to observe the POST before the test ends
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!backend.received_requests().await.unwrap().is_empty());
}

/// §8 scenario 1 (continued): once the pilot reports a trial and the backend
/// signals graduation, the controller stops the pilot, waits for it to go
/// idle (via `STATE`), advances the backend step, and - since the protocol
/// has only one step - completes the run.
#[tokio::test]
async fn inc_trial_counter_graduation_stops_pilot_and_completes_the_run() {
    let backend = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/session-runs/by-subject-key/bp_s3_r7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 7, "session_id": 3, "pilot_id": 2, "subject_key": "bp_s3_r7", "status": "running"
        })))
        .mount(&backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/runs/7/progress/increment"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "should_graduate": true, "current_trial": 1, "current_step": 0
        })))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/pilots/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 2, "name": "alpha", "ip": null
        })))
        .mount(&backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/runs/7/progress/advance_step"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "finished": true, "current_step": null
        })))
        .mount(&backend)
        .await;
    Mock::given(method("POST"))
        .and(path("/session-runs/7/complete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&backend)
        .await;

    let config = test_config(18_504, backend.uri());
    let supervisor = Supervisor::new(&config, tokio::runtime::Handle::current());
    supervisor.start(&config).expect("gateway should start");

    let pilot = MockPilot::connect("alpha", "tcp://127.0.0.1:18504").expect("pilot should connect");
    pilot
        .handshake("orch-test", "10.0.0.9", vec![])
        .await
        .expect("handshake should send");
    tokio::time::sleep(Duration::from_millis(100)).await;

    pilot
        .inc_trial("orch-test", "bp_s3_r7")
        .await
        .expect("inc_trial should send");

    let stop = pilot.recv_key("STOP").await.expect("pilot should receive STOP");
    assert_eq!(stop.key, "STOP");

    // Report IDLE so `wait_for_idle` returns immediately instead of timing out.
    pilot.state("orch-test", "IDLE").await.expect("state should send");

    // give the controller time to observe IDLE, advance the step, and complete the run
    tokio::time::sleep(Duration::from_millis(300)).await;

    let requests = backend.received_requests().await.unwrap();
    assert!(requests
        .iter()
        .any(|r| r.url.path() == "/runs/7/progress/advance_step"));
    assert!(requests
        .iter()
        .any(|r| r.url.path() == "/session-runs/7/complete"));
}

/// §8 scenario 6: identity resolution by IP when the backend's pilot name
/// doesn't match any registered pilot directly, but a handshake recorded
/// that IP under a different local identity.
#[tokio::test]
async fn pilots_live_reports_handshake_identity_and_ip() {
    let backend = MockServer::start().await;
    let config = test_config(18_503, backend.uri());
    let supervisor = Supervisor::new(&config, tokio::runtime::Handle::current());
    supervisor.start(&config).expect("gateway should start");

    let pilot = MockPilot::connect("pilot_rpi_9", "tcp://127.0.0.1:18503").expect("pilot should connect");
    pilot
        .handshake("orch-test", "192.0.2.9", vec![])
        .await
        .expect("handshake should send");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let addr = make_server(Arc::clone(&supervisor)).await;
    let resp = reqwest::get(format!("http://{addr}/pilots/live")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["pilot_rpi_9"]["ip"], serde_json::json!("192.0.2.9"));
    assert_eq!(body["pilot_rpi_9"]["connected"], serde_json::json!(true));

    let resolved = supervisor
        .registry
        .resolve_pilot_key(Some("rpi_9"), None)
        .await
        .expect("prefixed lookup should resolve");
    assert_eq!(resolved, "pilot_rpi_9");
}
