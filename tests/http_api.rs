//! HTTP surface tests: session control and instrument status over a real
//! listener.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use webpdtool::engine::{DispatcherDeps, ExecutorDeps, TestEngine};
use webpdtool::handlers::{AutoPassGate, HandlerRegistry, MockSfcClient};
use webpdtool::instruments::transport::StdTransportFactory;
use webpdtool::instruments::{DriverRegistry, InstrumentManager};
use webpdtool::model::{LimitType, TestPoint, ValueType};
use webpdtool::server::{router, AppState};
use webpdtool::storage::{InMemoryPlanRepository, InMemoryResultRepository, NoopReportSink};

fn echo_point(item_no: i32, name: &str, reply: &str) -> TestPoint {
    TestPoint {
        id: item_no.to_string(),
        item_no,
        item_name: name.to_string(),
        item_key: None,
        execute_name: "Other".to_string(),
        switch_mode: None,
        parameters: BTreeMap::new(),
        command: Some(reply.to_string()),
        timeout_ms: None,
        wait_msec: None,
        use_result: None,
        lower_limit: None,
        upper_limit: None,
        eq_limit: Some(reply.to_string()),
        limit_type: LimitType::Equality,
        value_type: ValueType::String,
        unit: None,
        enabled: true,
        sequence_order: item_no,
    }
}

async fn serve(points: Vec<TestPoint>) -> String {
    let plans = Arc::new(InMemoryPlanRepository::new());
    plans.set_plan("st1", points).await;
    let repo = Arc::new(InMemoryResultRepository::new());
    let instruments = Arc::new(InstrumentManager::new(
        DriverRegistry::with_defaults(),
        vec![],
        Duration::from_millis(300),
    ));

    let engine = TestEngine::new(ExecutorDeps {
        dispatcher: DispatcherDeps {
            handlers: Arc::new(HandlerRegistry::with_defaults()),
            instruments,
            transports: Arc::new(StdTransportFactory::default()),
            operator: Arc::new(AutoPassGate),
            sfc: Arc::new(MockSfcClient::passing()),
            repository: repo.clone(),
            default_timeout_ms: 1_000,
            max_timeout_ms: 30_000,
        },
        plans,
        repository: repo,
        report: Arc::new(NoopReportSink),
        repository_retries: 3,
    });

    let app = router(AppState {
        engine,
        progress_poll_ms: 50,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn wait_terminal(client: &reqwest::Client, base: &str, id: &str) -> serde_json::Value {
    for _ in 0..100 {
        let status: serde_json::Value = client
            .get(format!("{base}/sessions/{id}/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        match status["status"].as_str() {
            Some("PENDING") | Some("RUNNING") => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            _ => return status,
        }
    }
    panic!("session never reached a terminal state");
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let base = serve(vec![echo_point(1, "p1", "OK"), echo_point(2, "p2", "OK")]).await;
    let client = reqwest::Client::new();

    // Create: 201 + PENDING.
    let response = client
        .post(format!("{base}/sessions"))
        .json(&serde_json::json!({
            "serial_number": "SN0042",
            "station_id": "st1",
            "run_all_test": false,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let created: serde_json::Value = response.json().await.unwrap();
    assert_eq!(created["status"], "PENDING");
    let id = created["session_id"].as_str().unwrap().to_string();

    // Start: 200.
    let response = client
        .post(format!("{base}/sessions/{id}/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let status = wait_terminal(&client, &base, &id).await;
    assert_eq!(status["status"], "COMPLETED");
    assert_eq!(status["final_result"], "PASS");
    assert_eq!(status["executed"], 2);
    assert_eq!(status["pass_items"], 2);

    // Results: 200, two ordered rows.
    let rows: serde_json::Value = client
        .get(format!("{base}/sessions/{id}/results"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 2);
    assert_eq!(rows[0]["item_name"], "p1");
    assert_eq!(rows[0]["result"], "PASS");

    // Start on a terminal session: 409 with the current status.
    let response = client
        .post(format!("{base}/sessions/{id}/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let base = serve(vec![echo_point(1, "p1", "OK")]).await;
    let client = reqwest::Client::new();

    // Unknown station on create.
    let response = client
        .post(format!("{base}/sessions"))
        .json(&serde_json::json!({
            "serial_number": "SN0042",
            "station_id": "nowhere",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // Unknown session id.
    let ghost = uuid::Uuid::new_v4();
    let response = client
        .get(format!("{base}/sessions/{ghost}/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // Unknown instrument reset.
    let response = client
        .post(format!("{base}/measurements/instruments/GHOST_1/reset"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn validation_errors_are_bad_requests() {
    let base = serve(vec![echo_point(1, "p1", "OK")]).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/sessions"))
        .json(&serde_json::json!({
            "serial_number": "",
            "station_id": "st1",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn testplan_read_path_filters_enabled_points() {
    let mut disabled = echo_point(2, "off", "OK");
    disabled.enabled = false;
    let base = serve(vec![echo_point(1, "on", "OK"), disabled]).await;
    let client = reqwest::Client::new();

    let rows: serde_json::Value = client
        .get(format!("{base}/stations/st1/testplan"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["item_name"], "on");

    let rows: serde_json::Value = client
        .get(format!("{base}/stations/st1/testplan?enabled_only=false"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 2);

    let response = client
        .get(format!("{base}/stations/ghost/testplan"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthz_reports_instruments() {
    let base = serve(vec![echo_point(1, "p1", "OK")]).await;
    let body: serde_json::Value = reqwest::get(format!("{base}/healthz"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["instruments"], 0);
}
