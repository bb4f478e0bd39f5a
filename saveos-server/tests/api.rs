use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use saveos_server::archive::ScriptedRunner;
use saveos_server::config::AppConfig;
use saveos_server::db;
use saveos_server::routes::create_router;
use saveos_server::services::dispatcher::Dispatcher;
use saveos_server::services::worker;
use saveos_server::state::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct TestServer {
    _dir: tempfile::TempDir,
    app: Router,
    cancel: CancellationToken,
}

impl TestServer {
    fn start(runner: Arc<ScriptedRunner>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::with_data_dir(dir.path().to_path_buf());
        config.worker_count = 1;
        config.default_passphrase = Some("integration".into());

        let pool = db::create_pool(&config.db_path).unwrap();
        db::migrate(&pool).unwrap();
        let (dispatcher, rx) = Dispatcher::new(config.queue_capacity);
        let state = Arc::new(AppState::new(pool, config, dispatcher, runner));

        let cancel = CancellationToken::new();
        worker::start_workers(state.clone(), rx, cancel.clone());

        Self {
            _dir: dir,
            app: create_router(state),
            cancel,
        }
    }

    async fn call(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn wait_for_terminal(&self, job_id: i64, token: &str) -> Value {
        let uri = format!("/api/v1/jobs/{job_id}");
        for _ in 0..250 {
            let (status, job) = self.call("GET", &uri, Some(token), None).await;
            assert_eq!(status, StatusCode::OK);
            if job["status"] == "completed" || job["status"] == "failed" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} did not finish");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

const CREATE_STATS: &str = "\
Archive name: h1_20240101_000000
                       Original size      Compressed size    Deduplicated size
This archive:                  2.00 MB              1.50 MB            512.00 kB
";

#[tokio::test]
async fn backup_lifecycle_end_to_end() {
    let runner = Arc::new(ScriptedRunner::new());
    runner
        .push_ok("", "") // init
        .push_ok("", CREATE_STATS) // create
        .push_ok(r#"{"archives": []}"#, "") // list
        .push_exit(2, "/nonexistent: [Errno 2] No such file or directory"); // second create
    let server = TestServer::start(runner.clone());

    // Register
    let (status, agent) = server
        .call(
            "POST",
            "/api/v1/agents/register",
            None,
            Some(json!({"hostname": "h1", "platform": "linux"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(agent["status"], "active");
    let agent_id = agent["id"].as_i64().unwrap();
    let token = agent["token"].as_str().unwrap().to_string();
    assert!(!token.is_empty());

    // Successful backup
    let (status, job) = server
        .call(
            "POST",
            "/api/v1/backup",
            Some(&token),
            Some(json!({"agent_id": agent_id, "type": "backup", "config": {"source_paths": ["/etc"]}})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "pending");
    assert!(job["started_at"].is_null());

    let done = server.wait_for_terminal(job["id"].as_i64().unwrap(), &token).await;
    assert_eq!(done["status"], "completed");
    assert!(done["snapshot_id"].is_i64());
    assert!(done["finished_at"].is_string());

    let uri = format!("/api/v1/backup/{agent_id}/snapshots");
    let (status, snapshots) = server.call("GET", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let snapshots = snapshots.as_array().unwrap().clone();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0]["id"], done["snapshot_id"]);
    assert_eq!(snapshots[0]["job_id"], done["id"]);
    assert_eq!(snapshots[0]["size_bytes"], 1_572_864);
    assert!(snapshots[0]["name"].as_str().unwrap().starts_with("h1_"));

    // Failing backup
    let (_, job) = server
        .call(
            "POST",
            "/api/v1/backup",
            Some(&token),
            Some(json!({"agent_id": agent_id, "type": "backup", "config": {"source_paths": ["/nonexistent"]}})),
        )
        .await;
    let failed = server.wait_for_terminal(job["id"].as_i64().unwrap(), &token).await;
    assert_eq!(failed["status"], "failed");
    assert!(failed["snapshot_id"].is_null());
    assert!(failed["error_message"]
        .as_str()
        .unwrap()
        .contains("No such file or directory"));

    // Stats reflect only the completed backup
    let (status, stats) = server.call("GET", "/api/v1/agents/stats", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_snapshots"], 1);
    assert_eq!(stats["total_size_bytes"], 1_572_864);
    assert!(stats["last_backup"].is_string());

    assert_eq!(runner.subcommands(), vec!["init", "create", "list", "create"]);
}

#[tokio::test]
async fn second_agent_cannot_read_first_agents_job() {
    let server = TestServer::start(Arc::new(ScriptedRunner::simulated()));

    let (_, h1) = server
        .call("POST", "/api/v1/agents/register", None, Some(json!({"hostname": "h1", "platform": "linux"})))
        .await;
    let (_, h2) = server
        .call("POST", "/api/v1/agents/register", None, Some(json!({"hostname": "h2", "platform": "linux"})))
        .await;
    let h1_token = h1["token"].as_str().unwrap();
    let h2_token = h2["token"].as_str().unwrap();

    let (_, job) = server
        .call(
            "POST",
            "/api/v1/backup",
            Some(h1_token),
            Some(json!({"agent_id": h1["id"], "type": "backup", "config": {"source_paths": ["/etc"]}})),
        )
        .await;

    let uri = format!("/api/v1/jobs/{}", job["id"]);
    let (status, body) = server.call("GET", &uri, Some(h2_token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].is_string());

    let done = server.wait_for_terminal(job["id"].as_i64().unwrap(), h1_token).await;
    assert_eq!(done["status"], "completed");
}
