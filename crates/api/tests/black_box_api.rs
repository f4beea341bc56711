use std::sync::{Arc, Mutex};

use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use outreach_api::app::{build_app, services};
use outreach_core::{DataSourceId, EngagementId};
use outreach_infra::config::AppConfig;
use outreach_sync::{RecoveryAction, RecoveryAttempt, SyncState, SyncStatus};
use reqwest::StatusCode;
use serde_json::{json, Value};

type Calls = Arc<Mutex<Vec<(String, Value)>>>;

/// Stand-in platform worker: records every call and answers with `status`.
struct FakeWorker {
    base_url: String,
    calls: Calls,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeWorker {
    async fn spawn(status: AxumStatus) -> Self {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let app = Router::new().route(
            "/:endpoint",
            post(
                move |axum::extract::Path(endpoint): axum::extract::Path<String>,
                      Json(body): Json<Value>| {
                    let recorded = recorded.clone();
                    async move {
                        recorded.lock().unwrap().push((endpoint, body));
                        (status, Json(json!({ "ok": status.is_success() })))
                    }
                },
            ),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            calls,
            handle,
        }
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct TestServer {
    base_url: String,
    services: services::AppServices,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(worker_base_url: Option<&str>, api_token: Option<&str>) -> Self {
        let mut vars = vec![("SYNC_WORKER_TIMEOUT_SECS", "2".to_string())];
        if let Some(url) = worker_base_url {
            vars.push(("SYNC_WORKER_BASE_URL", url.to_string()));
        }
        if let Some(token) = api_token {
            vars.push(("RECOVERY_API_TOKEN", token.to_string()));
        }
        let config = AppConfig::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap();

        // Same router as prod, in-memory stores, ephemeral port.
        let services = services::build_services(&config).await.unwrap();
        let app = build_app(services.clone(), config.api_token.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            services,
            handle,
        }
    }

    async fn seed_stuck(&self, platform: &str, minutes: i64, configure: impl FnOnce(&mut SyncState)) -> SyncState {
        let then = Utc::now() - ChronoDuration::minutes(minutes) - ChronoDuration::seconds(30);
        let mut state = SyncState::new(DataSourceId::new(), platform, then);
        state.status = SyncStatus::Syncing;
        state.config.heartbeat = Some(then);
        configure(&mut state);
        self.services.stores.states.upsert(&state).await.unwrap();
        state
    }

    async fn recover(&self, body: Value) -> (StatusCode, Value) {
        let res = reqwest::Client::new()
            .post(format!("{}/sync-recovery", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn campaigns_phase(offset: u64) -> impl FnOnce(&mut SyncState) {
    move |s| {
        s.config.phase = Some("campaigns".to_string());
        s.config.campaign_offset = Some(offset);
    }
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn(None, Some("s3cret")).await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_token_is_enforced_when_configured() {
    let srv = TestServer::spawn(None, Some("s3cret")).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/sync-recovery", srv.base_url))
        .json(&json!({ "action": "detect" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/sync-recovery", srv.base_url))
        .bearer_auth("s3cret")
        .json(&json!({ "action": "detect" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn detect_reports_stuck_jobs_without_writing() {
    let worker = FakeWorker::spawn(AxumStatus::OK).await;
    let srv = TestServer::spawn(Some(&worker.base_url), None).await;
    let state = srv.seed_stuck("smartlead", 7, campaigns_phase(250)).await;
    // healthy job: written a moment ago
    srv.seed_stuck("replyio", 0, |s| s.updated_at = Utc::now()).await;

    let (status, first) = srv.recover(json!({ "action": "detect" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["success"], json!(true));
    let stuck = first["stuck_syncs"].as_array().unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0]["data_source_id"], json!(state.id.to_string()));
    assert_eq!(stuck[0]["platform"], json!("smartlead"));
    assert_eq!(stuck[0]["status"], json!("syncing"));
    assert_eq!(stuck[0]["stuck_minutes"], json!(7));
    assert_eq!(stuck[0]["recovery_attempts"], json!(0));

    let (_, second) = srv.recover(json!({ "action": "detect" })).await;
    assert_eq!(first, second);

    assert!(worker.calls().is_empty());
    let stored = srv.services.stores.states.get(state.id).await.unwrap().unwrap();
    assert_eq!(stored, state);
}

#[tokio::test]
async fn empty_body_runs_auto_recovery_and_resumes() {
    let worker = FakeWorker::spawn(AxumStatus::OK).await;
    let srv = TestServer::spawn(Some(&worker.base_url), None).await;
    let state = srv.seed_stuck("smartlead", 7, campaigns_phase(250)).await;

    let res = reqwest::Client::new()
        .post(format!("{}/sync-recovery", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();

    assert_eq!(body["success"], json!(true));
    assert_eq!(body["stuck_count"], json!(1));
    let result = &body["results"][0];
    assert_eq!(result["action"], json!("resume"));
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["stuck_duration_minutes"], json!(7));

    let calls = worker.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "smartlead-sync");
    assert_eq!(calls[0].1["dataSourceId"], json!(state.id.to_string()));
    assert_eq!(calls[0].1["campaignOffset"], json!(250));

    let attempts = srv
        .services
        .stores
        .states
        .recent_attempts(state.id, 10)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].action, RecoveryAction::Resume);
}

#[tokio::test]
async fn worker_error_falls_back_to_reset() {
    let worker = FakeWorker::spawn(AxumStatus::BAD_GATEWAY).await;
    let srv = TestServer::spawn(Some(&worker.base_url), None).await;
    let state = srv.seed_stuck("replyio", 8, |s| s.config.batch_number = Some(11)).await;

    let (status, body) = srv.recover(json!({ "action": "resume" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["action"], json!("reset_after_failed_resume"));
    assert_eq!(worker.calls()[0].1["batchNumber"], json!(12));

    let stored = srv.services.stores.states.get(state.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Error);
    assert!(stored.config.can_retry);
    let attempts = srv
        .services
        .stores
        .states
        .recent_attempts(state.id, 10)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].action, RecoveryAction::Reset);
}

#[tokio::test]
async fn attempt_budget_resets_without_calling_the_worker() {
    let worker = FakeWorker::spawn(AxumStatus::OK).await;
    let srv = TestServer::spawn(Some(&worker.base_url), None).await;
    let state = srv.seed_stuck("smartlead", 9, campaigns_phase(10)).await;
    for minutes in [40, 25, 10] {
        let at = Utc::now() - ChronoDuration::minutes(minutes);
        srv.services
            .stores
            .states
            .append_attempt(state.id, &RecoveryAttempt::new(RecoveryAction::Resume, true, "resumed", at))
            .await
            .unwrap();
    }

    let (_, body) = srv.recover(json!({ "action": "auto" })).await;
    assert_eq!(body["results"][0]["action"], json!("reset"));
    assert!(worker.calls().is_empty());
}

#[tokio::test]
async fn reset_fails_the_running_progress_record() {
    let srv = TestServer::spawn(None, None).await;
    let state = srv.seed_stuck("smartlead", 6, campaigns_phase(0)).await;
    let engagement = EngagementId::new();
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/progress/{}/{}/start", srv.base_url, state.id, engagement))
        .json(&json!({ "total_units": 40 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let (_, body) = srv.recover(json!({ "action": "reset" })).await;
    assert_eq!(body["results"][0]["action"], json!("reset"));

    let res = client
        .get(format!("{}/progress/{}", srv.base_url, state.id))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["runs"][0]["status"], json!("failed"));
    assert_eq!(body["runs"][0]["errors"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_requests_get_400() {
    let srv = TestServer::spawn(None, None).await;

    let (status, body) = srv.recover(json!({ "action": "restart" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("invalid_request"));

    let res = reqwest::Client::new()
        .post(format!("{}/sync-recovery", srv.base_url))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn progress_lifecycle_over_http() {
    let srv = TestServer::spawn(None, None).await;
    let ds = DataSourceId::new();
    let eng = EngagementId::new();
    let client = reqwest::Client::new();
    let run_url = format!("{}/progress/{}/{}", srv.base_url, ds, eng);

    let res = client
        .post(format!("{run_url}/update"))
        .json(&json!({ "processed_units": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    client
        .post(format!("{run_url}/start"))
        .json(&json!({ "total_units": 10 }))
        .send()
        .await
        .unwrap();

    let res = client
        .post(format!("{run_url}/update"))
        .json(&json!({ "processed_units": 5, "records_synced_delta": 120, "phase_label": "Syncing campaigns" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["percent_complete"], json!(50.0));
    assert_eq!(body["records_synced"], json!(120));

    let res = client
        .post(format!("{run_url}/update"))
        .json(&json!({ "processed_units": 11 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!("{run_url}/finish"))
        .json(&json!({ "status": "completed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(format!("{run_url}/error"))
        .json(&json!({ "error": "late error" }))
        .send()
        .await
        .unwrap();
    // errors may still be recorded after the run ended
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(format!("{run_url}/finish"))
        .json(&json!({ "status": "failed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn retry_queue_enqueue_process_and_cancel() {
    let worker = FakeWorker::spawn(AxumStatus::OK).await;
    let srv = TestServer::spawn(Some(&worker.base_url), None).await;
    let state = srv.seed_stuck("replyio", 0, |s| s.status = SyncStatus::Completed).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/retry-queue", srv.base_url))
        .json(&json!({
            "data_source_id": state.id,
            "payload": { "batch": 3 },
            "error": "HTTP 429",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let item: Value = res.json().await.unwrap();
    assert_eq!(item["status"], json!("pending"));

    // first retry is scheduled after the base delay, so nothing is due yet
    let res = client
        .post(format!("{}/retry-queue/process", srv.base_url))
        .send()
        .await
        .unwrap();
    let summary: Value = res.json().await.unwrap();
    assert_eq!(summary["claimed"], json!(0));

    let res = client
        .get(format!("{}/retry-queue?status=pending", srv.base_url))
        .send()
        .await
        .unwrap();
    let list: Value = res.json().await.unwrap();
    assert_eq!(list["items"].as_array().unwrap().len(), 1);

    let res = client
        .post(format!("{}/retry-queue/{}/cancel", srv.base_url, item["id"].as_str().unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(format!("{}/retry-queue/{}/cancel", srv.base_url, item["id"].as_str().unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let stats: Value = client
        .get(format!("{}/retry-queue/stats", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["cancelled"], json!(1));
    assert_eq!(stats["pending"], json!(0));

    let res = client
        .get(format!("{}/retry-queue?status=bogus", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
