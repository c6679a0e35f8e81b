//! Integration tests for the HTTP surface.

use axum::body::Body;
use chrono::Utc;
use medic_core::engine::DecisionEngine;
use medic_core::gateway::{GatewayState, router};
use medic_core::orchestrator::{ApprovalService, PipelineCounters};
use medic_core::pending::PendingQueue;
use medic_core::resurrector::{Resurrect, RestartReport, RestartResult};
use medic_core::store::OutcomeStore;
use medic_core::types::{
    Decision, DecisionOutcome, KillReason, KillReport, OperatingMode, OutcomeRecord, OutcomeType,
    RiskLevel, Severity,
};
use medic_core::MedicConfig;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

struct RecordingResurrector {
    calls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Resurrect for RecordingResurrector {
    async fn restart(&self, target_module: &str) -> RestartReport {
        self.calls.lock().unwrap().push(target_module.to_string());
        RestartReport {
            result: RestartResult::Success,
            time_to_healthy_seconds: Some(2.5),
            health_score_after: Some(1.0),
            retries: 0,
            rolled_back: false,
        }
    }
}

struct TestGateway {
    _dir: TempDir,
    store: OutcomeStore,
    pending: Arc<PendingQueue>,
    resurrector: Arc<RecordingResurrector>,
    state: GatewayState,
}

async fn make_gateway(mode: OperatingMode) -> TestGateway {
    let dir = TempDir::new().unwrap();
    let store = OutcomeStore::open(dir.path().join("outcomes.db"))
        .await
        .unwrap();
    let pending = Arc::new(PendingQueue::new());
    let resurrector = Arc::new(RecordingResurrector {
        calls: Mutex::new(Vec::new()),
    });
    let approvals = Arc::new(ApprovalService::new(
        store.clone(),
        resurrector.clone(),
        pending.clone(),
    ));
    let engine = DecisionEngine::new(&MedicConfig::default(), mode).unwrap();
    let state = GatewayState {
        store: store.clone(),
        pending: pending.clone(),
        approvals,
        counters: Arc::new(PipelineCounters::default()),
        confidence_bar: engine.confidence_bar(),
        mode,
        started_at: Utc::now(),
        stats_window_days: 30,
    };
    TestGateway {
        _dir: dir,
        store,
        pending,
        resurrector,
        state,
    }
}

fn get(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(
    state: GatewayState,
    request: axum::http::Request<Body>,
) -> (axum::http::StatusCode, serde_json::Value) {
    let app = router(state);
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1_000_000)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    (status, json)
}

fn sample_report(kill_id: &str, module: &str) -> KillReport {
    KillReport {
        kill_id: kill_id.to_string(),
        timestamp: Utc::now(),
        target_module: module.to_string(),
        target_instance_id: format!("{module}-1"),
        kill_reason: KillReason::AnomalyBehavior,
        severity: Severity::Medium,
        confidence_score: 0.5,
        evidence: vec![],
        dependencies: vec![],
        source_agent: "killer-1".to_string(),
        metadata: serde_json::Map::new(),
    }
}

fn pending_decision(kill_id: &str) -> Decision {
    Decision {
        decision_id: Uuid::new_v4(),
        kill_id: kill_id.to_string(),
        outcome: DecisionOutcome::PendingReview,
        risk_level: RiskLevel::Medium,
        risk_score: 0.5,
        confidence: 0.9,
        reasoning: vec!["queued for human review".to_string()],
        requires_human_review: true,
        timeout_minutes: 30,
        decided_at: Utc::now(),
    }
}

fn record(kill_id: &str, outcome: OutcomeType, auto: bool) -> OutcomeRecord {
    OutcomeRecord::for_decision(
        &pending_decision(kill_id),
        "nginx-test",
        outcome,
        None,
        None,
        auto,
    )
}

#[tokio::test]
async fn test_health_reports_mode_and_pending_count() {
    let gw = make_gateway(OperatingMode::Live).await;
    gw.pending
        .insert(sample_report("k1", "api"), pending_decision("k1"));

    let (status, json) = send(gw.state.clone(), get("/health")).await;
    assert_eq!(status, 200);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["mode"], "live");
    assert_eq!(json["pending_reviews"], 1);
    assert!(json.get("version").is_some());
    assert!(json.get("uptime_secs").is_some());
}

#[tokio::test]
async fn test_recent_returns_newest_first() {
    let gw = make_gateway(OperatingMode::Live).await;
    for i in 0..25 {
        gw.store
            .put(record(&format!("k{i}"), OutcomeType::Success, true))
            .await
            .unwrap();
    }

    let (status, json) = send(gw.state.clone(), get("/decisions/recent")).await;
    assert_eq!(status, 200);
    let records = json.as_array().unwrap();
    assert_eq!(records.len(), 20);
    assert_eq!(records[0]["kill_id"], "k24");
}

#[tokio::test]
async fn test_stats_includes_accuracy_and_confidence_bar() {
    let gw = make_gateway(OperatingMode::Live).await;
    for i in 0..4 {
        gw.store
            .put(record(&format!("s{i}"), OutcomeType::Success, true))
            .await
            .unwrap();
    }
    gw.store
        .put(record("f0", OutcomeType::Rollback, true))
        .await
        .unwrap();

    let (status, json) = send(gw.state.clone(), get("/stats")).await;
    assert_eq!(status, 200);
    assert_eq!(json["auto_approved"], 5);
    assert_eq!(json["auto_approved_successes"], 4);
    assert!((json["auto_approve_accuracy"].as_f64().unwrap() - 0.8).abs() < 1e-9);
    assert_eq!(json["auto_approve_min_confidence"], 0.85);
    assert_eq!(json["window_days"], 30);
}

#[tokio::test]
async fn test_approve_pending_kill_then_404() {
    let gw = make_gateway(OperatingMode::Live).await;
    gw.pending
        .insert(sample_report("k3", "api"), pending_decision("k3"));

    let (status, json) = send(gw.state.clone(), post("/approve/k3")).await;
    assert_eq!(status, 200);
    assert_eq!(json["outcome_type"], "success");
    assert_eq!(json["target_module"], "api");
    assert_eq!(gw.resurrector.calls.lock().unwrap().as_slice(), ["api"]);

    // The approval wrote a terminal record.
    let records = gw.store.list_recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome_type, OutcomeType::Success);
    assert!(!records[0].was_auto_approved);

    // Second call: nothing pending any more.
    let (status, _) = send(gw.state.clone(), post("/approve/k3")).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_approve_unknown_kill_is_404() {
    let gw = make_gateway(OperatingMode::Live).await;
    let (status, json) = send(gw.state.clone(), post("/approve/nope")).await;
    assert_eq!(status, 404);
    assert!(json["error"].as_str().unwrap().contains("no pending review"));
}

#[tokio::test]
async fn test_approve_in_flight_is_409() {
    let gw = make_gateway(OperatingMode::Live).await;
    gw.pending
        .insert(sample_report("k9", "api"), pending_decision("k9"));
    // Claim directly to simulate a concurrent approval still executing.
    let _entry = match gw.pending.claim("k9") {
        medic_core::pending::ClaimResult::Claimed(entry) => entry,
        other => panic!("expected claim, got {other:?}"),
    };

    let (status, _) = send(gw.state.clone(), post("/approve/k9")).await;
    assert_eq!(status, 409);
}

#[tokio::test]
async fn test_responses_carry_no_internals() {
    let gw = make_gateway(OperatingMode::Live).await;
    let (_, json) = send(gw.state.clone(), post("/approve/absent")).await;
    let body = json.to_string();
    assert!(!body.contains("sqlite"));
    assert!(!body.contains("panic"));
}
