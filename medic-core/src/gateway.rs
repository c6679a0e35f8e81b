//! HTTP surface built on axum.
//!
//! Four endpoints over the outcome store and pending queue. No
//! authentication here — the service deploys behind a reverse proxy that
//! handles it. Responses never leak internals: store trouble maps to 503
//! (retry window) or a generic 500.

use crate::error::StoreError;
use crate::orchestrator::{ApprovalError, ApprovalService, PipelineCounters};
use crate::pending::PendingQueue;
use crate::store::OutcomeStore;
use crate::types::OperatingMode;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Per-request ceiling.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Records returned by `/decisions/recent`.
const RECENT_LIMIT: u32 = 20;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub store: OutcomeStore,
    pub pending: Arc<PendingQueue>,
    pub approvals: Arc<ApprovalService>,
    pub counters: Arc<PipelineCounters>,
    /// Live auto-approval confidence bar (written by calibration).
    pub confidence_bar: Arc<RwLock<f64>>,
    pub mode: OperatingMode,
    pub started_at: DateTime<Utc>,
    pub stats_window_days: u32,
}

/// Build the router with `/health`, `/decisions/recent`, `/stats`, and
/// `/approve/{kill_id}`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/decisions/recent", get(recent_handler))
        .route("/stats", get(stats_handler))
        .route("/approve/{kill_id}", post(approve_handler))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "mode": state.mode.to_string(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "pending_reviews": state.pending.len(),
        "processed": state.counters.processed.load(Ordering::Relaxed),
        "auto_approved": state.counters.auto_approved.load(Ordering::Relaxed),
    }))
}

async fn recent_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.store.list_recent(RECENT_LIMIT).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => store_error_response(&err),
    }
}

async fn stats_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.store.statistics(state.stats_window_days).await {
        Ok(stats) => {
            let bar = *state.confidence_bar.read().expect("confidence bar lock");
            let mut body = serde_json::to_value(&stats).expect("statistics serialize");
            body["auto_approve_min_confidence"] = json!(bar);
            Json(body).into_response()
        }
        Err(err) => store_error_response(&err),
    }
}

async fn approve_handler(
    State(state): State<GatewayState>,
    Path(kill_id): Path<String>,
) -> impl IntoResponse {
    match state.approvals.approve(&kill_id).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))).into_response(),
        Err(ApprovalError::NotPending) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no pending review for this kill id"})),
        )
            .into_response(),
        Err(ApprovalError::AlreadyInFlight) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "approval already in flight"})),
        )
            .into_response(),
        Err(ApprovalError::Store(err)) => store_error_response(&err),
    }
}

fn store_error_response(err: &StoreError) -> axum::response::Response {
    error!(error = %err, "outcome store unavailable to HTTP surface");
    match err {
        StoreError::Busy { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "outcome store busy, retry shortly"})),
        )
            .into_response(),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "internal error"})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resurrector::{Resurrect, RestartReport, RestartResult};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct AlwaysHealthy;

    #[async_trait]
    impl Resurrect for AlwaysHealthy {
        async fn restart(&self, _target_module: &str) -> RestartReport {
            RestartReport {
                result: RestartResult::Success,
                time_to_healthy_seconds: Some(1.0),
                health_score_after: Some(1.0),
                retries: 0,
                rolled_back: false,
            }
        }
    }

    async fn make_state() -> (TempDir, GatewayState) {
        let dir = TempDir::new().unwrap();
        let store = OutcomeStore::open(dir.path().join("outcomes.db"))
            .await
            .unwrap();
        let pending = Arc::new(PendingQueue::new());
        let approvals = Arc::new(ApprovalService::new(
            store.clone(),
            Arc::new(AlwaysHealthy),
            pending.clone(),
        ));
        let state = GatewayState {
            store,
            pending,
            approvals,
            counters: Arc::new(PipelineCounters::default()),
            confidence_bar: Arc::new(RwLock::new(0.85)),
            mode: OperatingMode::Observer,
            started_at: Utc::now(),
            stats_window_days: 30,
        };
        (dir, state)
    }

    #[tokio::test]
    async fn test_state_constructs() {
        let (_dir, state) = make_state().await;
        assert_eq!(state.pending.len(), 0);
        assert_eq!(state.mode, OperatingMode::Observer);
    }
}
