//! Resurrection executor.
//!
//! Restarts a named container and verifies it became healthy within a
//! bounded time, rolling back (stopping the container) when it does not.
//! The dry-run variant logs what it would do and reports success, for
//! observer-adjacent development and `--mock` runs.

use crate::config::ResurrectionConfig;
use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ProbeState};
use crate::types::OutcomeType;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Clean-shutdown window passed to the runtime on restart.
const RESTART_STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// Stop window used for rollback.
const ROLLBACK_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Hard ceiling on one restart call, retries and polling included.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(90);
/// A probe-less container counts as healthy after running this long.
const NO_PROBE_GRACE: Duration = Duration::from_secs(2);

/// Terminal result of one resurrection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartResult {
    Success,
    NotFound,
    Unhealthy,
    Timeout,
}

/// What happened, with enough detail to build an outcome record.
#[derive(Debug, Clone)]
pub struct RestartReport {
    pub result: RestartResult,
    pub time_to_healthy_seconds: Option<f64>,
    pub health_score_after: Option<f64>,
    /// Transient-error retries consumed before the restart was issued.
    pub retries: u32,
    /// Whether rollback was invoked. A restart that never succeeded has
    /// nothing to roll back.
    pub rolled_back: bool,
}

impl RestartReport {
    fn success(time_to_healthy: f64, retries: u32) -> Self {
        Self {
            result: RestartResult::Success,
            time_to_healthy_seconds: Some(time_to_healthy),
            health_score_after: Some(1.0),
            retries,
            rolled_back: false,
        }
    }

    fn terminal(result: RestartResult, retries: u32, rolled_back: bool) -> Self {
        Self {
            result,
            time_to_healthy_seconds: None,
            health_score_after: None,
            retries,
            rolled_back,
        }
    }

    /// Map a restart report onto the outcome taxonomy. `Rollback` is
    /// reserved for attempts where rollback actually ran; an Unhealthy
    /// result without one (the restart command itself kept failing) is a
    /// plain Failure.
    pub fn outcome_type(&self) -> OutcomeType {
        match self.result {
            RestartResult::Success if self.retries == 0 => OutcomeType::Success,
            RestartResult::Success => OutcomeType::PartialSuccess,
            RestartResult::NotFound => OutcomeType::Failure,
            RestartResult::Unhealthy if self.rolled_back => OutcomeType::Rollback,
            RestartResult::Unhealthy => OutcomeType::Failure,
            RestartResult::Timeout => OutcomeType::Failure,
        }
    }
}

/// Capability the orchestrator and the approval endpoint act through.
#[async_trait]
pub trait Resurrect: Send + Sync {
    async fn restart(&self, target_module: &str) -> RestartReport;
}

/// Live executor against a container runtime.
pub struct ContainerResurrector {
    runtime: Arc<dyn ContainerRuntime>,
    health_check_interval: Duration,
    health_check_timeout: Duration,
    max_retry_attempts: u32,
}

impl ContainerResurrector {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &ResurrectionConfig) -> Self {
        Self {
            runtime,
            health_check_interval: Duration::from_secs(config.health_check_interval_s),
            health_check_timeout: Duration::from_secs(config.health_check_timeout_s),
            max_retry_attempts: config.max_retry_attempts,
        }
    }

    /// Issue the restart, retrying transient failures. `NotFound` is never
    /// retried.
    async fn issue_restart(&self, target_module: &str) -> Result<(String, u32), RestartReport> {
        let mut retries = 0u32;
        loop {
            let attempt: Result<String, RuntimeError> = async {
                let id = self
                    .runtime
                    .lookup_by_name(target_module)
                    .await?
                    .ok_or_else(|| RuntimeError::NotFound {
                        name: target_module.to_string(),
                    })?;
                self.runtime.restart(&id, RESTART_STOP_TIMEOUT).await?;
                Ok(id)
            }
            .await;

            match attempt {
                Ok(id) => return Ok((id, retries)),
                Err(RuntimeError::NotFound { .. }) => {
                    warn!(target_module, "container not found; not retrying");
                    return Err(RestartReport::terminal(RestartResult::NotFound, retries, false));
                }
                Err(err) if retries < self.max_retry_attempts && err.is_transient() => {
                    retries += 1;
                    warn!(target_module, error = %err, retry = retries, "restart failed; retrying");
                }
                Err(err) => {
                    // Nothing was restarted, so there is nothing to roll back.
                    warn!(target_module, error = %err, "restart failed; giving up");
                    return Err(RestartReport::terminal(RestartResult::Unhealthy, retries, false));
                }
            }
        }
    }

    /// Poll health at the configured cadence until healthy, exited, or the
    /// health-check window closes.
    async fn await_healthy(&self, id: &str, restarted_at: Instant) -> Result<f64, ()> {
        let poll_deadline = restarted_at + self.health_check_timeout;
        loop {
            tokio::time::sleep(self.health_check_interval).await;
            let elapsed = restarted_at.elapsed();

            match self.runtime.inspect_health(id).await {
                Ok(state) => match state.probe {
                    Some(ProbeState::Healthy) => return Ok(elapsed.as_secs_f64()),
                    Some(_) if !state.running => return Err(()),
                    None if state.running && elapsed >= NO_PROBE_GRACE => {
                        return Ok(elapsed.as_secs_f64());
                    }
                    None if !state.running => return Err(()),
                    _ => {}
                },
                // Keep polling; rollback happens either way if the window
                // closes without a healthy verdict.
                Err(err) => warn!(id, error = %err, "health inspection failed"),
            }

            if Instant::now() >= poll_deadline {
                return Err(());
            }
        }
    }

    /// Rollback: stop the container. Attempted even after poll errors,
    /// never retried.
    async fn rollback(&self, id: &str, target_module: &str) {
        match self.runtime.stop(id, ROLLBACK_STOP_TIMEOUT).await {
            Ok(()) => info!(target_module, "rolled back unhealthy resurrection"),
            Err(err) => warn!(target_module, error = %err, "rollback failed"),
        }
    }

    async fn restart_inner(&self, target_module: &str) -> RestartReport {
        let (id, retries) = match self.issue_restart(target_module).await {
            Ok(issued) => issued,
            Err(report) => return report,
        };
        let restarted_at = Instant::now();

        match self.await_healthy(&id, restarted_at).await {
            Ok(time_to_healthy) => {
                info!(
                    target_module,
                    time_to_healthy_s = time_to_healthy,
                    "resurrected container is healthy"
                );
                RestartReport::success(time_to_healthy, retries)
            }
            Err(()) => {
                warn!(target_module, "resurrected container never became healthy");
                self.rollback(&id, target_module).await;
                RestartReport::terminal(RestartResult::Unhealthy, retries, true)
            }
        }
    }
}

#[async_trait]
impl Resurrect for ContainerResurrector {
    async fn restart(&self, target_module: &str) -> RestartReport {
        match tokio::time::timeout(TOTAL_TIMEOUT, self.restart_inner(target_module)).await {
            Ok(report) => report,
            Err(_) => {
                warn!(target_module, "resurrection exceeded the 90s call ceiling");
                // Best-effort rollback; the container may still be flapping.
                let mut rolled_back = false;
                if let Ok(Some(id)) = self.runtime.lookup_by_name(target_module).await {
                    self.rollback(&id, target_module).await;
                    rolled_back = true;
                }
                RestartReport::terminal(RestartResult::Timeout, 0, rolled_back)
            }
        }
    }
}

/// Dry-run executor: logs intent and reports an instant success.
pub struct DryRunResurrector;

#[async_trait]
impl Resurrect for DryRunResurrector {
    async fn restart(&self, target_module: &str) -> RestartReport {
        info!(target_module, "dry-run: would restart container");
        RestartReport::success(0.0, 0)
    }
}
