//! Container runtime adapter.
//!
//! The core issues exactly four runtime operations: look up a container by
//! name, restart it, inspect its health, and stop it. `DockerCli` implements
//! them by shelling out to the `docker` binary — requires docker to be
//! installed and the daemon reachable.

use crate::error::RuntimeError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Health as reported by the runtime for a single container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    /// Whether the container process is currently running.
    pub running: bool,
    /// Probe verdict; `None` when the image declares no health check.
    pub probe: Option<ProbeState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Healthy,
    Unhealthy,
    Starting,
}

/// The four runtime operations the core is allowed to perform.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Resolve a container name to its runtime id. `Ok(None)` when absent.
    async fn lookup_by_name(&self, name: &str) -> Result<Option<String>, RuntimeError>;

    /// Restart a container, giving it `stop_timeout` to shut down cleanly.
    async fn restart(&self, id: &str, stop_timeout: Duration) -> Result<(), RuntimeError>;

    /// Current run/health state of a container.
    async fn inspect_health(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    /// Stop a container within `timeout`.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;
}

/// Docker CLI implementation.
pub struct DockerCli;

impl DockerCli {
    async fn run_docker(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = tokio::process::Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::CommandFailed {
                message: format!("docker not found or failed to execute: {e}"),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            if stderr.to_ascii_lowercase().contains("no such") {
                return Err(RuntimeError::NotFound {
                    name: args.last().unwrap_or(&"?").to_string(),
                });
            }
            if stderr.is_empty() {
                return Err(RuntimeError::CommandFailed {
                    message: format!("docker exited with status {}: {stdout}", output.status),
                });
            }
            return Err(RuntimeError::CommandFailed {
                message: format!("docker error: {}", stderr.trim()),
            });
        }

        Ok(stdout)
    }
}

/// Subset of `docker inspect`'s `.State` we care about.
#[derive(Debug, Deserialize)]
struct DockerState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Health")]
    health: Option<DockerHealth>,
}

#[derive(Debug, Deserialize)]
struct DockerHealth {
    #[serde(rename = "Status")]
    status: String,
}

fn parse_state(raw: &str) -> Result<ContainerState, RuntimeError> {
    let state: DockerState =
        serde_json::from_str(raw.trim()).map_err(|e| RuntimeError::UnexpectedOutput {
            message: format!("could not parse container state: {e}"),
        })?;
    let probe = match state.health {
        None => None,
        Some(h) => Some(match h.status.as_str() {
            "healthy" => ProbeState::Healthy,
            "starting" => ProbeState::Starting,
            _ => ProbeState::Unhealthy,
        }),
    };
    Ok(ContainerState {
        running: state.running,
        probe,
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn lookup_by_name(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        match self.run_docker(&["inspect", "--format", "{{.Id}}", name]).await {
            Ok(stdout) => Ok(Some(stdout.trim().to_string())),
            Err(RuntimeError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn restart(&self, id: &str, stop_timeout: Duration) -> Result<(), RuntimeError> {
        let timeout = stop_timeout.as_secs().to_string();
        self.run_docker(&["restart", "-t", &timeout, id]).await?;
        Ok(())
    }

    async fn inspect_health(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let raw = self
            .run_docker(&["inspect", "--format", "{{json .State}}", id])
            .await?;
        parse_state(&raw)
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let timeout = timeout.as_secs().to_string();
        self.run_docker(&["stop", "-t", &timeout, id]).await?;
        Ok(())
    }
}
