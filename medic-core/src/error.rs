//! Error types for the medic core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, the outcome store, the kill-report stream, the
//! container runtime, and inbound validation.

use std::path::PathBuf;

/// Top-level error type for the medic core library.
#[derive(Debug, thiserror::Error)]
pub enum MedicError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Outcome store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Risk weights must sum to 1.0 (got {sum:.6})")]
    WeightSum { sum: f64 },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the outcome store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open outcome store at {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Outcome store schema version mismatch: found {found}, expected {expected}")]
    SchemaMismatch { found: i64, expected: i64 },

    #[error("Outcome store busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("Outcome store query failed: {message}")]
    Query { message: String },

    #[error("Outcome store task join error: {message}")]
    Join { message: String },
}

impl StoreError {
    /// Whether the process should give up on the store entirely (exit code 3)
    /// rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Open { .. } | StoreError::SchemaMismatch { .. }
        )
    }
}

/// Errors from the kill-report stream listener.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Stream connection failed: {message}")]
    Connection { message: String },

    #[error("Stream read failed: {message}")]
    Read { message: String },

    #[error("Acknowledgement failed for message {message_id}: {message}")]
    Ack { message_id: String, message: String },
}

/// Errors from container runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container not found: {name}")]
    NotFound { name: String },

    #[error("Runtime command failed: {message}")]
    CommandFailed { message: String },

    #[error("Runtime command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Unexpected runtime output: {message}")]
    UnexpectedOutput { message: String },
}

impl RuntimeError {
    /// Transient errors are retried by the resurrector; `NotFound` is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RuntimeError::NotFound { .. })
    }
}

/// A single field of an inbound record failed validation.
///
/// Validation failures are terminal for the record (it is recorded as an
/// Undetermined outcome and acked) but never terminal for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid field '{field}': {reason}")]
pub struct ValidationFailure {
    pub field: String,
    pub reason: String,
}

impl ValidationFailure {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A type alias for results using the top-level `MedicError`.
pub type Result<T> = std::result::Result<T, MedicError>;
