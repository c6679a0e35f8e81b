//! Configuration system for medic.
//!
//! Uses `figment` for layered configuration: defaults -> YAML config file ->
//! environment (prefix `MEDIC_`, nested keys separated by `__`). The file
//! defaults to `./config/medic.yaml`; `MEDIC_CONFIG_PATH` or `--config`
//! override it. Secrets never live in the file — the SIEM credentials are
//! read from the environment by the SIEM client itself.

use crate::error::ConfigError;
use crate::types::OperatingMode;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Tolerance for the risk-weight sum check.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Top-level configuration for the medic service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedicConfig {
    /// Observer classifies only; live acts on auto-approved decisions.
    #[serde(default)]
    pub mode: Mode,
    pub stream: StreamConfig,
    pub siem: SiemConfig,
    pub decision: DecisionConfig,
    pub risk: RiskConfig,
    pub resurrection: ResurrectionConfig,
    /// Modules whose resurrection is denied at risk >= 0.6.
    #[serde(default)]
    pub critical_modules: Vec<String>,
    pub calibration: CalibrationConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
}

/// Serde-friendly mirror of [`OperatingMode`] with a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Observer,
    Live,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Observer
    }
}

impl From<Mode> for OperatingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Observer => OperatingMode::Observer,
            Mode::Live => OperatingMode::Live,
        }
    }
}

/// Kill-report stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// `durable` reads the configured broker; `mock` yields synthetic events.
    pub kind: StreamKind,
    /// Broker URL, e.g. `redis://127.0.0.1:6379`.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_stream_topic")]
    pub topic: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Consumer name within the group. Defaults to `medic-<pid>`.
    #[serde(default)]
    pub consumer_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Durable,
    Mock,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            kind: StreamKind::Mock,
            endpoint: String::new(),
            topic: default_stream_topic(),
            consumer_group: default_consumer_group(),
            consumer_name: None,
        }
    }
}

fn default_stream_topic() -> String {
    "medic:kills".to_string()
}

fn default_consumer_group() -> String {
    "medic".to_string()
}

/// SIEM enrichment settings. Credentials come from the environment
/// (`SIEM_TOKEN`, or `SIEM_USERNAME` / `SIEM_PASSWORD`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiemConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_siem_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SiemConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            timeout_ms: default_siem_timeout_ms(),
        }
    }
}

fn default_siem_timeout_ms() -> u64 {
    5000
}

/// Decision engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    pub auto_approve: AutoApproveConfig,
    /// Validity window for PendingReview decisions, in minutes.
    #[serde(default = "default_pending_timeout_minutes")]
    pub pending_timeout_minutes: u32,
    /// A kill arriving within this window of a successful resurrection of
    /// the same module is recorded as ReKilled.
    #[serde(default = "default_rekill_window_minutes")]
    pub rekill_window_minutes: u32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            auto_approve: AutoApproveConfig::default(),
            pending_timeout_minutes: default_pending_timeout_minutes(),
            rekill_window_minutes: default_rekill_window_minutes(),
        }
    }
}

fn default_pending_timeout_minutes() -> u32 {
    30
}

fn default_rekill_window_minutes() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApproveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum confidence for auto-approval. Calibration adjusts the live
    /// value between 0.70 and 0.99; this is the starting point.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Maximum risk score for auto-approval.
    #[serde(default = "default_max_risk")]
    pub max_risk: f64,
}

impl Default for AutoApproveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: default_min_confidence(),
            max_risk: default_max_risk(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_confidence() -> f64 {
    0.85
}

fn default_max_risk() -> f64 {
    0.30
}

/// Risk factor weights. Must sum to 1.0 within 1e-6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub weights: RiskWeights,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskWeights {
    pub smith_confidence: f64,
    pub siem_risk: f64,
    pub false_positive_history: f64,
    pub module_criticality: f64,
    pub severity: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            smith_confidence: 0.30,
            siem_risk: 0.25,
            false_positive_history: 0.20,
            module_criticality: 0.15,
            severity: 0.10,
        }
    }
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.smith_confidence
            + self.siem_risk
            + self.false_positive_history
            + self.module_criticality
            + self.severity
    }

    /// The process refuses to start when the weights do not sum to 1.0.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::WeightSum { sum });
        }
        Ok(())
    }
}

/// Resurrection executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResurrectionConfig {
    pub executor: ExecutorKind,
    #[serde(default = "default_health_interval_s")]
    pub health_check_interval_s: u64,
    #[serde(default = "default_health_timeout_s")]
    pub health_check_timeout_s: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Container,
    DryRun,
}

impl Default for ResurrectionConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::DryRun,
            health_check_interval_s: default_health_interval_s(),
            health_check_timeout_s: default_health_timeout_s(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

fn default_health_interval_s() -> u64 {
    1
}

fn default_health_timeout_s() -> u64 {
    60
}

fn default_max_retry_attempts() -> u32 {
    2
}

/// Threshold calibration cadence and window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_calibration_interval_hours")]
    pub interval_hours: u64,
    #[serde(default = "default_calibration_window_days")]
    pub window_days: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_calibration_interval_hours(),
            window_days: default_calibration_window_days(),
        }
    }
}

fn default_calibration_interval_hours() -> u64 {
    24
}

fn default_calibration_window_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/outcomes.db")
}

/// The default config file location relative to the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("config/medic.yaml")
}

/// Load configuration: defaults -> YAML file -> `MEDIC_`-prefixed env.
///
/// A missing file at the default path is fine (defaults apply); a missing
/// file at an explicitly requested path is an error.
pub fn load_config(path: Option<&Path>) -> Result<MedicConfig, ConfigError> {
    let (file, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match std::env::var("MEDIC_CONFIG_PATH") {
            Ok(p) => (PathBuf::from(p), true),
            Err(_) => (default_config_path(), false),
        },
    };
    if required && !file.exists() {
        return Err(ConfigError::FileNotFound { path: file });
    }

    let config: MedicConfig = Figment::from(Serialized::defaults(MedicConfig::default()))
        .merge(Yaml::file(&file))
        .merge(Env::prefixed("MEDIC_").split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

    config.validate()?;
    Ok(config)
}

impl MedicConfig {
    /// Validate cross-field invariants. Called at load; the process refuses
    /// to start on failure (exit code 2).
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.risk.weights.validate()?;

        for (name, value) in [
            (
                "decision.auto_approve.min_confidence",
                self.decision.auto_approve.min_confidence,
            ),
            (
                "decision.auto_approve.max_risk",
                self.decision.auto_approve.max_risk,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ConfigError::Invalid {
                    message: format!("{name} must be in [0.0, 1.0], got {value}"),
                });
            }
        }

        if self.stream.kind == StreamKind::Durable && self.stream.endpoint.is_empty() {
            return Err(ConfigError::Invalid {
                message: "stream.endpoint is required when stream.kind is durable".to_string(),
            });
        }

        if self.siem.enabled && self.siem.base_url.is_empty() {
            return Err(ConfigError::Invalid {
                message: "siem.base_url is required when siem.enabled is true".to_string(),
            });
        }

        if self.http.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid {
                message: format!("http.listen '{}' is not a socket address", self.http.listen),
            });
        }

        if self.resurrection.health_check_interval_s == 0 {
            return Err(ConfigError::Invalid {
                message: "resurrection.health_check_interval_s must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Render the default configuration as YAML for `medic config init`.
    pub fn default_yaml() -> String {
        serde_yaml::to_string(&MedicConfig::default())
            .expect("default configuration serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MedicConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.decision.auto_approve.min_confidence, 0.85);
        assert_eq!(config.decision.auto_approve.max_risk, 0.30);
        assert_eq!(config.calibration.window_days, 30);
        assert_eq!(config.resurrection.health_check_timeout_s, 60);
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!(RiskWeights::default().validate().is_ok());
    }

    #[test]
    fn test_bad_weight_sum_rejected() {
        let weights = RiskWeights {
            smith_confidence: 0.5,
            ..RiskWeights::default()
        };
        let err = weights.validate().unwrap_err();
        assert!(matches!(err, ConfigError::WeightSum { .. }));
    }

    #[test]
    fn test_weight_sum_tolerance() {
        // Within 1e-6 of 1.0 is accepted.
        let weights = RiskWeights {
            smith_confidence: 0.30 + 5e-7,
            ..RiskWeights::default()
        };
        assert!(weights.validate().is_ok());
    }

    #[test]
    fn test_durable_stream_requires_endpoint() {
        let mut config = MedicConfig::default();
        config.stream.kind = StreamKind::Durable;
        assert!(config.validate().is_err());
        config.stream.endpoint = "redis://127.0.0.1:6379".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_siem_enabled_requires_base_url() {
        let mut config = MedicConfig::default();
        config.siem.enabled = true;
        assert!(config.validate().is_err());
        config.siem.base_url = "https://siem.internal".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_listen_address_rejected() {
        let mut config = MedicConfig::default();
        config.http.listen = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_yaml_round_trips() {
        let yaml = MedicConfig::default_yaml();
        let parsed: MedicConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.http.listen, "0.0.0.0:8000");
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let yaml = r#"
mode: live
decision:
  auto_approve:
    enabled: false
critical_modules: [billing, auth]
"#;
        let config: MedicConfig = Figment::from(Serialized::defaults(MedicConfig::default()))
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap();
        assert_eq!(config.mode, Mode::Live);
        assert!(!config.decision.auto_approve.enabled);
        assert_eq!(config.critical_modules, vec!["billing", "auth"]);
        // Untouched keys keep their defaults.
        assert_eq!(config.decision.auto_approve.max_risk, 0.30);
    }
}
