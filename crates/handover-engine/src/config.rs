use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Input (as written in TOML) ──────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfigInput {
    pub version: u32,
    pub ml: MlConfigInput,
    pub rule: RuleConfigInput,
    pub qos: QosConfigInput,
    pub breakers: BreakersConfigInput,
    pub queue: QueueConfigInput,
    pub provider: ProviderConfigInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfigInput {
    pub mode: Option<MlMode>,
    pub min_cells: Option<usize>,
    pub confidence_threshold: Option<f64>,
    pub default_priority: Option<u8>,
    pub dispatch: Option<Dispatch>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfigInput {
    pub hysteresis_db: Option<f64>,
    pub time_to_trigger_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfigInput {
    pub min_required: Option<f64>,
    pub max_required: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakersConfigInput {
    pub login: BreakerConfigInput,
    pub api: BreakerConfigInput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfigInput {
    pub failure_threshold: Option<u32>,
    pub recovery_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfigInput {
    pub capacity: Option<usize>,
    pub workers: Option<usize>,
    pub prediction_timeout_ms: Option<u64>,
    pub training_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfigInput {
    pub base_url: Option<String>,
    pub call_timeout_ms: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
}

// ── Resolved ────────────────────────────────────────────────────────

/// Whether the engine consults the prediction provider at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MlMode {
    Enabled,
    Disabled,
    /// Enabled once a snapshot exposes at least `min_cells` distinct cells.
    Auto,
}

/// How `decide_and_apply` reaches the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dispatch {
    /// Call the prediction client inline on the caller's task.
    Direct,
    /// Submit through the operation queue and await the handle.
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MlConfig {
    pub mode: MlMode,
    pub min_cells: usize,
    /// Minimum raw confidence when a prediction carries no QoS context.
    pub confidence_threshold: f64,
    /// Priority assumed when a UE declares no QoS requirement.
    pub default_priority: u8,
    pub dispatch: Dispatch,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            mode: MlMode::Auto,
            min_cells: 3,
            confidence_threshold: 0.5,
            default_priority: 5,
            dispatch: Dispatch::Direct,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleConfig {
    pub hysteresis_db: f64,
    pub time_to_trigger: Duration,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            hysteresis_db: 2.0,
            time_to_trigger: Duration::ZERO,
        }
    }
}

/// Linear priority → required-confidence policy.
///
/// The default 0.50 / 0.95 end points are a heuristic; both are tunable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QosConfig {
    /// Required confidence at priority 1.
    pub min_required: f64,
    /// Required confidence at priority 10.
    pub max_required: f64,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            min_required: 0.50,
            max_required: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive transport failures before the breaker opens.
    pub failure_threshold: u32,
    /// Time spent Open before a single trial call is admitted.
    pub recovery_timeout: Duration,
}

impl BreakerConfig {
    /// Tight guard for the provider login call.
    pub fn login() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }

    /// Guard for general provider API calls.
    pub fn api() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::api()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakersConfig {
    pub login: BreakerConfig,
    pub api: BreakerConfig,
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            login: BreakerConfig::login(),
            api: BreakerConfig::api(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of pending (not yet running) tasks.
    pub capacity: usize,
    pub workers: usize,
    pub prediction_timeout: Duration,
    pub training_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            workers: 4,
            prediction_timeout: Duration::from_secs(2),
            training_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Hard timeout on every individual provider call.
    pub call_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            call_timeout: Duration::from_millis(1500),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub version: u32,
    pub ml: MlConfig,
    pub rule: RuleConfig,
    pub qos: QosConfig,
    pub breakers: BreakersConfig,
    pub queue: QueueConfig,
    pub provider: ProviderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            ml: MlConfig::default(),
            rule: RuleConfig::default(),
            qos: QosConfig::default(),
            breakers: BreakersConfig::default(),
            queue: QueueConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

fn unit_interval(field: &'static str, v: f64) -> Result<f64, ConfigError> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(invalid(field, format!("{v} is outside [0, 1]")))
    }
}

/// A call budget in milliseconds. Zero would time out every call.
fn timeout_ms(
    field: &'static str,
    ms: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match ms {
        Some(0) => Err(invalid(field, "timeout must be greater than zero")),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

impl BreakerConfigInput {
    fn resolve(self, defaults: BreakerConfig) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            recovery_timeout: self
                .recovery_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.recovery_timeout),
        }
    }
}

impl EngineConfigInput {
    pub fn resolve(self) -> Result<EngineConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let ml_defaults = MlConfig::default();
        let ml = MlConfig {
            mode: self.ml.mode.unwrap_or(ml_defaults.mode),
            min_cells: self.ml.min_cells.unwrap_or(ml_defaults.min_cells).max(1),
            confidence_threshold: unit_interval(
                "ml.confidence_threshold",
                self.ml
                    .confidence_threshold
                    .unwrap_or(ml_defaults.confidence_threshold),
            )?,
            default_priority: self
                .ml
                .default_priority
                .unwrap_or(ml_defaults.default_priority)
                .clamp(1, 10),
            dispatch: self.ml.dispatch.unwrap_or(ml_defaults.dispatch),
        };

        let hysteresis_db = self
            .rule
            .hysteresis_db
            .unwrap_or(RuleConfig::default().hysteresis_db);
        if !hysteresis_db.is_finite() || hysteresis_db < 0.0 {
            return Err(invalid(
                "rule.hysteresis_db",
                format!("{hysteresis_db} must be a non-negative number"),
            ));
        }
        let rule = RuleConfig {
            hysteresis_db,
            time_to_trigger: Duration::from_millis(self.rule.time_to_trigger_ms.unwrap_or(0)),
        };

        let qos_defaults = QosConfig::default();
        let qos = QosConfig {
            min_required: unit_interval(
                "qos.min_required",
                self.qos.min_required.unwrap_or(qos_defaults.min_required),
            )?,
            max_required: unit_interval(
                "qos.max_required",
                self.qos.max_required.unwrap_or(qos_defaults.max_required),
            )?,
        };
        if qos.min_required > qos.max_required {
            return Err(invalid(
                "qos",
                format!(
                    "min_required {} exceeds max_required {}",
                    qos.min_required, qos.max_required
                ),
            ));
        }

        let breakers = BreakersConfig {
            login: self.breakers.login.resolve(BreakerConfig::login()),
            api: self.breakers.api.resolve(BreakerConfig::api()),
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            capacity: self.queue.capacity.unwrap_or(queue_defaults.capacity).max(1),
            workers: self.queue.workers.unwrap_or(queue_defaults.workers).max(1),
            prediction_timeout: timeout_ms(
                "queue.prediction_timeout_ms",
                self.queue.prediction_timeout_ms,
                queue_defaults.prediction_timeout,
            )?,
            training_timeout: timeout_ms(
                "queue.training_timeout_ms",
                self.queue.training_timeout_ms,
                queue_defaults.training_timeout,
            )?,
        };

        let provider_defaults = ProviderConfig::default();
        let base_url = self
            .provider
            .base_url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .unwrap_or(provider_defaults.base_url);
        if base_url.is_empty() {
            return Err(invalid("provider.base_url", "must not be empty"));
        }
        let provider = ProviderConfig {
            base_url,
            call_timeout: timeout_ms(
                "provider.call_timeout_ms",
                self.provider.call_timeout_ms,
                provider_defaults.call_timeout,
            )?,
            username: self.provider.username.filter(|s| !s.trim().is_empty()),
            password: self.provider.password,
        };

        Ok(EngineConfig {
            version,
            ml,
            rule,
            qos,
            breakers,
            queue,
            provider,
        })
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        let parsed: EngineConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Render the resolved configuration back as TOML input (secrets omitted).
    pub fn to_toml_string(&self) -> String {
        let breaker = |b: &BreakerConfig| BreakerConfigInput {
            failure_threshold: Some(b.failure_threshold),
            recovery_timeout_ms: Some(b.recovery_timeout.as_millis() as u64),
        };
        let input = EngineConfigInput {
            version: self.version,
            ml: MlConfigInput {
                mode: Some(self.ml.mode),
                min_cells: Some(self.ml.min_cells),
                confidence_threshold: Some(self.ml.confidence_threshold),
                default_priority: Some(self.ml.default_priority),
                dispatch: Some(self.ml.dispatch),
            },
            rule: RuleConfigInput {
                hysteresis_db: Some(self.rule.hysteresis_db),
                time_to_trigger_ms: Some(self.rule.time_to_trigger.as_millis() as u64),
            },
            qos: QosConfigInput {
                min_required: Some(self.qos.min_required),
                max_required: Some(self.qos.max_required),
            },
            breakers: BreakersConfigInput {
                login: breaker(&self.breakers.login),
                api: breaker(&self.breakers.api),
            },
            queue: QueueConfigInput {
                capacity: Some(self.queue.capacity),
                workers: Some(self.queue.workers),
                prediction_timeout_ms: Some(self.queue.prediction_timeout.as_millis() as u64),
                training_timeout_ms: Some(self.queue.training_timeout.as_millis() as u64),
            },
            provider: ProviderConfigInput {
                base_url: Some(self.provider.base_url.clone()),
                call_timeout_ms: Some(self.provider.call_timeout.as_millis() as u64),
                username: self.provider.username.clone(),
                password: None,
            },
        };
        toml::to_string(&input).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let cfg = EngineConfig::from_toml_str("   ").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.breakers.login.failure_threshold, 3);
        assert_eq!(cfg.breakers.login.recovery_timeout, Duration::from_secs(30));
        assert_eq!(cfg.breakers.api.failure_threshold, 5);
        assert_eq!(cfg.breakers.api.recovery_timeout, Duration::from_secs(60));
        assert_eq!(cfg.queue.capacity, 1000);
        assert_eq!(cfg.queue.workers, 4);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [ml]
            mode = "enabled"
            confidence_threshold = 0.7
            dispatch = "queued"

            [rule]
            hysteresis_db = 3.0
            time_to_trigger_ms = 640

            [breakers.login]
            failure_threshold = 2

            [breakers.api]
            failure_threshold = 8
            recovery_timeout_ms = 10000

            [queue]
            capacity = 16
            workers = 2
            prediction_timeout_ms = 250

            [provider]
            base_url = "http://predictor:8000/"
            username = "admin@example.com"
            password = "secret"
        "#;

        let cfg = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.ml.mode, MlMode::Enabled);
        assert_eq!(cfg.ml.dispatch, Dispatch::Queued);
        assert!((cfg.ml.confidence_threshold - 0.7).abs() < 1e-9);
        assert_eq!(cfg.ml.min_cells, 3);
        assert!((cfg.rule.hysteresis_db - 3.0).abs() < 1e-9);
        assert_eq!(cfg.rule.time_to_trigger, Duration::from_millis(640));
        assert_eq!(cfg.breakers.login.failure_threshold, 2);
        assert_eq!(cfg.breakers.login.recovery_timeout, Duration::from_secs(30));
        assert_eq!(cfg.breakers.api.failure_threshold, 8);
        assert_eq!(cfg.breakers.api.recovery_timeout, Duration::from_secs(10));
        assert_eq!(cfg.queue.capacity, 16);
        assert_eq!(cfg.queue.workers, 2);
        assert_eq!(cfg.queue.prediction_timeout, Duration::from_millis(250));
        assert_eq!(cfg.queue.training_timeout, Duration::from_secs(300));
        assert_eq!(cfg.provider.base_url, "http://predictor:8000");
        assert_eq!(cfg.provider.username.as_deref(), Some("admin@example.com"));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = EngineConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(2)));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = EngineConfig::from_toml_str("[ml]\nconfidence_threshold = 1.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "ml.confidence_threshold", .. }));

        let err = EngineConfig::from_toml_str("[rule]\nhysteresis_db = -1.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "rule.hysteresis_db", .. }));

        let err =
            EngineConfig::from_toml_str("[qos]\nmin_required = 0.9\nmax_required = 0.6").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "qos", .. }));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let err = EngineConfig::from_toml_str("[provider]\ncall_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "provider.call_timeout_ms", .. }));

        let err = EngineConfig::from_toml_str("[queue]\nprediction_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "queue.prediction_timeout_ms", .. }));

        let err = EngineConfig::from_toml_str("[queue]\ntraining_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "queue.training_timeout_ms", .. }));

        let cfg = EngineConfig::from_toml_str("[provider]\ncall_timeout_ms = 1").unwrap();
        assert_eq!(cfg.provider.call_timeout, Duration::from_millis(1));
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let toml = r#"
            [ml]
            default_priority = 42
            [queue]
            capacity = 0
            workers = 0
            [breakers.api]
            failure_threshold = 0
        "#;
        let cfg = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.queue.capacity, 1);
        assert_eq!(cfg.queue.workers, 1);
        assert_eq!(cfg.breakers.api.failure_threshold, 1);
        assert_eq!(cfg.ml.default_priority, 10);
    }

    #[test]
    fn resolved_config_renders_back_to_toml() {
        let mut cfg = EngineConfig::default();
        cfg.provider.password = Some("hunter2".into());
        let rendered = cfg.to_toml_string();
        assert!(!rendered.contains("hunter2"));
        let reparsed = EngineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.queue, cfg.queue);
        assert_eq!(reparsed.breakers, cfg.breakers);
        assert_eq!(reparsed.ml, cfg.ml);
    }
}
