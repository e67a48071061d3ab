use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    pub monitoring: MonitoringSection,
    pub patterns: PatternSection,
    pub health: HealthSection,
    pub alerting: AlertingSection,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitoring.history_capacity == 0 {
            return Err(ConfigError::invalid(
                "monitoring",
                "history_capacity must be greater than zero",
            ));
        }
        if self.monitoring.min_history < 2 {
            return Err(ConfigError::invalid(
                "monitoring",
                "min_history must be at least 2",
            ));
        }
        if self.monitoring.execution_log_capacity == 0 {
            return Err(ConfigError::invalid(
                "monitoring",
                "execution_log_capacity must be greater than zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.patterns.time_based_confidence_cap) {
            return Err(ConfigError::invalid(
                "patterns",
                "time_based_confidence_cap must lie in [0, 1]",
            ));
        }
        if self.health.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "health",
                "max_concurrency must be greater than zero",
            ));
        }
        if self.health.default_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "health",
                "default_timeout_ms must be greater than zero",
            ));
        }
        let mut names = std::collections::HashSet::new();
        for probe in &self.health.probes {
            if probe.name.trim().is_empty() {
                return Err(ConfigError::invalid("health", "probe name cannot be empty"));
            }
            if !names.insert(probe.name.as_str()) {
                return Err(ConfigError::invalid(
                    "health",
                    format!("duplicate probe name {}", probe.name),
                ));
            }
            if probe.timeout_ms == Some(0) {
                return Err(ConfigError::invalid(
                    "health",
                    format!("probe {} timeout_ms must be greater than zero", probe.name),
                ));
            }
        }
        if self.alerting.dashboard_capacity == 0 {
            return Err(ConfigError::invalid(
                "alerting",
                "dashboard_capacity must be greater than zero",
            ));
        }
        let retry = &self.alerting.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "alerting.retry",
                "max_attempts must be at least 1",
            ));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "alerting.retry",
                "multiplier must be a finite value >= 1.0",
            ));
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            return Err(ConfigError::invalid(
                "alerting.retry",
                "max_backoff_ms must be >= initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub history_capacity: usize,
    pub min_history: usize,
    pub execution_log_capacity: usize,
    pub execution_log_path: Option<PathBuf>,
    pub thresholds: Vec<ThresholdRule>,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            min_history: 10,
            execution_log_capacity: 1000,
            execution_log_path: None,
            thresholds: Vec::new(),
        }
    }
}

/// Static bounds and change limits for one metric. `data_source = None`
/// applies the rule to every source reporting the metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdRule {
    pub metric_name: String,
    pub data_source: Option<String>,
    pub upper: Option<f64>,
    pub lower: Option<f64>,
    pub max_change_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSection {
    pub default_min_frequency: usize,
    pub recurring_confidence_scale: f64,
    pub structure_change_min_failures: usize,
    pub structure_change_confidence_scale: f64,
    pub rate_limit_min_failures: usize,
    pub rate_limit_confidence_scale: f64,
    pub time_based_hour_multiplier: f64,
    pub time_based_min_hour_failures: usize,
    pub time_based_min_source_failures: usize,
    pub time_based_confidence_scale: f64,
    pub time_based_confidence_cap: f64,
}

impl Default for PatternSection {
    fn default() -> Self {
        Self {
            default_min_frequency: 2,
            recurring_confidence_scale: 10.0,
            structure_change_min_failures: 2,
            structure_change_confidence_scale: 5.0,
            rate_limit_min_failures: 2,
            rate_limit_confidence_scale: 5.0,
            time_based_hour_multiplier: 2.0,
            time_based_min_hour_failures: 3,
            time_based_min_source_failures: 3,
            time_based_confidence_scale: 10.0,
            time_based_confidence_cap: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub max_concurrency: usize,
    pub default_timeout_ms: u64,
    pub probes: Vec<ProbeDefinition>,
}

impl HealthSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            default_timeout_ms: 10_000,
            probes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Http,
    Path,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeDefinition {
    pub name: String,
    pub kind: ProbeKind,
    pub target: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_critical")]
    pub critical: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_critical() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingSection {
    pub dashboard_capacity: usize,
    pub dashboard_snapshot_path: Option<PathBuf>,
    pub request_timeout_ms: u64,
    pub retry: RetrySection,
    pub sns: Option<SnsSection>,
    pub telegram: Option<TelegramSection>,
    pub slack: Option<SlackSection>,
}

impl AlertingSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for AlertingSection {
    fn default() -> Self {
        Self {
            dashboard_capacity: 100,
            dashboard_snapshot_path: None,
            request_timeout_ms: 10_000,
            retry: RetrySection::default(),
            sns: None,
            telegram: None,
            slack: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 4_000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnsSection {
    pub endpoint: String,
    pub topic_arn: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub subject_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSection {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackSection {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

pub fn load_engine_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    let config: EngineConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
