pub mod alerts;
pub mod anomaly;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod health;
pub mod metrics;
pub mod patterns;

pub use alerts::{
    AlertDispatcher, AlertEvent, AlertKind, ChannelError, ChannelKind, DashboardAlertRecord,
    DashboardAlertStore, DashboardChannel, DashboardError, DashboardStats, DispatchResult,
    DispatcherError, NotificationChannel, RetryOutcome, RetryPolicy, SlackChannel, SnsChannel,
    TelegramChannel, ThresholdEvaluator,
};
pub use anomaly::{AnomalyDetector, AnomalyResult, DetectionMethod};
pub use config::{
    load_engine_config, AlertingSection, EngineConfig, HealthSection, MonitoringSection,
    PatternSection, ProbeDefinition, ProbeKind, RetrySection, SlackSection, SnsSection,
    TelegramSection, ThresholdRule,
};
pub use engine::{EngineError, EngineResult, ObservabilityEngine};
pub use error::{ConfigError, Result};
pub use execution::{
    classify_error, ErrorKind, ExecutionLog, ExecutionLogError, ExecutionRecord, SourceStats,
};
pub use health::{
    FnProbe, HealthCheckOrchestrator, HealthCheckResult, HealthCheckSpec, HealthError,
    HealthProbe, HttpProbe, PathProbe, ProbeError, StatusLevel, StatusSummary, SystemStatus,
};
pub use metrics::{MetricHistoryStore, MetricSample};
pub use patterns::{FailurePattern, FailurePatternAnalyzer, PatternKind};

/// Serde helper storing a `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
