use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::alerts::{
    AlertDispatcher, AlertEvent, DashboardAlertRecord, DashboardAlertStore, DashboardError,
    DashboardStats, DispatchResult, DispatcherError, NotificationChannel, ThresholdEvaluator,
};
use crate::anomaly::{AnomalyDetector, AnomalyResult, DetectionMethod};
use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::execution::{ExecutionLog, ExecutionLogError, ExecutionRecord, SourceStats};
use crate::health::{
    HealthCheckOrchestrator, HealthCheckResult, HealthCheckSpec, HealthError, SystemStatus,
};
use crate::metrics::{MetricHistoryStore, MetricSample};
use crate::patterns::{FailurePattern, FailurePatternAnalyzer};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    ExecutionLog(#[from] ExecutionLogError),
    #[error(transparent)]
    Dashboard(#[from] DashboardError),
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),
    #[error(transparent)]
    Health(#[from] HealthError),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Single entry point over metrics, executions, health and alerting. Every
/// method takes `&self`; share it behind an `Arc`.
#[derive(Debug)]
pub struct ObservabilityEngine {
    config: EngineConfig,
    history: Arc<MetricHistoryStore>,
    detector: AnomalyDetector,
    thresholds: ThresholdEvaluator,
    executions: ExecutionLog,
    analyzer: FailurePatternAnalyzer,
    health: HealthCheckOrchestrator,
    dispatcher: AlertDispatcher,
}

impl ObservabilityEngine {
    pub fn from_config(config: EngineConfig) -> EngineResult<Self> {
        Self::from_config_with_channels(config, Vec::new())
    }

    /// Like [`from_config`](Self::from_config), appending caller-built
    /// channels after the configured ones.
    pub fn from_config_with_channels(
        config: EngineConfig,
        extra_channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let monitoring = &config.monitoring;
        let history = Arc::new(MetricHistoryStore::new(monitoring.history_capacity));
        let detector =
            AnomalyDetector::new(Arc::clone(&history)).with_min_history(monitoring.min_history);
        let thresholds = ThresholdEvaluator::new(monitoring.thresholds.clone());
        let executions = match &monitoring.execution_log_path {
            Some(path) => ExecutionLog::open(path, monitoring.execution_log_capacity)?,
            None => ExecutionLog::new(monitoring.execution_log_capacity),
        };

        let alerting = &config.alerting;
        let dashboard = match &alerting.dashboard_snapshot_path {
            Some(path) => DashboardAlertStore::open(alerting.dashboard_capacity, path)?,
            None => DashboardAlertStore::new(alerting.dashboard_capacity),
        };
        let mut dispatcher = AlertDispatcher::from_config(alerting, Arc::new(dashboard))?;
        for channel in extra_channels {
            dispatcher = dispatcher.with_channel(channel)?;
        }

        let health = HealthCheckOrchestrator::new(config.health.max_concurrency);
        for definition in &config.health.probes {
            health.register(HealthCheckSpec::from_definition(
                definition,
                config.health.default_timeout(),
            )?);
        }

        info!(
            channels = ?dispatcher.channel_names(),
            probes = config.health.probes.len(),
            thresholds = monitoring.thresholds.len(),
            "observability engine ready"
        );

        Ok(Self {
            analyzer: FailurePatternAnalyzer::new(config.patterns.clone()),
            config,
            history,
            detector,
            thresholds,
            executions,
            health,
            dispatcher,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<MetricHistoryStore> {
        &self.history
    }

    pub fn record_metric(&self, sample: &MetricSample) {
        self.history.record(sample);
    }

    pub fn detect_anomaly(
        &self,
        metric_name: &str,
        value: f64,
        method: DetectionMethod,
    ) -> Option<AnomalyResult> {
        self.detector.detect(metric_name, value, method)
    }

    /// Evaluates thresholds and anomaly detection for `sample` against the
    /// history as it stood before the sample, then records it. Returns the
    /// alerts raised; dispatching them is up to the caller.
    pub fn observe_sample(
        &self,
        sample: &MetricSample,
        method: DetectionMethod,
    ) -> Vec<AlertEvent> {
        let mut alerts = self.thresholds.evaluate(sample);
        if let Some(result) = self.detect_anomaly(&sample.metric_name, sample.value, method) {
            if result.is_anomaly {
                let mut event = result
                    .to_alert_event(sample.data_source.clone())
                    .with_timestamp(sample.timestamp);
                for (key, value) in &sample.tags {
                    event = event.with_context(key.clone(), value.clone());
                }
                alerts.push(event);
            }
        }
        self.record_metric(sample);
        alerts
    }

    pub fn log_execution(&self, record: ExecutionRecord) -> ExecutionRecord {
        self.executions.append(record)
    }

    pub fn executions(&self) -> &ExecutionLog {
        &self.executions
    }

    /// `min_frequency = None` uses `[patterns] default_min_frequency`.
    pub fn analyze_patterns(
        &self,
        source_filter: Option<&str>,
        min_frequency: Option<usize>,
    ) -> Vec<FailurePattern> {
        let min_frequency =
            min_frequency.unwrap_or(self.analyzer.config().default_min_frequency);
        let records = self.executions.records();
        self.analyzer.analyze(&records, source_filter, min_frequency)
    }

    pub fn source_stats(&self) -> BTreeMap<String, SourceStats> {
        self.executions.source_stats()
    }

    pub fn register_probe(&self, spec: HealthCheckSpec) -> bool {
        self.health.register(spec)
    }

    pub fn remove_probe(&self, name: &str) -> bool {
        self.health.remove(name)
    }

    pub async fn run_check(&self, name: &str) -> EngineResult<HealthCheckResult> {
        Ok(self.health.run_one(name).await?)
    }

    pub async fn run_all_checks(&self) -> BTreeMap<String, HealthCheckResult> {
        self.health.run_all().await
    }

    pub fn get_status(&self) -> SystemStatus {
        self.health.status()
    }

    pub async fn dispatch_alert(&self, event: AlertEvent) -> DispatchResult {
        self.dispatcher.dispatch(event).await
    }

    pub fn get_recent_alerts(&self, limit: usize) -> Vec<DashboardAlertRecord> {
        self.dispatcher.get_recent(limit)
    }

    pub fn acknowledge_alert(&self, id: &str) -> bool {
        let found = self.dispatcher.acknowledge(id);
        if !found {
            warn!(alert_id = id, "acknowledge requested for unknown alert");
        }
        found
    }

    pub fn dashboard_stats(&self) -> DashboardStats {
        self.dispatcher.dashboard().stats()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.dispatcher.channel_names()
    }

    /// Runs every probe and raises an alert when the system is degraded or
    /// critical.
    pub async fn report_health(&self) -> (SystemStatus, Option<DispatchResult>) {
        self.run_all_checks().await;
        let status = self.get_status();
        let delivery = match status.to_alert_event() {
            Some(event) => Some(self.dispatch_alert(event).await),
            None => None,
        };
        (status, delivery)
    }

    /// Dispatches one alert per detected pattern whose confidence reaches
    /// `min_confidence`.
    pub async fn report_patterns(
        &self,
        source_filter: Option<&str>,
        min_frequency: Option<usize>,
        min_confidence: f64,
    ) -> Vec<(FailurePattern, DispatchResult)> {
        let mut reported = Vec::new();
        for pattern in self.analyze_patterns(source_filter, min_frequency) {
            if pattern.confidence < min_confidence {
                continue;
            }
            let delivery = self.dispatch_alert(pattern.to_alert_event()).await;
            reported.push((pattern, delivery));
        }
        reported
    }
}
