use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::alerts::{AlertEvent, AlertKind};
use crate::config::{ProbeDefinition, ProbeKind};
use crate::duration_millis;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0}")]
    Failed(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("no probe registered under {0}")]
    UnknownProbe(String),
    #[error("invalid probe {name}: {source}")]
    InvalidProbe { name: String, source: ProbeError },
}

/// A health check. `Ok(false)` and `Err(_)` both count as unhealthy; the
/// error text is kept on the result.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<bool, ProbeError>;
}

#[derive(Clone)]
pub struct HealthCheckSpec {
    pub name: String,
    pub probe: Arc<dyn HealthProbe>,
    pub timeout: Duration,
    pub critical: bool,
    pub tags: BTreeMap<String, String>,
}

impl fmt::Debug for HealthCheckSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckSpec")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .field("tags", &self.tags)
            .finish()
    }
}

impl HealthCheckSpec {
    pub fn new(name: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            name: name.into(),
            probe,
            timeout: DEFAULT_PROBE_TIMEOUT,
            critical: true,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builds a spec for a probe declared in `[[health.probes]]`.
    pub fn from_definition(
        definition: &ProbeDefinition,
        default_timeout: Duration,
    ) -> Result<Self, HealthError> {
        let timeout = definition
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        let probe: Arc<dyn HealthProbe> = match definition.kind {
            ProbeKind::Http => Arc::new(HttpProbe::new(&definition.target, timeout).map_err(
                |source| HealthError::InvalidProbe {
                    name: definition.name.clone(),
                    source,
                },
            )?),
            ProbeKind::Path => Arc::new(PathProbe::new(&definition.target)),
        };
        let mut spec = Self::new(definition.name.clone(), probe)
            .with_timeout(timeout)
            .with_critical(definition.critical);
        spec.tags = definition.tags.clone();
        Ok(spec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
    pub critical: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Unknown,
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusLevel::Unknown => "unknown",
            StatusLevel::Healthy => "healthy",
            StatusLevel::Degraded => "degraded",
            StatusLevel::Critical => "critical",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub healthy: usize,
    pub critical_failures: usize,
    pub non_critical_failures: usize,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub status: StatusLevel,
    pub message: String,
    pub components: BTreeMap<String, HealthCheckResult>,
    pub summary: StatusSummary,
    pub failing_critical: Vec<String>,
    pub failing_non_critical: Vec<String>,
}

impl SystemStatus {
    pub fn from_results(results: BTreeMap<String, HealthCheckResult>) -> Self {
        let failing_critical: Vec<String> = results
            .values()
            .filter(|result| !result.healthy && result.critical)
            .map(|result| result.name.clone())
            .collect();
        let failing_non_critical: Vec<String> = results
            .values()
            .filter(|result| !result.healthy && !result.critical)
            .map(|result| result.name.clone())
            .collect();
        let summary = StatusSummary {
            total: results.len(),
            healthy: results.values().filter(|result| result.healthy).count(),
            critical_failures: failing_critical.len(),
            non_critical_failures: failing_non_critical.len(),
            last_check: results.values().map(|result| result.timestamp).max(),
        };

        let (status, message) = if results.is_empty() {
            (StatusLevel::Unknown, "no health checks have run yet".to_string())
        } else if !failing_critical.is_empty() {
            (
                StatusLevel::Critical,
                format!("critical components failing: {}", failing_critical.join(", ")),
            )
        } else if !failing_non_critical.is_empty() {
            (
                StatusLevel::Degraded,
                format!(
                    "non-critical components failing: {}",
                    failing_non_critical.join(", ")
                ),
            )
        } else {
            (
                StatusLevel::Healthy,
                format!("all {} components healthy", results.len()),
            )
        };

        Self {
            status,
            message,
            components: results,
            summary,
            failing_critical,
            failing_non_critical,
        }
    }

    /// Alert for a degraded or critical system; `None` otherwise.
    pub fn to_alert_event(&self) -> Option<AlertEvent> {
        if !matches!(self.status, StatusLevel::Degraded | StatusLevel::Critical) {
            return None;
        }
        let mut event = AlertEvent::new(AlertKind::HealthDegraded, "health", self.message.clone())
            .with_context("status", self.status.to_string())
            .with_context("failing_critical", self.failing_critical.clone())
            .with_context("failing_non_critical", self.failing_non_critical.clone());
        if let Some(last_check) = self.summary.last_check {
            event = event.with_timestamp(last_check);
        }
        Some(event)
    }
}

/// Runs registered probes with a concurrency cap and keeps the latest result
/// per probe name.
#[derive(Debug)]
pub struct HealthCheckOrchestrator {
    max_concurrency: usize,
    probes: Mutex<BTreeMap<String, HealthCheckSpec>>,
    results: Mutex<BTreeMap<String, HealthCheckResult>>,
}

impl Default for HealthCheckOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl HealthCheckOrchestrator {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            probes: Mutex::new(BTreeMap::new()),
            results: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Adds or replaces the probe named `spec.name`. Returns true on replace.
    pub fn register(&self, spec: HealthCheckSpec) -> bool {
        let name = spec.name.clone();
        let replaced = lock(&self.probes).insert(name.clone(), spec).is_some();
        debug!(probe = %name, replaced, "health probe registered");
        replaced
    }

    /// Drops the probe and its last result.
    pub fn remove(&self, name: &str) -> bool {
        let removed = lock(&self.probes).remove(name).is_some();
        lock(&self.results).remove(name);
        removed
    }

    pub fn probe_names(&self) -> Vec<String> {
        lock(&self.probes).keys().cloned().collect()
    }

    pub async fn run_one(&self, name: &str) -> Result<HealthCheckResult, HealthError> {
        let spec = lock(&self.probes)
            .get(name)
            .cloned()
            .ok_or_else(|| HealthError::UnknownProbe(name.to_string()))?;
        let result = execute(spec).await;
        self.store_results([&result]);
        Ok(result)
    }

    pub async fn run_all(&self) -> BTreeMap<String, HealthCheckResult> {
        let specs: Vec<HealthCheckSpec> = lock(&self.probes).values().cloned().collect();
        let results: BTreeMap<String, HealthCheckResult> = stream::iter(specs)
            .map(execute)
            .buffer_unordered(self.max_concurrency)
            .map(|result| (result.name.clone(), result))
            .collect()
            .await;

        self.store_results(results.values());

        let failing = results.values().filter(|result| !result.healthy).count();
        info!(
            probes = results.len(),
            failing,
            concurrency = self.max_concurrency,
            "health checks complete"
        );
        results
    }

    /// Keeps results only for probes still registered; a probe removed
    /// mid-run leaves no result behind.
    fn store_results<'a>(&self, results: impl IntoIterator<Item = &'a HealthCheckResult>) {
        let probes = lock(&self.probes);
        let mut latest = lock(&self.results);
        for result in results {
            if probes.contains_key(&result.name) {
                latest.insert(result.name.clone(), result.clone());
            }
        }
    }

    pub fn latest_results(&self) -> BTreeMap<String, HealthCheckResult> {
        lock(&self.results).clone()
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus::from_results(self.latest_results())
    }
}

async fn execute(spec: HealthCheckSpec) -> HealthCheckResult {
    let started = Instant::now();
    let timestamp = Utc::now();
    let probe = Arc::clone(&spec.probe);
    let mut handle = tokio::spawn(async move { probe.check().await });

    let (healthy, error) = match timeout(spec.timeout, &mut handle).await {
        Ok(Ok(Ok(healthy))) => (
            healthy,
            (!healthy).then(|| "probe reported unhealthy".to_string()),
        ),
        Ok(Ok(Err(err))) => (false, Some(err.to_string())),
        Ok(Err(join)) if join.is_panic() => (false, Some("probe panicked".to_string())),
        Ok(Err(join)) => (false, Some(format!("probe task failed: {join}"))),
        Err(_) => {
            handle.abort();
            let reason = format!("timed out after {}ms", spec.timeout.as_millis());
            (false, Some(reason))
        }
    };
    let latency = started.elapsed();

    if healthy {
        debug!(probe = %spec.name, latency_ms = latency.as_millis() as u64, "health probe passed");
    } else {
        warn!(
            probe = %spec.name,
            critical = spec.critical,
            latency_ms = latency.as_millis() as u64,
            error = error.as_deref().unwrap_or(""),
            "health probe failed"
        );
    }

    HealthCheckResult {
        name: spec.name,
        healthy,
        latency,
        timestamp,
        critical: spec.critical,
        error,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Healthy iff a GET on the target answers 2xx.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    url: reqwest::Url,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let url = reqwest::Url::parse(url)
            .map_err(|err| ProbeError::Failed(format!("invalid url {url}: {err}")))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        let response = self.client.get(self.url.clone()).send().await?;
        Ok(response.status().is_success())
    }
}

/// Healthy iff the path exists.
#[derive(Debug, Clone)]
pub struct PathProbe {
    path: PathBuf,
}

impl PathProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HealthProbe for PathProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        Ok(self.path.exists())
    }
}

/// Adapts an async closure into a probe.
pub struct FnProbe<F> {
    check: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, ProbeError>> + Send,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, ProbeError>> + Send,
{
    async fn check(&self) -> Result<bool, ProbeError> {
        (self.check)().await
    }
}
