use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ThresholdBreach,
    SignificantChange,
    Anomaly,
    FailurePattern,
    HealthDegraded,
    ScraperFailure,
    Custom,
}

impl AlertKind {
    pub fn badge(self) -> &'static str {
        match self {
            Self::ThresholdBreach => "THRESHOLD",
            Self::SignificantChange => "CHANGE",
            Self::Anomaly => "ANOMALY",
            Self::FailurePattern => "PATTERN",
            Self::HealthDegraded => "HEALTH",
            Self::ScraperFailure => "FAILURE",
            Self::Custom => "ALERT",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            Self::ThresholdBreach => "🚨",
            Self::SignificantChange => "📈",
            Self::Anomaly => "⚠️",
            Self::FailurePattern => "🔁",
            Self::HealthDegraded => "🩺",
            Self::ScraperFailure => "❌",
            Self::Custom => "ℹ️",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ThresholdBreach => "threshold_breach",
            Self::SignificantChange => "significant_change",
            Self::Anomaly => "anomaly",
            Self::FailurePattern => "failure_pattern",
            Self::HealthDegraded => "health_degraded",
            Self::ScraperFailure => "scraper_failure",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "threshold_breach" => Ok(Self::ThresholdBreach),
            "significant_change" => Ok(Self::SignificantChange),
            "anomaly" => Ok(Self::Anomaly),
            "failure_pattern" => Ok(Self::FailurePattern),
            "health_degraded" => Ok(Self::HealthDegraded),
            "scraper_failure" => Ok(Self::ScraperFailure),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown alert kind: {other}")),
        }
    }
}

/// Alert payload handed to every notification channel. Producers build it
/// once; the dispatcher only fills in a missing timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_kind: AlertKind,
    pub data_source: String,
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub current_value: Option<f64>,
    #[serde(default)]
    pub previous_value: Option<f64>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub change_percent: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl AlertEvent {
    pub fn new(
        alert_kind: AlertKind,
        data_source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_kind,
            data_source: data_source.into(),
            metric_name: None,
            current_value: None,
            previous_value: None,
            threshold: None,
            change_percent: None,
            timestamp: None,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, metric_name: impl Into<String>) -> Self {
        self.metric_name = Some(metric_name.into());
        self
    }

    pub fn with_current_value(mut self, value: f64) -> Self {
        self.current_value = Some(value);
        self
    }

    pub fn with_previous_value(mut self, value: f64) -> Self {
        self.previous_value = Some(value);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_change_percent(mut self, change_percent: f64) -> Self {
        self.change_percent = Some(change_percent);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn stamped(mut self) -> Self {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
        self
    }

    pub fn subject(&self) -> String {
        format!(
            "[{badge}] {source} - {kind}",
            badge = self.alert_kind.badge(),
            source = self.data_source,
            kind = self.alert_kind
        )
    }

    /// Plain-text body shared by the network channels.
    pub fn render_text(&self) -> String {
        let mut lines = vec![format!(
            "{emoji} {subject}",
            emoji = self.alert_kind.emoji(),
            subject = self.subject()
        )];
        lines.push(self.message.clone());
        if let Some(metric) = &self.metric_name {
            lines.push(format!("Metric: {metric}"));
        }
        if let Some(current) = self.current_value {
            lines.push(format!("Current: {current}"));
        }
        if let Some(previous) = self.previous_value {
            lines.push(format!("Previous: {previous}"));
        }
        if let Some(threshold) = self.threshold {
            lines.push(format!("Threshold: {threshold}"));
        }
        if let Some(change) = self.change_percent {
            lines.push(format!("Change: {change:+.2}%"));
        }
        if let Some(timestamp) = self.timestamp {
            lines.push(format!("Time: {}", timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        for (key, value) in &self.context {
            match value {
                Value::String(text) => lines.push(format!("{key}: {text}")),
                other => lines.push(format!("{key}: {other}")),
            }
        }
        lines.join("\n")
    }
}
