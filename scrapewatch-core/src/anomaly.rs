use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts::{AlertEvent, AlertKind};
use crate::metrics::MetricHistoryStore;

pub const DEFAULT_MIN_HISTORY: usize = 10;

const SIGMA_BAND: f64 = 2.0;
const IQR_FENCE: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Statistical,
    Iqr,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMethod::Statistical => write!(f, "statistical"),
            DetectionMethod::Iqr => write!(f, "iqr"),
        }
    }
}

impl FromStr for DetectionMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "statistical" | "zscore" | "z-score" => Ok(DetectionMethod::Statistical),
            "iqr" => Ok(DetectionMethod::Iqr),
            other => Err(format!("unknown detection method: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub metric_name: String,
    pub current_value: f64,
    pub expected_range: (f64, f64),
    pub is_anomaly: bool,
    pub confidence: f64,
    pub method: DetectionMethod,
    pub timestamp: DateTime<Utc>,
}

impl AnomalyResult {
    pub fn to_alert_event(&self, data_source: impl Into<String>) -> AlertEvent {
        let (low, high) = self.expected_range;
        let message = format!(
            "{metric} = {value:.4} outside expected range [{low:.4}, {high:.4}] ({method}, confidence {confidence:.0}%)",
            metric = self.metric_name,
            value = self.current_value,
            method = self.method,
            confidence = self.confidence * 100.0,
        );
        let threshold = if self.current_value > high { high } else { low };
        AlertEvent::new(AlertKind::Anomaly, data_source, message)
            .with_metric(self.metric_name.clone())
            .with_current_value(self.current_value)
            .with_threshold(threshold)
            .with_context("method", self.method.to_string())
            .with_context("confidence", self.confidence)
            .with_context("expected_low", low)
            .with_context("expected_high", high)
    }
}

/// Outlier detection over the values held by a [`MetricHistoryStore`].
/// Detection only reads history; callers record the new sample afterwards.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    store: Arc<MetricHistoryStore>,
    min_history: usize,
}

impl AnomalyDetector {
    pub fn new(store: Arc<MetricHistoryStore>) -> Self {
        Self {
            store,
            min_history: DEFAULT_MIN_HISTORY,
        }
    }

    pub fn with_min_history(mut self, min_history: usize) -> Self {
        self.min_history = min_history.max(2);
        self
    }

    pub fn min_history(&self) -> usize {
        self.min_history
    }

    /// `None` means there is not enough history yet, which is expected for
    /// freshly registered metrics.
    pub fn detect(
        &self,
        metric_name: &str,
        current_value: f64,
        method: DetectionMethod,
    ) -> Option<AnomalyResult> {
        let history = self.store.snapshot(metric_name);
        evaluate(metric_name, &history, current_value, method, self.min_history)
    }
}

pub fn evaluate(
    metric_name: &str,
    history: &[f64],
    current_value: f64,
    method: DetectionMethod,
    min_history: usize,
) -> Option<AnomalyResult> {
    if history.len() < min_history || history.is_empty() {
        return None;
    }
    let (expected_range, is_anomaly, confidence) = match method {
        DetectionMethod::Statistical => statistical(history, current_value),
        DetectionMethod::Iqr => interquartile(history, current_value),
    };
    Some(AnomalyResult {
        metric_name: metric_name.to_string(),
        current_value,
        expected_range,
        is_anomaly,
        confidence,
        method,
        timestamp: Utc::now(),
    })
}

fn statistical(history: &[f64], value: f64) -> ((f64, f64), bool, f64) {
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history
        .iter()
        .map(|sample| (sample - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0).max(1.0);
    let std_dev = variance.sqrt();
    let low = mean - SIGMA_BAND * std_dev;
    let high = mean + SIGMA_BAND * std_dev;
    let is_anomaly = value < low || value > high;
    let confidence = if std_dev == 0.0 {
        if value == mean {
            0.0
        } else {
            1.0
        }
    } else {
        ((value - mean).abs() / std_dev / SIGMA_BAND).min(1.0)
    };
    ((low, high), is_anomaly, confidence)
}

fn interquartile(history: &[f64], value: f64) -> ((f64, f64), bool, f64) {
    let mut sorted = history.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let q1 = sorted[n / 4];
    let q3 = sorted[(3 * n) / 4];
    let iqr = q3 - q1;
    let low = q1 - IQR_FENCE * iqr;
    let high = q3 + IQR_FENCE * iqr;
    let is_anomaly = value < low || value > high;
    let confidence = if !is_anomaly {
        0.0
    } else if iqr == 0.0 {
        1.0
    } else {
        let distance = if value < low { low - value } else { value - high };
        (distance / (0.5 * iqr)).min(1.0)
    };
    ((low, high), is_anomaly, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSample;

    const HISTORY: [f64; 10] = [10.0, 12.0, 11.0, 13.0, 10.0, 12.0, 11.0, 14.0, 10.0, 13.0];

    fn detector_with_history(values: &[f64]) -> AnomalyDetector {
        let store = Arc::new(MetricHistoryStore::default());
        for value in values {
            store.record(&MetricSample::new("close_price", "yahoo", *value));
        }
        AnomalyDetector::new(store)
    }

    #[test]
    fn statistical_flags_far_outlier() {
        let detector = detector_with_history(&HISTORY);
        let result = detector
            .detect("close_price", 50.0, DetectionMethod::Statistical)
            .expect("enough history");
        assert!(result.is_anomaly);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.method, DetectionMethod::Statistical);

        let normal = detector
            .detect("close_price", 12.0, DetectionMethod::Statistical)
            .unwrap();
        assert!(!normal.is_anomaly);
        assert!(normal.confidence < 0.5);
        let (low, high) = normal.expected_range;
        assert!(low < 11.6 && high > 11.6);
    }

    #[test]
    fn iqr_uses_positional_quartiles() {
        let detector = detector_with_history(&HISTORY);
        let outlier = detector
            .detect("close_price", 100.0, DetectionMethod::Iqr)
            .unwrap();
        assert!(outlier.is_anomaly);
        assert_eq!(outlier.expected_range, (5.5, 17.5));
        assert_eq!(outlier.confidence, 1.0);

        let near_median = detector
            .detect("close_price", 11.5, DetectionMethod::Iqr)
            .unwrap();
        assert!(!near_median.is_anomaly);
        assert_eq!(near_median.confidence, 0.0);
    }

    #[test]
    fn iqr_confidence_scales_with_distance() {
        let detector = detector_with_history(&HISTORY);
        // upper fence 17.5, half IQR 1.5
        let result = detector
            .detect("close_price", 18.25, DetectionMethod::Iqr)
            .unwrap();
        assert!(result.is_anomaly);
        assert!((result.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn insufficient_history_returns_none() {
        let detector = detector_with_history(&HISTORY[..9]);
        assert!(detector
            .detect("close_price", 50.0, DetectionMethod::Statistical)
            .is_none());
        assert!(detector
            .detect("unknown", 1.0, DetectionMethod::Iqr)
            .is_none());
    }

    #[test]
    fn flat_history_uses_binary_confidence() {
        let detector = detector_with_history(&[5.0; 12]);
        let same = detector
            .detect("close_price", 5.0, DetectionMethod::Statistical)
            .unwrap();
        assert!(!same.is_anomaly);
        assert_eq!(same.confidence, 0.0);
        let different = detector
            .detect("close_price", 5.1, DetectionMethod::Statistical)
            .unwrap();
        assert!(different.is_anomaly);
        assert_eq!(different.confidence, 1.0);
    }

    #[test]
    fn detection_does_not_mutate_history() {
        let detector = detector_with_history(&HISTORY);
        detector.detect("close_price", 99.0, DetectionMethod::Iqr);
        assert_eq!(detector.store.snapshot("close_price"), HISTORY.to_vec());
    }

    #[test]
    fn anomaly_alert_carries_metric_fields() {
        let detector = detector_with_history(&HISTORY);
        let result = detector
            .detect("close_price", 50.0, DetectionMethod::Statistical)
            .unwrap();
        let event = result.to_alert_event("yahoo");
        assert_eq!(event.alert_kind, AlertKind::Anomaly);
        assert_eq!(event.data_source, "yahoo");
        assert_eq!(event.metric_name.as_deref(), Some("close_price"));
        assert_eq!(event.current_value, Some(50.0));
        assert_eq!(event.threshold, Some(result.expected_range.1));
    }

    #[test]
    fn parses_method_names() {
        assert_eq!("IQR".parse::<DetectionMethod>(), Ok(DetectionMethod::Iqr));
        assert_eq!(
            "statistical".parse::<DetectionMethod>(),
            Ok(DetectionMethod::Statistical)
        );
        assert!("median".parse::<DetectionMethod>().is_err());
    }
}
