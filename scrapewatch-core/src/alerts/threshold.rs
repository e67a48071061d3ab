use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::ThresholdRule;
use crate::metrics::MetricSample;

use super::event::{AlertEvent, AlertKind};

/// Checks incoming samples against static bounds and against the previous
/// value reported by the same source.
#[derive(Debug, Default)]
pub struct ThresholdEvaluator {
    rules: Vec<ThresholdRule>,
    last_values: Mutex<HashMap<(String, String), f64>>,
}

impl ThresholdEvaluator {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self {
            rules,
            last_values: Mutex::new(HashMap::new()),
        }
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    pub fn evaluate(&self, sample: &MetricSample) -> Vec<AlertEvent> {
        let previous = {
            let mut guard = self
                .last_values
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.insert(
                (sample.data_source.clone(), sample.metric_name.clone()),
                sample.value,
            )
        };

        let mut alerts = Vec::new();
        for rule in self.rules.iter().filter(|rule| applies(rule, sample)) {
            if let Some(upper) = rule.upper {
                if sample.value > upper {
                    alerts.push(breach(sample, upper, "above", previous));
                }
            }
            if let Some(lower) = rule.lower {
                if sample.value < lower {
                    alerts.push(breach(sample, lower, "below", previous));
                }
            }
            if let (Some(limit), Some(previous)) = (rule.max_change_percent, previous) {
                if previous != 0.0 {
                    let change = (sample.value - previous) / previous.abs() * 100.0;
                    if change.abs() >= limit {
                        let message = format!(
                            "{metric} moved {change:+.2}% ({previous} -> {value}), limit {limit}%",
                            metric = sample.metric_name,
                            value = sample.value,
                        );
                        alerts.push(
                            with_tags(
                                AlertEvent::new(
                                    AlertKind::SignificantChange,
                                    sample.data_source.clone(),
                                    message,
                                ),
                                sample,
                            )
                            .with_previous_value(previous)
                            .with_threshold(limit)
                            .with_change_percent(change),
                        );
                    }
                }
            }
        }
        alerts
    }
}

fn applies(rule: &ThresholdRule, sample: &MetricSample) -> bool {
    rule.metric_name == sample.metric_name
        && rule
            .data_source
            .as_deref()
            .map_or(true, |source| source == sample.data_source)
}

fn breach(sample: &MetricSample, bound: f64, side: &str, previous: Option<f64>) -> AlertEvent {
    let message = format!(
        "{metric} = {value} {side} threshold {bound}",
        metric = sample.metric_name,
        value = sample.value,
    );
    let mut event = with_tags(
        AlertEvent::new(AlertKind::ThresholdBreach, sample.data_source.clone(), message),
        sample,
    )
    .with_threshold(bound);
    if let Some(previous) = previous {
        event = event.with_previous_value(previous);
        if previous != 0.0 {
            event = event.with_change_percent((sample.value - previous) / previous.abs() * 100.0);
        }
    }
    event
}

fn with_tags(event: AlertEvent, sample: &MetricSample) -> AlertEvent {
    let mut event = event
        .with_metric(sample.metric_name.clone())
        .with_current_value(sample.value)
        .with_timestamp(sample.timestamp);
    for (key, value) in &sample.tags {
        event = event.with_context(key.clone(), value.clone());
    }
    event
}
