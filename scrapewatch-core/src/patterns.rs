use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alerts::{AlertEvent, AlertKind};
use crate::config::PatternSection;
use crate::execution::{ErrorKind, ExecutionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    RecurringError,
    WebsiteStructureChange,
    RateLimiting,
    TimeBased,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PatternKind::RecurringError => "recurring_error",
            PatternKind::WebsiteStructureChange => "website_structure_change",
            PatternKind::RateLimiting => "rate_limiting",
            PatternKind::TimeBased => "time_based",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub pattern_kind: PatternKind,
    pub source_name: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub frequency: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub confidence: f64,
    pub suggested_remedy: String,
}

impl FailurePattern {
    pub fn to_alert_event(&self) -> AlertEvent {
        let message = format!(
            "{kind} detected for {source}: {error_kind} x{frequency} (confidence {confidence:.2})",
            kind = self.pattern_kind,
            source = self.source_name,
            error_kind = self.error_kind,
            frequency = self.frequency,
            confidence = self.confidence,
        );
        AlertEvent::new(AlertKind::FailurePattern, self.source_name.clone(), message)
            .with_timestamp(self.last_seen)
            .with_context("pattern_kind", self.pattern_kind.to_string())
            .with_context("error_kind", self.error_kind.as_str())
            .with_context("error_message", self.error_message.clone())
            .with_context("frequency", self.frequency)
            .with_context("confidence", self.confidence)
            .with_context("first_seen", self.first_seen.to_rfc3339())
            .with_context("suggested_remedy", self.suggested_remedy.clone())
    }
}

pub fn suggested_remedy(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Http404 => "Verify the source URL; the page may have moved or been removed",
        ErrorKind::Http403 => "Access is being refused; review user agent, headers and IP reputation",
        ErrorKind::Http429 => "Lower the request rate or widen the delay between requests",
        ErrorKind::Http5xx => "Upstream is failing; retry later and watch the provider status",
        ErrorKind::Timeout => "Raise the request timeout or check latency to the source",
        ErrorKind::ConnectionError => "Check network connectivity and DNS resolution for the source",
        ErrorKind::ParsingSelector => {
            "Update CSS/XPath selectors; the page layout has likely changed"
        }
        ErrorKind::Parsing => "Review the parser against the current response format",
        ErrorKind::EmptyData => "Confirm the source publishes data for the requested period",
        ErrorKind::Validation => "Review validation rules against recent source data",
        ErrorKind::Unknown => "Review the error message and stack capture for details",
    }
}

/// Groups failed executions into named failure patterns.
#[derive(Debug, Clone, Default)]
pub struct FailurePatternAnalyzer {
    config: PatternSection,
}

impl FailurePatternAnalyzer {
    pub fn new(config: PatternSection) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PatternSection {
        &self.config
    }

    /// Runs every detector over the failed records in `records` and returns
    /// the combined patterns, highest confidence first.
    pub fn analyze(
        &self,
        records: &[ExecutionRecord],
        source_filter: Option<&str>,
        min_frequency: usize,
    ) -> Vec<FailurePattern> {
        let failures: Vec<&ExecutionRecord> = records
            .iter()
            .filter(|record| !record.success)
            .filter(|record| source_filter.map_or(true, |source| record.source_name == source))
            .collect();
        if failures.is_empty() {
            return Vec::new();
        }

        let mut patterns = self.recurring_errors(&failures, min_frequency);
        patterns.extend(self.structure_changes(&failures));
        patterns.extend(self.rate_limiting(&failures));
        patterns.extend(self.time_based(&failures));
        patterns.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        debug!(
            failures = failures.len(),
            patterns = patterns.len(),
            source = source_filter.unwrap_or("*"),
            "failure pattern analysis complete"
        );
        patterns
    }

    fn recurring_errors(
        &self,
        failures: &[&ExecutionRecord],
        min_frequency: usize,
    ) -> Vec<FailurePattern> {
        let mut groups: BTreeMap<(ErrorKind, &str), Vec<&ExecutionRecord>> = BTreeMap::new();
        for &record in failures {
            let message = record.error_message.as_deref().unwrap_or("");
            groups
                .entry((record.kind_or_unknown(), message))
                .or_default()
                .push(record);
        }

        groups
            .into_iter()
            .filter(|(_, group)| group.len() >= min_frequency.max(1))
            .map(|((kind, message), group)| {
                let mut sources: Vec<&str> = group
                    .iter()
                    .map(|record| record.source_name.as_str())
                    .collect();
                sources.sort_unstable();
                sources.dedup();
                let (first_seen, last_seen) = span(&group);
                FailurePattern {
                    pattern_kind: PatternKind::RecurringError,
                    source_name: sources.join(", "),
                    error_kind: kind,
                    error_message: message.to_string(),
                    frequency: group.len(),
                    first_seen,
                    last_seen,
                    confidence: scaled(group.len(), self.config.recurring_confidence_scale, 1.0),
                    suggested_remedy: suggested_remedy(kind).to_string(),
                }
            })
            .collect()
    }

    fn structure_changes(&self, failures: &[&ExecutionRecord]) -> Vec<FailurePattern> {
        let parsing: Vec<&ExecutionRecord> = failures
            .iter()
            .copied()
            .filter(|record| record.kind_or_unknown().is_parsing())
            .collect();
        by_source(&parsing)
            .into_iter()
            .filter(|(_, group)| group.len() >= self.config.structure_change_min_failures)
            .map(|(source, group)| {
                let (first_seen, last_seen) = span(&group);
                FailurePattern {
                    pattern_kind: PatternKind::WebsiteStructureChange,
                    source_name: source.to_string(),
                    error_kind: latest_kind(&group),
                    error_message: format!(
                        "{} parsing failures; page structure may have changed",
                        group.len()
                    ),
                    frequency: group.len(),
                    first_seen,
                    last_seen,
                    confidence: scaled(
                        group.len(),
                        self.config.structure_change_confidence_scale,
                        1.0,
                    ),
                    suggested_remedy: suggested_remedy(ErrorKind::ParsingSelector).to_string(),
                }
            })
            .collect()
    }

    fn rate_limiting(&self, failures: &[&ExecutionRecord]) -> Vec<FailurePattern> {
        let limited: Vec<&ExecutionRecord> = failures
            .iter()
            .copied()
            .filter(|record| record.kind_or_unknown() == ErrorKind::Http429)
            .collect();
        by_source(&limited)
            .into_iter()
            .filter(|(_, group)| group.len() >= self.config.rate_limit_min_failures)
            .map(|(source, group)| {
                let (first_seen, last_seen) = span(&group);
                FailurePattern {
                    pattern_kind: PatternKind::RateLimiting,
                    source_name: source.to_string(),
                    error_kind: ErrorKind::Http429,
                    error_message: format!("{} rate-limited responses", group.len()),
                    frequency: group.len(),
                    first_seen,
                    last_seen,
                    confidence: scaled(group.len(), self.config.rate_limit_confidence_scale, 1.0),
                    suggested_remedy: suggested_remedy(ErrorKind::Http429).to_string(),
                }
            })
            .collect()
    }

    fn time_based(&self, failures: &[&ExecutionRecord]) -> Vec<FailurePattern> {
        let mut by_hour: BTreeMap<u32, Vec<&ExecutionRecord>> = BTreeMap::new();
        for &record in failures {
            by_hour.entry(record.timestamp.hour()).or_default().push(record);
        }
        let average = failures.len() as f64 / by_hour.len() as f64;
        let hour_floor = average * self.config.time_based_hour_multiplier;

        let mut patterns = Vec::new();
        for (hour, records) in &by_hour {
            let count = records.len();
            if (count as f64) < hour_floor || count < self.config.time_based_min_hour_failures {
                continue;
            }
            for (source, group) in by_source(records) {
                if group.len() < self.config.time_based_min_source_failures {
                    continue;
                }
                let (first_seen, last_seen) = span(&group);
                patterns.push(FailurePattern {
                    pattern_kind: PatternKind::TimeBased,
                    source_name: source.to_string(),
                    error_kind: latest_kind(&group),
                    error_message: format!(
                        "{} failures clustered at {hour:02}:00 UTC",
                        group.len()
                    ),
                    frequency: group.len(),
                    first_seen,
                    last_seen,
                    confidence: scaled(
                        group.len(),
                        self.config.time_based_confidence_scale,
                        self.config.time_based_confidence_cap,
                    ),
                    suggested_remedy: format!(
                        "Reschedule runs away from {hour:02}:00 UTC or check source maintenance windows"
                    ),
                });
            }
        }
        patterns
    }
}

fn scaled(count: usize, scale: f64, cap: f64) -> f64 {
    if scale <= 0.0 {
        return cap;
    }
    (count as f64 / scale).min(cap)
}

fn by_source<'a>(records: &[&'a ExecutionRecord]) -> BTreeMap<&'a str, Vec<&'a ExecutionRecord>> {
    let mut groups: BTreeMap<&str, Vec<&ExecutionRecord>> = BTreeMap::new();
    for &record in records {
        groups
            .entry(record.source_name.as_str())
            .or_default()
            .push(record);
    }
    groups
}

fn span(group: &[&ExecutionRecord]) -> (DateTime<Utc>, DateTime<Utc>) {
    let first = group.iter().map(|record| record.timestamp).min();
    let last = group.iter().map(|record| record.timestamp).max();
    let now = Utc::now();
    (first.unwrap_or(now), last.unwrap_or(now))
}

fn latest_kind(group: &[&ExecutionRecord]) -> ErrorKind {
    group
        .iter()
        .max_by_key(|record| record.timestamp)
        .map_or(ErrorKind::Unknown, |record| record.kind_or_unknown())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn failure(source: &str, message: &str, hour: u32, minute: u32) -> ExecutionRecord {
        let record = ExecutionRecord::failure(source, Duration::from_millis(250), message)
            .with_timestamp(Utc.with_ymd_and_hms(2024, 3, 11, hour, minute, 0).unwrap());
        let kind = crate::execution::classify_error(message);
        record.with_error_kind(kind)
    }

    fn analyzer() -> FailurePatternAnalyzer {
        FailurePatternAnalyzer::default()
    }

    #[test]
    fn identical_failures_form_one_recurring_pattern() {
        let records = vec![
            failure("b3", "Request timeout", 9, 0),
            failure("b3", "Request timeout", 10, 0),
            failure("b3", "Request timeout", 11, 0),
        ];
        let patterns = analyzer().analyze(&records, None, 2);
        assert_eq!(patterns.len(), 1);
        let pattern = &patterns[0];
        assert_eq!(pattern.pattern_kind, PatternKind::RecurringError);
        assert_eq!(pattern.frequency, 3);
        assert!((pattern.confidence - 0.3).abs() < 1e-9);
        assert_eq!(pattern.error_kind, ErrorKind::Timeout);
        assert_eq!(pattern.first_seen.hour(), 9);
        assert_eq!(pattern.last_seen.hour(), 11);
    }

    #[test]
    fn single_rate_limit_is_not_a_pattern() {
        let records = vec![failure("yahoo", "429 Too Many Requests", 9, 0)];
        let patterns = analyzer().analyze(&records, None, 2);
        assert!(patterns
            .iter()
            .all(|pattern| pattern.pattern_kind != PatternKind::RateLimiting));
    }

    #[test]
    fn repeated_rate_limits_per_source() {
        let records = vec![
            failure("yahoo", "429 Too Many Requests", 9, 0),
            failure("yahoo", "rate limit hit", 10, 0),
            failure("b3", "429 Too Many Requests", 11, 0),
        ];
        let patterns = analyzer().analyze(&records, None, 2);
        let rate: Vec<_> = patterns
            .iter()
            .filter(|pattern| pattern.pattern_kind == PatternKind::RateLimiting)
            .collect();
        assert_eq!(rate.len(), 1);
        assert_eq!(rate[0].source_name, "yahoo");
        assert!((rate[0].confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn parsing_failures_flag_structure_change() {
        let records = vec![
            failure("anbima", "CSS selector .rate not present", 8, 0),
            failure("anbima", "failed parsing table", 9, 0),
            failure("cvm", "failed parsing table", 9, 30),
        ];
        let patterns = analyzer().analyze(&records, Some("anbima"), 2);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_kind, PatternKind::WebsiteStructureChange);
        assert_eq!(patterns[0].source_name, "anbima");
        assert_eq!(patterns[0].frequency, 2);
    }

    #[test]
    fn clustered_hour_yields_capped_time_pattern() {
        let mut records = Vec::new();
        for minute in 0..12 {
            records.push(failure("tesouro", &format!("unexpected reply {minute}"), 3, minute));
        }
        for hour in [5, 7, 9, 11, 13, 15] {
            records.push(failure("tesouro", &format!("unexpected reply h{hour}"), hour, 0));
        }
        let patterns = analyzer().analyze(&records, None, 2);
        let timed: Vec<_> = patterns
            .iter()
            .filter(|pattern| pattern.pattern_kind == PatternKind::TimeBased)
            .collect();
        assert_eq!(timed.len(), 1);
        assert_eq!(timed[0].frequency, 12);
        assert!((timed[0].confidence - 0.8).abs() < 1e-9);
        assert!(timed[0].error_message.contains("03:00"));
    }

    fn time_based(patterns: &[FailurePattern]) -> Vec<&FailurePattern> {
        patterns
            .iter()
            .filter(|pattern| pattern.pattern_kind == PatternKind::TimeBased)
            .collect()
    }

    #[test]
    fn hours_below_twice_average_are_ignored() {
        let mut records = Vec::new();
        for hour in [1, 2, 4, 5] {
            for minute in 0..3 {
                records.push(failure("cvm", "unexpected reply", hour, minute));
            }
        }
        for minute in 0..8 {
            records.push(failure("cvm", "unexpected reply", 20, minute));
        }
        // 20 failures over 5 hours: average 4, so only hours with >= 8 qualify.
        let patterns = analyzer().analyze(&records, None, 2);
        let timed = time_based(&patterns);
        assert_eq!(timed.len(), 1);
        assert_eq!(timed[0].frequency, 8);
        assert!(timed[0].error_message.contains("20:00"));
    }

    #[test]
    fn busy_hour_split_across_sources_is_not_a_pattern() {
        let records = vec![
            failure("cvm", "unexpected reply", 20, 0),
            failure("cvm", "unexpected reply", 20, 10),
            failure("b3", "unexpected reply", 20, 20),
            failure("b3", "unexpected reply", 20, 30),
            failure("cvm", "unexpected reply", 8, 0),
            failure("b3", "unexpected reply", 14, 0),
        ];
        let patterns = analyzer().analyze(&records, None, 2);
        assert!(time_based(&patterns).is_empty());
    }

    #[test]
    fn results_sorted_by_confidence() {
        let mut records = Vec::new();
        for hour in 0..6 {
            records.push(failure("yahoo", "429 Too Many Requests", hour, 0));
        }
        records.push(failure("b3", "empty response", 1, 0));
        records.push(failure("b3", "empty response", 2, 0));
        let patterns = analyzer().analyze(&records, None, 2);
        assert!(patterns.len() >= 3);
        assert!(patterns
            .windows(2)
            .all(|pair| pair[0].confidence >= pair[1].confidence));
        assert_eq!(patterns[0].pattern_kind, PatternKind::RateLimiting);
    }

    #[test]
    fn pattern_converts_to_alert() {
        let records = vec![
            failure("b3", "HTTP 404", 9, 0),
            failure("b3", "HTTP 404", 10, 0),
        ];
        let pattern = analyzer().analyze(&records, None, 2).remove(0);
        let alert = pattern.to_alert_event();
        assert_eq!(alert.alert_kind, AlertKind::FailurePattern);
        assert_eq!(alert.data_source, "b3");
        assert_eq!(alert.context["pattern_kind"], "recurring_error");
        assert_eq!(alert.context["error_kind"], "HTTP_404");
    }
}
