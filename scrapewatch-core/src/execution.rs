use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::duration_millis;

pub const DEFAULT_EXECUTION_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "HTTP_404")]
    Http404,
    #[serde(rename = "HTTP_403")]
    Http403,
    #[serde(rename = "HTTP_429")]
    Http429,
    #[serde(rename = "HTTP_5XX")]
    Http5xx,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CONNECTION_ERROR")]
    ConnectionError,
    #[serde(rename = "PARSING_SELECTOR")]
    ParsingSelector,
    #[serde(rename = "PARSING")]
    Parsing,
    #[serde(rename = "EMPTY_DATA")]
    EmptyData,
    #[serde(rename = "VALIDATION")]
    Validation,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Http404 => "HTTP_404",
            ErrorKind::Http403 => "HTTP_403",
            ErrorKind::Http429 => "HTTP_429",
            ErrorKind::Http5xx => "HTTP_5XX",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::ParsingSelector => "PARSING_SELECTOR",
            ErrorKind::Parsing => "PARSING",
            ErrorKind::EmptyData => "EMPTY_DATA",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    pub fn is_parsing(self) -> bool {
        matches!(self, ErrorKind::ParsingSelector | ErrorKind::Parsing)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn server_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b5\d\d\b").expect("valid regex"))
}

/// Maps a free-form failure message onto an [`ErrorKind`]. Rules are checked
/// in order and the first hit wins.
pub fn classify_error(message: &str) -> ErrorKind {
    let text = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if has(&["404", "not found"]) {
        ErrorKind::Http404
    } else if has(&["403", "forbidden"]) {
        ErrorKind::Http403
    } else if has(&["429", "rate limit"]) {
        ErrorKind::Http429
    } else if server_error_pattern().is_match(&text) {
        ErrorKind::Http5xx
    } else if has(&["timeout", "timed out"]) {
        ErrorKind::Timeout
    } else if has(&["connection"]) {
        ErrorKind::ConnectionError
    } else if has(&["selector", "css", "xpath"]) {
        ErrorKind::ParsingSelector
    } else if has(&["parse", "parsing"]) {
        ErrorKind::Parsing
    } else if has(&["empty", "no data"]) {
        ErrorKind::EmptyData
    } else if has(&["validation", "invalid"]) {
        ErrorKind::Validation
    } else {
        ErrorKind::Unknown
    }
}

/// Outcome of one scraper run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub source_name: String,
    pub success: bool,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stack_capture: Option<String>,
}

impl ExecutionRecord {
    pub fn success(source_name: impl Into<String>, duration: Duration) -> Self {
        Self {
            source_name: source_name.into(),
            success: true,
            duration,
            timestamp: Utc::now(),
            error_kind: None,
            error_message: None,
            stack_capture: None,
        }
    }

    pub fn failure(
        source_name: impl Into<String>,
        duration: Duration,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            success: false,
            duration,
            timestamp: Utc::now(),
            error_kind: None,
            error_message: Some(error_message.into()),
            stack_capture: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with_stack_capture(mut self, stack: impl Into<String>) -> Self {
        self.stack_capture = Some(stack.into());
        self
    }

    /// Fills `error_kind` from the message when the caller left it empty.
    fn classified(mut self) -> Self {
        if self.error_kind.is_none() {
            if let Some(message) = &self.error_message {
                self.error_kind = Some(classify_error(message));
            } else if !self.success {
                self.error_kind = Some(ErrorKind::Unknown);
            }
        }
        self
    }

    pub fn kind_or_unknown(&self) -> ErrorKind {
        self.error_kind.unwrap_or(ErrorKind::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStats {
    pub runs: usize,
    pub failures: usize,
    pub success_rate: f64,
    #[serde(with = "duration_millis")]
    pub mean_duration: Duration,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ExecutionLogError {
    #[error("io error at {path:?}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Most recent execution records, oldest evicted first. When opened on a
/// path, every append is also written to an append-only JSON lines file.
#[derive(Debug)]
pub struct ExecutionLog {
    capacity: usize,
    records: Mutex<VecDeque<ExecutionRecord>>,
    journal: Option<(PathBuf, Mutex<File>)>,
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTION_LOG_CAPACITY)
    }
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
            journal: None,
        }
    }

    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, ExecutionLogError> {
        let path = path.as_ref().to_path_buf();
        let io_error = |source| ExecutionLogError::Io {
            source,
            path: path.clone(),
        };
        if let Some(parent) = path.parent() {
            create_dir_all(parent).map_err(io_error)?;
        }

        let mut log = Self::new(capacity);
        let mut records = VecDeque::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path).map_err(io_error)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line.map_err(io_error)?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ExecutionRecord>(&line) {
                    Ok(record) => {
                        records.push_back(record);
                        if records.len() > log.capacity {
                            records.pop_front();
                        }
                    }
                    Err(err) => {
                        warn!(
                            path = %path.display(),
                            line = index + 1,
                            error = %err,
                            "skipping malformed execution record"
                        );
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;
        log.records = Mutex::new(records);
        log.journal = Some((path, Mutex::new(file)));
        Ok(log)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Classifies and stores `record`, returning the stored copy. A failed
    /// journal write is logged and the record is still kept in memory.
    pub fn append(&self, record: ExecutionRecord) -> ExecutionRecord {
        let record = record.classified();
        {
            let mut guard = self.lock();
            guard.push_back(record.clone());
            while guard.len() > self.capacity {
                guard.pop_front();
            }
        }
        if let Some((path, file)) = &self.journal {
            if let Err(err) = write_line(file, &record) {
                warn!(path = %path.display(), error = %err, "failed to journal execution record");
            }
        }
        record
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn failures(&self, source_filter: Option<&str>) -> Vec<ExecutionRecord> {
        self.lock()
            .iter()
            .filter(|record| !record.success)
            .filter(|record| source_filter.map_or(true, |source| record.source_name == source))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn source_stats(&self) -> BTreeMap<String, SourceStats> {
        let guard = self.lock();
        let mut grouped: BTreeMap<&str, Vec<&ExecutionRecord>> = BTreeMap::new();
        for record in guard.iter() {
            grouped.entry(&record.source_name).or_default().push(record);
        }
        grouped
            .into_iter()
            .map(|(source, records)| {
                let runs = records.len();
                let failures = records.iter().filter(|record| !record.success).count();
                let total: Duration = records.iter().map(|record| record.duration).sum();
                let stats = SourceStats {
                    runs,
                    failures,
                    success_rate: (runs - failures) as f64 / runs as f64,
                    mean_duration: total / runs as u32,
                    last_run: records.iter().map(|record| record.timestamp).max(),
                };
                (source.to_string(), stats)
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ExecutionRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn write_line(file: &Mutex<File>, record: &ExecutionRecord) -> std::io::Result<()> {
    let json = serde_json::to_string(record)?;
    let mut guard = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    writeln!(guard, "{json}")?;
    guard.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn classification_follows_rule_order() {
        assert_eq!(classify_error("HTTP 404 Not Found"), ErrorKind::Http404);
        assert_eq!(classify_error("page not found"), ErrorKind::Http404);
        assert_eq!(classify_error("403 Forbidden"), ErrorKind::Http403);
        assert_eq!(classify_error("Rate limit exceeded"), ErrorKind::Http429);
        assert_eq!(classify_error("upstream returned 503"), ErrorKind::Http5xx);
        assert_eq!(classify_error("Request timeout after 30s"), ErrorKind::Timeout);
        assert_eq!(classify_error("Connection reset by peer"), ErrorKind::ConnectionError);
        assert_eq!(classify_error("CSS selector .price missing"), ErrorKind::ParsingSelector);
        assert_eq!(classify_error("failed parsing table"), ErrorKind::Parsing);
        assert_eq!(classify_error("could not parse date"), ErrorKind::Parsing);
        assert_eq!(classify_error("No data returned"), ErrorKind::EmptyData);
        assert_eq!(classify_error("invalid ticker"), ErrorKind::Validation);
        assert_eq!(classify_error("something odd"), ErrorKind::Unknown);
        // a timeout mentioning a connection is still a timeout
        assert_eq!(classify_error("connection timeout"), ErrorKind::Timeout);
        // 5xx needs a standalone code
        assert_eq!(classify_error("processed 5000 rows then invalid"), ErrorKind::Validation);
    }

    #[test]
    fn error_kind_serializes_with_wire_names() {
        let json = serde_json::to_string(&ErrorKind::Http5xx).unwrap();
        assert_eq!(json, "\"HTTP_5XX\"");
        let kind: ErrorKind = serde_json::from_str("\"PARSING_SELECTOR\"").unwrap();
        assert_eq!(kind, ErrorKind::ParsingSelector);
    }

    #[test]
    fn append_classifies_only_when_kind_missing() {
        let log = ExecutionLog::default();
        let stored = log.append(ExecutionRecord::failure(
            "b3",
            Duration::from_millis(300),
            "429 Too Many Requests",
        ));
        assert_eq!(stored.error_kind, Some(ErrorKind::Http429));

        let explicit = log.append(
            ExecutionRecord::failure("b3", Duration::from_millis(300), "429 again")
                .with_error_kind(ErrorKind::Validation),
        );
        assert_eq!(explicit.error_kind, Some(ErrorKind::Validation));

        let ok = log.append(ExecutionRecord::success("b3", Duration::from_millis(120)));
        assert_eq!(ok.error_kind, None);
    }

    #[test]
    fn log_keeps_most_recent_entries() {
        let log = ExecutionLog::new(1000);
        for i in 0..1200u64 {
            log.append(ExecutionRecord::success(
                format!("source-{i}"),
                Duration::from_millis(i),
            ));
        }
        let records = log.records();
        assert_eq!(records.len(), 1000);
        assert_eq!(records[0].source_name, "source-200");
        assert_eq!(records[999].source_name, "source-1199");
    }

    #[test]
    fn failures_filter_by_source() {
        let log = ExecutionLog::default();
        log.append(ExecutionRecord::failure("b3", Duration::ZERO, "timeout"));
        log.append(ExecutionRecord::failure("cvm", Duration::ZERO, "timeout"));
        log.append(ExecutionRecord::success("b3", Duration::ZERO));
        assert_eq!(log.failures(None).len(), 2);
        let b3 = log.failures(Some("b3"));
        assert_eq!(b3.len(), 1);
        assert_eq!(b3[0].source_name, "b3");
    }

    #[test]
    fn source_stats_aggregate_runs() {
        let log = ExecutionLog::default();
        log.append(ExecutionRecord::success("anbima", Duration::from_millis(100)));
        log.append(ExecutionRecord::success("anbima", Duration::from_millis(300)));
        log.append(ExecutionRecord::failure("anbima", Duration::from_millis(200), "empty page"));
        log.append(ExecutionRecord::success("b3", Duration::from_millis(50)));
        let stats = log.source_stats();
        let anbima = &stats["anbima"];
        assert_eq!(anbima.runs, 3);
        assert_eq!(anbima.failures, 1);
        assert!((anbima.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(anbima.mean_duration, Duration::from_millis(200));
        assert!(anbima.last_run.is_some());
        assert_eq!(stats["b3"].success_rate, 1.0);
    }

    #[test]
    fn journal_reloads_tail_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("executions.jsonl");
        {
            let log = ExecutionLog::open(&path, 10).unwrap();
            for i in 0..15u64 {
                log.append(ExecutionRecord::failure(
                    format!("source-{i}"),
                    Duration::from_millis(10 * i),
                    "503 service unavailable",
                ));
            }
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 15);

        let reopened = ExecutionLog::open(&path, 10).unwrap();
        let records = reopened.records();
        assert_eq!(records.len(), 10);
        assert_eq!(records[0].source_name, "source-5");
        assert_eq!(records[0].duration, Duration::from_millis(50));
        assert_eq!(records[0].error_kind, Some(ErrorKind::Http5xx));
    }

    #[test]
    fn malformed_journal_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("executions.jsonl");
        let good = serde_json::to_string(&ExecutionRecord::success("b3", Duration::from_millis(5)))
            .unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n\n{good}\n")).unwrap();
        let log = ExecutionLog::open(&path, 10).unwrap();
        assert_eq!(log.len(), 2);
    }
}
