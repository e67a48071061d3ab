use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use scrapewatch_core::{
    anomaly, load_engine_config, AlertEvent, AlertKind, AnomalyResult, DashboardAlertRecord,
    DashboardStats, DetectionMethod, DispatchResult, EngineConfig, EngineError, FailurePattern,
    ObservabilityEngine, SourceStats, StatusLevel, SystemStatus,
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] scrapewatch_core::ConfigError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("alert not found: {0}")]
    UnknownAlert(String),
    #[error("system unhealthy: {0}")]
    Unhealthy(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Scraper fleet observability and alerting", long_about = None)]
pub struct Cli {
    /// Path to the engine TOML config; built-in defaults when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Summary of health, sources and dashboard
    Status,
    /// Runs the configured health probes
    Health(HealthArgs),
    /// Analyzes failure patterns in the execution log
    Patterns(PatternArgs),
    /// Runs anomaly detection over a list of values
    Anomaly(AnomalyArgs),
    /// Dashboard alert operations
    #[command(subcommand)]
    Alerts(AlertCommands),
}

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Run a single probe by name
    #[arg(long)]
    pub probe: Option<String>,
    /// Dispatch an alert when the system is degraded or critical
    #[arg(long, default_value_t = false)]
    pub alert: bool,
}

#[derive(Args, Debug)]
pub struct PatternArgs {
    /// Restrict analysis to one source
    #[arg(long)]
    pub source: Option<String>,
    /// Minimum group size for recurring errors
    #[arg(long)]
    pub min_frequency: Option<usize>,
    /// Execution log (JSON lines) to analyze instead of the configured one
    #[arg(long)]
    pub log: Option<PathBuf>,
    /// Dispatch one alert per pattern at or above this confidence
    #[arg(long)]
    pub alert_confidence: Option<f64>,
}

#[derive(Args, Debug)]
pub struct AnomalyArgs {
    /// Historical values, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub values: Vec<f64>,
    /// Value to test against the history
    #[arg(long, allow_hyphen_values = true)]
    pub current: f64,
    /// statistical or iqr
    #[arg(long, default_value = "statistical")]
    pub method: String,
    #[arg(long, default_value = "value")]
    pub metric: String,
}

#[derive(Subcommand, Debug)]
pub enum AlertCommands {
    /// Lists the most recent dashboard alerts
    List(AlertListArgs),
    /// Acknowledges an alert by id
    Ack(AlertAckArgs),
    /// Dispatches an alert to every configured channel
    Send(AlertSendArgs),
}

#[derive(Args, Debug)]
pub struct AlertListArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct AlertAckArgs {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct AlertSendArgs {
    #[arg(long, default_value = "custom")]
    pub kind: String,
    #[arg(long)]
    pub source: String,
    #[arg(long)]
    pub message: String,
    #[arg(long)]
    pub metric: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    pub value: Option<f64>,
}

pub fn run(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(cli))
}

async fn execute(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Status => {
            let engine = build_engine(&cli, None)?;
            engine.run_all_checks().await;
            let report = StatusReport {
                health: engine.get_status(),
                dashboard: engine.dashboard_stats(),
                channels: engine.channel_names(),
                sources: engine.source_stats(),
            };
            render(&report, cli.format)?;
        }
        Commands::Health(args) => {
            let engine = build_engine(&cli, None)?;
            match &args.probe {
                Some(name) => {
                    engine.run_check(name).await?;
                }
                None => {
                    engine.run_all_checks().await;
                }
            }
            let status = engine.get_status();
            let delivery = match (args.alert, status.to_alert_event()) {
                (true, Some(event)) => Some(engine.dispatch_alert(event).await),
                _ => None,
            };
            let report = HealthReport {
                status: status.clone(),
                delivery,
            };
            render(&report, cli.format)?;
            if status.status == StatusLevel::Critical {
                return Err(AppError::Unhealthy(status.message));
            }
        }
        Commands::Patterns(args) => {
            let engine = build_engine(&cli, args.log.clone())?;
            let source = args.source.as_deref();
            let report = match args.alert_confidence {
                Some(min_confidence) => {
                    let reported = engine
                        .report_patterns(source, args.min_frequency, min_confidence)
                        .await;
                    PatternReport {
                        patterns: reported.iter().map(|(pattern, _)| pattern.clone()).collect(),
                        deliveries: reported.into_iter().map(|(_, delivery)| delivery).collect(),
                    }
                }
                None => PatternReport {
                    patterns: engine.analyze_patterns(source, args.min_frequency),
                    deliveries: Vec::new(),
                },
            };
            render(&report, cli.format)?;
        }
        Commands::Anomaly(args) => {
            let config = load_config(&cli)?;
            let method: DetectionMethod = args
                .method
                .parse()
                .map_err(AppError::InvalidArgument)?;
            let report = AnomalyReport {
                history_len: args.values.len(),
                min_history: config.monitoring.min_history,
                result: anomaly::evaluate(
                    &args.metric,
                    &args.values,
                    args.current,
                    method,
                    config.monitoring.min_history,
                ),
            };
            render(&report, cli.format)?;
        }
        Commands::Alerts(AlertCommands::List(args)) => {
            let engine = build_engine(&cli, None)?;
            let list = AlertList {
                rows: engine.get_recent_alerts(args.limit),
                stats: engine.dashboard_stats(),
            };
            render(&list, cli.format)?;
        }
        Commands::Alerts(AlertCommands::Ack(args)) => {
            let engine = build_engine(&cli, None)?;
            if !engine.acknowledge_alert(&args.id) {
                return Err(AppError::UnknownAlert(args.id.clone()));
            }
            let result = AckResult {
                id: args.id.clone(),
                acknowledged: true,
            };
            render(&result, cli.format)?;
        }
        Commands::Alerts(AlertCommands::Send(args)) => {
            let engine = build_engine(&cli, None)?;
            let event = build_event(args)?;
            let results = engine.dispatch_alert(event).await;
            render(&DispatchReport { results }, cli.format)?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    match &cli.config {
        Some(path) => Ok(load_engine_config(path)?),
        None => Ok(EngineConfig::default()),
    }
}

fn build_engine(cli: &Cli, log_override: Option<PathBuf>) -> Result<ObservabilityEngine> {
    let mut config = load_config(cli)?;
    if let Some(path) = log_override {
        if !path.exists() {
            return Err(AppError::InvalidArgument(format!(
                "execution log {} not found",
                path.display()
            )));
        }
        config.monitoring.execution_log_path = Some(path);
    }
    Ok(ObservabilityEngine::from_config(config)?)
}

fn build_event(args: &AlertSendArgs) -> Result<AlertEvent> {
    let kind: AlertKind = args.kind.parse().map_err(AppError::InvalidArgument)?;
    let mut event = AlertEvent::new(kind, args.source.clone(), args.message.clone());
    if let Some(metric) = &args.metric {
        event = event.with_metric(metric.clone());
    }
    if let Some(value) = args.value {
        event = event.with_current_value(value);
    }
    Ok(event)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub health: SystemStatus,
    pub dashboard: DashboardStats,
    pub channels: Vec<String>,
    pub sources: BTreeMap<String, SourceStats>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: SystemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DispatchResult>,
}

#[derive(Debug, Serialize)]
pub struct PatternReport {
    pub patterns: Vec<FailurePattern>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deliveries: Vec<DispatchResult>,
}

#[derive(Debug, Serialize)]
pub struct AnomalyReport {
    pub history_len: usize,
    pub min_history: usize,
    pub result: Option<AnomalyResult>,
}

#[derive(Debug, Serialize)]
pub struct AlertList {
    pub rows: Vec<DashboardAlertRecord>,
    pub stats: DashboardStats,
}

#[derive(Debug, Serialize)]
pub struct AckResult {
    pub id: String,
    pub acknowledged: bool,
}

#[derive(Debug, Serialize)]
pub struct DispatchReport {
    pub results: DispatchResult,
}

impl DisplayFallback for SystemStatus {
    fn display(&self) -> String {
        let mut lines = vec![format!("Status: {} ({})", self.status, self.message)];
        for result in self.components.values() {
            let marker = if result.healthy { "OK" } else { "FAIL" };
            let scope = if result.critical { "critical" } else { "optional" };
            let mut line = format!(
                "  [{marker}] {} ({scope}, {} ms)",
                result.name,
                result.latency.as_millis()
            );
            if let Some(error) = &result.error {
                line.push_str(&format!(": {error}"));
            }
            lines.push(line);
        }
        if let Some(last) = self.summary.last_check {
            lines.push(format!(
                "{}/{} healthy, last check {}",
                self.summary.healthy,
                self.summary.total,
                last.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![self.health.display()];
        lines.push(format!("Channels: {}", self.channels.join(", ")));
        lines.push(format!(
            "Dashboard: {} alerts ({} unacknowledged)",
            self.dashboard.total, self.dashboard.unacknowledged
        ));
        if !self.sources.is_empty() {
            lines.push("Sources:".to_string());
            for (source, stats) in &self.sources {
                lines.push(format!(
                    "  - {source}: {} runs, {} failures, {:.1}% success, avg {} ms",
                    stats.runs,
                    stats.failures,
                    stats.success_rate * 100.0,
                    stats.mean_duration.as_millis()
                ));
            }
        }
        lines.join("\n")
    }
}

impl DisplayFallback for HealthReport {
    fn display(&self) -> String {
        let mut text = self.status.display();
        if let Some(delivery) = &self.delivery {
            text.push('\n');
            text.push_str(&delivery_line(delivery));
        }
        text
    }
}

impl DisplayFallback for PatternReport {
    fn display(&self) -> String {
        if self.patterns.is_empty() {
            return "No failure patterns found".to_string();
        }
        let mut lines = Vec::new();
        for pattern in &self.patterns {
            lines.push(format!(
                "{} | {} | {} x{} | confidence={:.2}",
                pattern.pattern_kind,
                pattern.source_name,
                pattern.error_kind,
                pattern.frequency,
                pattern.confidence
            ));
            if !pattern.error_message.is_empty() {
                lines.push(format!("    {}", pattern.error_message));
            }
            lines.push(format!("    remedy: {}", pattern.suggested_remedy));
        }
        for delivery in &self.deliveries {
            lines.push(delivery_line(delivery));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for AnomalyReport {
    fn display(&self) -> String {
        match &self.result {
            None => format!(
                "Insufficient history: {} values, {} required",
                self.history_len, self.min_history
            ),
            Some(result) => format!(
                "{}: {} {} (expected {:.4}..{:.4}, method={}, confidence={:.2})",
                result.metric_name,
                result.current_value,
                if result.is_anomaly { "is ANOMALOUS" } else { "is normal" },
                result.expected_range.0,
                result.expected_range.1,
                result.method,
                result.confidence
            ),
        }
    }
}

impl DisplayFallback for AlertList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No alerts recorded".to_string();
        }
        let mut lines = Vec::new();
        for record in &self.rows {
            lines.push(format!(
                "{} | {} | {} | {} | {}",
                record.id,
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.payload.alert_kind,
                if record.acknowledged { "ack" } else { "open" },
                record.payload.message
            ));
        }
        lines.push(format!(
            "{} total, {} unacknowledged",
            self.stats.total, self.stats.unacknowledged
        ));
        lines.join("\n")
    }
}

impl DisplayFallback for AckResult {
    fn display(&self) -> String {
        format!("Alert {} acknowledged", self.id)
    }
}

impl DisplayFallback for DispatchReport {
    fn display(&self) -> String {
        delivery_line(&self.results)
    }
}

fn delivery_line(results: &DispatchResult) -> String {
    let parts: Vec<String> = results
        .iter()
        .map(|(channel, delivered)| {
            format!("{channel}={}", if *delivered { "ok" } else { "failed" })
        })
        .collect();
    format!("Delivery: {}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrapewatch_core::patterns::suggested_remedy;
    use scrapewatch_core::{ErrorKind, ExecutionLog, ExecutionRecord, FailurePatternAnalyzer};
    use std::time::Duration;
    use tempfile::TempDir;

    fn cli(config: Option<PathBuf>, command: Commands) -> Cli {
        Cli {
            config,
            format: OutputFormat::Json,
            command,
        }
    }

    fn write_config(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("scrapewatch.toml");
        let content = format!(
            "[monitoring]\nexecution_log_path = \"{log}\"\n\n[alerting]\ndashboard_snapshot_path = \"{dashboard}\"\n",
            log = dir.path().join("executions.jsonl").display(),
            dashboard = dir.path().join("dashboard.json").display(),
        );
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn send_then_list_and_ack_through_snapshot() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir);

        run(cli(
            Some(config.clone()),
            Commands::Alerts(AlertCommands::Send(AlertSendArgs {
                kind: "threshold_breach".into(),
                source: "b3".into(),
                message: "volume spike".into(),
                metric: Some("volume".into()),
                value: Some(1.5e9),
            })),
        ))
        .unwrap();

        let engine = build_engine(&cli(Some(config.clone()), Commands::Status), None).unwrap();
        let recent = engine.get_recent_alerts(5);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].payload.alert_kind, AlertKind::ThresholdBreach);
        let id = recent[0].id.clone();

        run(cli(
            Some(config.clone()),
            Commands::Alerts(AlertCommands::Ack(AlertAckArgs { id: id.clone() })),
        ))
        .unwrap();
        let err = run(cli(
            Some(config),
            Commands::Alerts(AlertCommands::Ack(AlertAckArgs {
                id: "missing_0".into(),
            })),
        ))
        .unwrap_err();
        assert!(matches!(err, AppError::UnknownAlert(_)));
    }

    #[test]
    fn anomaly_rejects_unknown_method() {
        let err = run(cli(
            None,
            Commands::Anomaly(AnomalyArgs {
                values: vec![1.0; 12],
                current: 1.0,
                method: "median".into(),
                metric: "value".into(),
            }),
        ))
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn send_rejects_unknown_kind() {
        let args = AlertSendArgs {
            kind: "meteor".into(),
            source: "b3".into(),
            message: "x".into(),
            metric: None,
            value: None,
        };
        assert!(build_event(&args).is_err());
    }

    #[test]
    fn health_fails_on_critical_probe() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scrapewatch.toml");
        std::fs::write(
            &path,
            format!(
                "[[health.probes]]\nname = \"spool\"\nkind = \"path\"\ntarget = \"{}\"\n",
                dir.path().join("absent").display()
            ),
        )
        .unwrap();
        let err = run(cli(
            Some(path),
            Commands::Health(HealthArgs {
                probe: None,
                alert: true,
            }),
        ))
        .unwrap_err();
        assert!(matches!(err, AppError::Unhealthy(message) if message.contains("spool")));
    }

    #[test]
    fn patterns_requires_existing_log_override() {
        let dir = TempDir::new().unwrap();
        let err = run(cli(
            None,
            Commands::Patterns(PatternArgs {
                source: None,
                min_frequency: None,
                log: Some(dir.path().join("missing.jsonl")),
                alert_confidence: None,
            }),
        ))
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn pattern_report_text_lists_remedy() {
        let empty = PatternReport {
            patterns: Vec::new(),
            deliveries: Vec::new(),
        };
        assert_eq!(empty.display(), "No failure patterns found");

        let log = ExecutionLog::new(10);
        for _ in 0..3 {
            log.append(ExecutionRecord::failure(
                "b3",
                Duration::from_millis(200),
                "HTTP 429 Too Many Requests",
            ));
        }
        let patterns = FailurePatternAnalyzer::default().analyze(&log.records(), None, 2);
        let report = PatternReport {
            patterns,
            deliveries: Vec::new(),
        };
        let text = report.display();
        assert!(text.contains("recurring_error | b3 | HTTP_429 x3"));
        assert!(text.contains("    HTTP 429 Too Many Requests"));
        assert!(text.contains(&format!(
            "    remedy: {}",
            suggested_remedy(ErrorKind::Http429)
        )));

        let mut results = DispatchResult::new();
        results.insert("dashboard".to_string(), true);
        results.insert("slack".to_string(), false);
        assert_eq!(delivery_line(&results), "Delivery: dashboard=ok, slack=failed");
    }
}
