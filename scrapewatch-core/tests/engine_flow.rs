use std::sync::Arc;
use std::time::Duration;

use scrapewatch_core::{
    load_engine_config, AlertEvent, AlertKind, DetectionMethod, ErrorKind, ExecutionRecord,
    FnProbe, HealthCheckSpec, MetricSample, ObservabilityEngine, PatternKind, StatusLevel,
};
use tempfile::TempDir;

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let spool = dir.path().join("spool");
    std::fs::create_dir_all(&spool).unwrap();
    let config = format!(
        r#"
[monitoring]
execution_log_path = "{log}"

[[monitoring.thresholds]]
metric_name = "close_price"
max_change_percent = 20.0

[health]
max_concurrency = 2

[[health.probes]]
name = "spool"
kind = "path"
target = "{spool}"

[[health.probes]]
name = "archive"
kind = "path"
target = "{archive}"
critical = false

[alerting]
dashboard_snapshot_path = "{dashboard}"
"#,
        log = dir.path().join("executions.jsonl").display(),
        spool = spool.display(),
        archive = dir.path().join("archive").display(),
        dashboard = dir.path().join("dashboard.json").display(),
    );
    let path = dir.path().join("scrapewatch.toml");
    std::fs::write(&path, config).unwrap();
    path
}

#[tokio::test]
async fn engine_covers_full_monitoring_cycle() {
    let dir = TempDir::new().unwrap();
    let config_path = write_config(&dir);
    let engine = ObservabilityEngine::from_config(load_engine_config(&config_path).unwrap())
        .unwrap();
    assert_eq!(engine.channel_names(), vec!["dashboard"]);

    // metrics
    for value in [10.0, 12.0, 11.0, 13.0, 10.0, 12.0, 11.0, 14.0, 10.0, 13.0] {
        engine.record_metric(&MetricSample::new("close_price", "yahoo", value));
    }
    let anomaly = engine
        .detect_anomaly("close_price", 50.0, DetectionMethod::Statistical)
        .unwrap();
    assert!(anomaly.is_anomaly);
    assert!(!engine
        .detect_anomaly("close_price", 12.0, DetectionMethod::Iqr)
        .unwrap()
        .is_anomaly);

    let alerts = engine.observe_sample(
        &MetricSample::new("close_price", "yahoo", 50.0).with_tag("ticker", "PETR4"),
        DetectionMethod::Iqr,
    );
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_kind, AlertKind::Anomaly);
    assert_eq!(alerts[0].context["ticker"], "PETR4");
    let results = engine.dispatch_alert(alerts[0].clone()).await;
    assert!(results["dashboard"]);

    // executions and patterns
    for _ in 0..3 {
        engine.log_execution(ExecutionRecord::failure(
            "b3",
            Duration::from_millis(800),
            "Connection refused",
        ));
    }
    engine.log_execution(ExecutionRecord::success("b3", Duration::from_millis(400)));
    let patterns = engine.analyze_patterns(Some("b3"), Some(2));
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].pattern_kind, PatternKind::RecurringError);
    assert_eq!(patterns[0].error_kind, ErrorKind::ConnectionError);
    assert_eq!(patterns[0].frequency, 3);
    assert!(engine.analyze_patterns(Some("cvm"), Some(2)).is_empty());
    assert_eq!(engine.source_stats()["b3"].runs, 4);

    let reported = engine.report_patterns(None, None, 0.2).await;
    assert_eq!(reported.len(), 1);

    // health
    let (status, delivery) = engine.report_health().await;
    assert_eq!(status.status, StatusLevel::Degraded);
    assert_eq!(status.failing_non_critical, vec!["archive".to_string()]);
    assert!(delivery.unwrap()["dashboard"]);

    engine.register_probe(HealthCheckSpec::new(
        "database",
        Arc::new(FnProbe::new(|| async { Ok(false) })),
    ));
    let results = engine.run_all_checks().await;
    assert_eq!(results.len(), 3);
    assert_eq!(engine.get_status().status, StatusLevel::Critical);
    assert!(engine.remove_probe("database"));
    assert_eq!(engine.get_status().status, StatusLevel::Degraded);

    // dashboard
    let recent = engine.get_recent_alerts(10);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].payload.alert_kind, AlertKind::HealthDegraded);
    assert!(engine.acknowledge_alert(&recent[0].id));
    assert!(!engine.acknowledge_alert("missing_1"));
    assert_eq!(engine.dashboard_stats().acknowledged, 1);
}

#[tokio::test]
async fn state_survives_engine_restart() {
    let dir = TempDir::new().unwrap();
    let config_path = write_config(&dir);

    let acknowledged_id = {
        let engine =
            ObservabilityEngine::from_config(load_engine_config(&config_path).unwrap()).unwrap();
        engine.log_execution(ExecutionRecord::failure(
            "anbima",
            Duration::from_millis(120),
            "XPath //table/tr returned nothing",
        ));
        engine.log_execution(ExecutionRecord::failure(
            "anbima",
            Duration::from_millis(130),
            "failed parsing rates table",
        ));
        engine
            .dispatch_alert(AlertEvent::new(AlertKind::Custom, "ops", "maintenance window"))
            .await;
        let id = engine.get_recent_alerts(1)[0].id.clone();
        assert!(engine.acknowledge_alert(&id));
        id
    };

    let engine =
        ObservabilityEngine::from_config(load_engine_config(&config_path).unwrap()).unwrap();
    assert_eq!(engine.executions().len(), 2);
    let patterns = engine.analyze_patterns(Some("anbima"), None);
    assert!(patterns
        .iter()
        .any(|pattern| pattern.pattern_kind == PatternKind::WebsiteStructureChange));

    let recent = engine.get_recent_alerts(5);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, acknowledged_id);
    assert!(recent[0].acknowledged);
}
