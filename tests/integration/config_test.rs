use bedside::core::alarm::{AlarmPriority, AlarmThreshold, ThresholdSet};
use bedside::core::cache::VitalType;
use bedside::MonitorConfig;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_config_default_uses_simulator() {
    let config = MonitorConfig::default();
    assert!(config.transport.socket_path.is_none());
    assert_eq!(config.telemetry.batch_max_samples, 100);
    assert_eq!(config.persistence.interval_secs, 300);
}

#[test]
fn test_config_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("config.json");

    let mut config = MonitorConfig::default();
    config.transport.socket_path = Some(PathBuf::from("/run/bedside/ring.sock"));
    config.alarm.thresholds = ThresholdSet::new(vec![AlarmThreshold::new(
        VitalType::HeartRate,
        40.0,
        140.0,
        0.05,
        AlarmPriority::High,
    )]);
    config.scheduler.realtime_cpus = vec![2, 3];
    config.save_to(&path).unwrap();

    let loaded = MonitorConfig::load_from(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_config_load_nonexistent_returns_default() {
    let temp_dir = TempDir::new().unwrap();
    let loaded = MonitorConfig::load_from(&temp_dir.path().join("missing.json")).unwrap();
    assert_eq!(loaded, MonitorConfig::default());
}

#[test]
fn test_corrupt_config_falls_back_to_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");
    std::fs::write(&path, b"{ not json").unwrap();
    assert_eq!(MonitorConfig::load_from(&path).unwrap(), MonitorConfig::default());

    std::fs::write(&path, b"").unwrap();
    assert_eq!(MonitorConfig::load_from(&path).unwrap(), MonitorConfig::default());
}

#[test]
fn test_invalid_settings_rejected() {
    let mut config = MonitorConfig::default();
    config.transport.slot_count = 1;
    assert!(config.validate().is_err());

    let mut config = MonitorConfig::default();
    config.alarm.critical_level = 5;
    assert!(config.validate().is_err());

    let mut config = MonitorConfig::default();
    config.telemetry.batch_max_samples = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_reset_restores_defaults() {
    let mut config = MonitorConfig::default();
    config.cache.retention_hours = 1;
    config.events.render_tick_ms = 100;
    config.reset_to_defaults();
    assert_eq!(config, MonitorConfig::default());
}

#[test]
fn test_archive_path_override() {
    let mut config = MonitorConfig::default();
    config.persistence.archive_path = Some(PathBuf::from("/var/lib/bedside/a.jsonl"));
    assert_eq!(config.archive_path().unwrap(), PathBuf::from("/var/lib/bedside/a.jsonl"));
}
