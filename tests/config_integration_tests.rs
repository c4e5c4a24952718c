//! Integration tests for ConfigManager
//!
//! Covers the layered policy load (file, then environment overrides), policy
//! validation, and run journal persistence feeding crash detection.

use camino::Utf8PathBuf;
use chrono::{Duration as ChronoDuration, Utc};
use std::fs;
use std::time::Duration;
use stridelink::ConfigManager;
use stridelink::models::{
    CorePolicy, PersistedRunRecord, PersistedStatus, RunJournal, RunMode, SensorId,
};
use stridelink::services::detect_crashed_run;
use tempfile::TempDir;
use uuid::Uuid;

/// Helper to create a temporary config directory
fn create_test_config_dir() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (temp_dir, config_path)
}

/// Manager isolated from the process environment
fn isolated_manager(config_path: &Utf8PathBuf) -> ConfigManager {
    ConfigManager::new(config_path)
        .unwrap()
        .with_env_source(Vec::<(String, String)>::new())
}

#[test]
fn test_config_manager_creation() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    assert_eq!(manager.config_dir(), config_path.as_path());
    assert_eq!(
        manager.policy_path(),
        config_path.join("StrideLink Policy.yaml").as_path()
    );
    assert_eq!(
        manager.journal_path(),
        config_path.join("Run Journal.yaml").as_path()
    );
}

#[test]
fn test_config_directory_creation() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf())
        .unwrap()
        .join("nonexistent_dir");

    assert!(!config_path.exists());
    let _manager = ConfigManager::new(&config_path).unwrap();
    assert!(config_path.exists());
}

#[test]
fn test_missing_policy_uses_defaults() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = isolated_manager(&config_path);

    let policy = manager.load_policy().unwrap();
    assert_eq!(policy, CorePolicy::default());
}

#[test]
fn test_partial_policy_file() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = isolated_manager(&config_path);

    fs::write(
        manager.policy_path(),
        "connect_timeout_secs: 3\n\
         simulation:\n  \
           walk:\n    \
             speed_mps: 1.5\n    \
             cadence_spm: 120.0\n",
    )
    .unwrap();

    let policy = manager.load_policy().unwrap();
    assert_eq!(policy.connect_timeout(), Duration::from_secs(3));
    assert_eq!(policy.retrieval_timeout(), Duration::from_secs(30));
    assert_eq!(policy.simulation.for_mode(RunMode::Walk).speed_mps, 1.5);
    // Untouched profiles keep their defaults
    assert_eq!(policy.simulation.for_mode(RunMode::Run).speed_mps, 2.5);
}

#[test]
fn test_environment_overrides_file() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path)
        .unwrap()
        .with_env_source([("STRIDELINK__RETRIEVAL_TIMEOUT_SECS", "12")]);

    fs::write(
        manager.policy_path(),
        "retrieval_timeout_secs: 45\nretention_window_hours: 48\n",
    )
    .unwrap();

    let policy = manager.load_policy().unwrap();
    assert_eq!(policy.retrieval_timeout(), Duration::from_secs(12));
    assert_eq!(policy.retention_window_hours, 48);
}

#[test]
fn test_custom_env_prefix() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path)
        .unwrap()
        .with_env_prefix("STRIDETEST")
        .with_env_source([
            ("STRIDETEST__MAX_SCORE_STEP", "8"),
            // Wrong prefix, ignored
            ("STRIDELINK__MAX_SCORE_STEP", "2"),
        ]);

    let policy = manager.load_policy().unwrap();
    assert_eq!(policy.max_score_step, 8);
}

#[test]
fn test_save_then_load_policy() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = isolated_manager(&config_path);

    let policy = CorePolicy {
        connect_timeout_secs: 7,
        sensor_name_pattern: "^StrideLink".to_string(),
        ..CorePolicy::default()
    };
    manager.save_policy(&policy).unwrap();

    assert!(manager.policy_path().exists());
    assert_eq!(manager.load_policy().unwrap(), policy);
}

#[test]
fn test_invalid_name_pattern_rejected() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = isolated_manager(&config_path);

    fs::write(manager.policy_path(), "sensor_name_pattern: \"[unclosed\"\n").unwrap();

    let result = manager.load_policy();
    assert!(result.is_err(), "Should reject an invalid regex");
}

#[test]
fn test_invalid_yaml_handling() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = isolated_manager(&config_path);

    fs::write(manager.policy_path(), "invalid: yaml: content: {{").unwrap();

    let result = manager.load_policy();
    assert!(result.is_err(), "Should fail to parse invalid YAML");
}

#[test]
fn test_missing_journal_is_empty() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    let journal = manager.load_run_journal().unwrap();
    assert!(journal.runs.is_empty());
    assert_eq!(detect_crashed_run(&journal.runs), None);
}

#[test]
fn test_journal_roundtrip_feeds_crash_detection() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    let started_at = Utc::now() - ChronoDuration::minutes(20);
    let journal = RunJournal {
        runs: vec![
            PersistedRunRecord {
                id: Uuid::new_v4(),
                started_at: started_at - ChronoDuration::days(1),
                status: PersistedStatus::Completed,
                last_checkpoint_at: None,
                distance_km: Some(5.0),
                duration_secs: Some(1800),
                sensor_id: None,
            },
            PersistedRunRecord {
                id: Uuid::new_v4(),
                started_at,
                status: PersistedStatus::InProgress,
                last_checkpoint_at: Some(started_at + ChronoDuration::minutes(9)),
                distance_km: Some(1.8),
                duration_secs: None,
                sensor_id: Some(SensorId::new("SL-0001")),
            },
        ],
    };

    manager.save_run_journal(&journal).unwrap();
    let loaded = manager.load_run_journal().unwrap();
    assert_eq!(loaded, journal);

    let crashed = detect_crashed_run(&loaded.runs).unwrap();
    assert_eq!(crashed.started_at, started_at);
    assert_eq!(crashed.estimated_distance_km, Some(1.8));
    assert_eq!(crashed.estimated_duration, Some(Duration::from_secs(9 * 60)));
    assert_eq!(crashed.sensor_id, Some(SensorId::new("SL-0001")));
}

#[test]
fn test_hand_written_journal() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    fs::write(
        manager.journal_path(),
        "runs:\n\
         - id: 3f1c2b7e-8a4d-4f6e-9b2a-1c0d5e6f7a8b\n  \
           started_at: 2026-10-18T07:30:00Z\n  \
           status: in_progress\n  \
           duration_secs: 840\n",
    )
    .unwrap();

    let journal = manager.load_run_journal().unwrap();
    assert_eq!(journal.runs.len(), 1);
    assert_eq!(journal.runs[0].status, PersistedStatus::InProgress);

    let crashed = detect_crashed_run(&journal.runs).unwrap();
    assert_eq!(crashed.estimated_duration, Some(Duration::from_secs(840)));
    assert_eq!(crashed.estimated_distance_km, None);
    assert_eq!(crashed.sensor_id, None);
}

#[test]
fn test_concurrent_policy_access() {
    use std::sync::Arc;

    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = Arc::new(isolated_manager(&config_path));
    manager.save_policy(&CorePolicy::default()).unwrap();

    let mut handles = vec![];
    for _ in 0..10 {
        let manager_clone = Arc::clone(&manager);
        handles.push(std::thread::spawn(move || {
            manager_clone.load_policy().unwrap()
        }));
    }

    for handle in handles {
        assert_eq!(handle.join().unwrap(), CorePolicy::default());
    }
}
