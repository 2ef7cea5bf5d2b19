use std::path::PathBuf;

use waypoint_core::config::EngineConfig;
use waypoint_core::error::WaypointError;
use waypoint_graph::GraphConfig;
use waypoint_test_utils::write_config;

#[test]
fn test_load_full_config_from_file() {
    let (_dir, path) = write_config(
        r#"
[executor]
max_steps = 50
default_model = "sonnet"
context_window_threshold = 70.0
auto_checkpoint = true

[retry]
max_attempts = 5
backoff_ms = 10
backoff_multiplier = 3.0
max_backoff_ms = 200
jitter = true

[checkpoint]
path = "/tmp/waypoint-test/checkpoints.db"

[log]
level = "waypoint=debug"
"#,
    );

    let config = EngineConfig::load(&path).expect("load config");

    assert_eq!(config.executor.max_steps, 50);
    assert_eq!(config.executor.default_model.as_deref(), Some("sonnet"));
    assert_eq!(config.executor.context_window_threshold, 70.0);
    assert!(config.executor.auto_checkpoint);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.max_backoff_ms, Some(200));
    assert!(config.retry.jitter);
    assert!(config.checkpoint.enabled);
    assert_eq!(
        config.checkpoint.resolved_path(),
        PathBuf::from("/tmp/waypoint-test/checkpoints.db")
    );
    assert_eq!(config.log.level, "waypoint=debug");
}

#[test]
fn test_engine_config_seeds_graph_config() {
    let (_dir, path) = write_config(
        r#"
[executor]
max_steps = 12
default_model = "inherit"
auto_checkpoint = true

[retry]
max_attempts = 2
backoff_ms = 5
"#,
    );
    let engine = EngineConfig::load(&path).unwrap();
    let graph = GraphConfig::from_engine(&engine);

    assert_eq!(graph.max_steps, 12);
    assert!(graph.auto_checkpoint);
    assert_eq!(graph.retry.max_attempts, 2);
    assert!(graph.default_model.is_some());
    assert!(graph.checkpointer.is_none());
}

#[test]
fn test_env_vars_expanded_in_file() {
    std::env::set_var("WAYPOINT_TEST_DB_PATH", "/tmp/from-env.db");
    let (_dir, path) = write_config(
        r#"
[checkpoint]
path = "${WAYPOINT_TEST_DB_PATH}"
"#,
    );
    let config = EngineConfig::load(&path).unwrap();
    std::env::remove_var("WAYPOINT_TEST_DB_PATH");

    assert_eq!(config.checkpoint.path, "/tmp/from-env.db");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, WaypointError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_rejected() {
    let (_dir, path) = write_config("[executor\nmax_steps = ");
    let err = EngineConfig::load(&path).unwrap_err();
    assert!(matches!(err, WaypointError::Config(_)));
}
