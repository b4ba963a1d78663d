//! Integration tests for configuration loading and CLI precedence.

use std::fs;

use kpod_metrics::cli::Args;
use kpod_metrics::config::{resolve_config, validate_effective_config};

const CUSTOM_YAML: &str = r#"
profile: custom
node_name: worker-7
poll_interval_ms: 5000
cpu:
  scheduling: true
  throttling: false
network:
  tcp: false
memory:
  oom: false
  page_faults: false
syscall:
  enabled: true
  tracked_syscalls: [read, write, futex]
extended:
  biolatency: true
collectors:
  biolatency: false
collector_intervals:
  syscall: 60000
"#;

#[test]
fn test_custom_profile_keeps_file_sections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kpod-metrics.yaml");
    fs::write(&path, CUSTOM_YAML).unwrap();

    let args = Args {
        config: Some(path),
        port: Some(9300),
        ..Args::default()
    };
    let config = resolve_config(&args).unwrap();
    validate_effective_config(&config).unwrap();

    assert_eq!(config.port, Some(9300));
    assert_eq!(config.node_name(), "worker-7");
    assert_eq!(
        config.enabled_programs(),
        vec!["cpu_sched", "syscall", "biolatency"]
    );
    assert!(!config.collector_enabled("biolatency"));
    assert_eq!(
        config.collector_interval("syscall").map(|d| d.as_secs()),
        Some(60)
    );
    assert_eq!(config.poll_interval().as_millis(), 5000);
}

#[test]
fn test_cli_profile_overrides_file_sections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kpod-metrics.yaml");
    fs::write(&path, CUSTOM_YAML).unwrap();

    let args = Args {
        config: Some(path),
        profile: Some("minimal".into()),
        ..Args::default()
    };
    let config = resolve_config(&args).unwrap();

    // minimal rewrites the core sections; extended probes are untouched.
    assert_eq!(config.enabled_programs(), vec!["cpu_sched", "mem", "biolatency"]);
}

#[test]
fn test_json_config_with_unknown_syscall_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    fs::write(
        &path,
        r#"{"profile": "custom", "syscall": {"enabled": true, "tracked_syscalls": ["read", "teleport"]}}"#,
    )
    .unwrap();

    let args = Args {
        config: Some(path),
        ..Args::default()
    };
    let config = resolve_config(&args).unwrap();
    let err = validate_effective_config(&config).unwrap_err();
    assert!(err.to_string().contains("teleport"), "{err}");
}

#[test]
fn test_unknown_profile_is_rejected() {
    let args = Args {
        no_config: true,
        profile: Some("everything".into()),
        ..Args::default()
    };
    assert!(resolve_config(&args).is_err());
}
