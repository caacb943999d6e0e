//! ---
//! rah_section: "01-core-functionality"
//! rah_subsection: "module"
//! rah_type: "source"
//! rah_scope: "code"
//! rah_description: "Shared primitives and utilities for the core runtime."
//! rah_version: "v0.0.0-prealpha"
//! rah_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use rah_common::config::AppConfig;

#[test]
fn loads_first_existing_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("rah.toml");
    fs::write(
        &present,
        r#"
        [resilience.breaker]
        failure_threshold = 7
        reset_timeout_ms = 250
        "#,
    )
    .unwrap();

    let loaded = AppConfig::load_with_source(&[missing, present.clone()]).unwrap();
    assert_eq!(loaded.source, present);
    assert_eq!(loaded.config.resilience.breaker.failure_threshold, 7);
    assert_eq!(
        loaded.config.resilience.breaker.reset_timeout,
        Duration::from_millis(250)
    );
}

#[test]
fn reports_inspected_candidates_when_none_exist() {
    let dir = tempfile::tempdir().unwrap();
    let candidate = dir.path().join("nope.toml");
    let err = AppConfig::load(&[candidate]).unwrap_err();
    assert!(err.to_string().contains("nope.toml"));
}

#[test]
fn invalid_file_surfaces_path_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[resilience.history]\nmax_entries = 0\n").unwrap();
    let err = AppConfig::load(&[path]).unwrap_err();
    let rendered = format!("{err:#}");
    assert!(rendered.contains("broken.toml"));
    assert!(rendered.contains("max_entries"));
}
