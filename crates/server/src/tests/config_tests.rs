use std::collections::HashMap;

use super::*;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_fail_fast_with_bounded_scans() {
    let settings = Settings::default();
    assert_eq!(settings.scan_failure_policy, ScanFailurePolicy::FailFast);
    assert_eq!(settings.max_scan_points, 10_000);
    assert_eq!(settings.service_config(), ServiceConfig::default());
}

#[test]
fn file_values_override_defaults() {
    let mut settings = Settings::default();
    apply_file(
        &mut settings,
        r#"
bind_addr = "0.0.0.0:9000"
store_root = "/srv/calculations"
scan_failure_policy = "isolate"
max_scan_points = 500
"#,
    )
    .expect("parse");

    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.store_root, PathBuf::from("/srv/calculations"));
    assert_eq!(settings.scan_failure_policy, ScanFailurePolicy::Isolate);
    assert_eq!(settings.max_scan_points, 500);
    assert_eq!(settings.max_body_bytes, Settings::default().max_body_bytes);
}

#[test]
fn unknown_file_keys_are_rejected() {
    let mut settings = Settings::default();
    assert!(apply_file(&mut settings, "database_url = \"sqlite::memory:\"").is_err());
    assert_eq!(settings, Settings::default());
}

#[test]
fn env_overrides_file_and_prefers_app_prefix() {
    let mut settings = Settings::default();
    apply_file(&mut settings, "bind_addr = \"127.0.0.1:1\"").expect("parse");
    apply_env(
        &mut settings,
        env_of(&[
            ("SERVER_BIND", "127.0.0.1:2"),
            ("APP__BIND_ADDR", "127.0.0.1:3"),
            ("APP__STORE_ROOT", "/tmp/calc"),
            ("APP__SCAN_FAILURE_POLICY", "isolate"),
            ("APP__MAX_BODY_BYTES", "1024"),
        ]),
    );

    assert_eq!(settings.server_bind, "127.0.0.1:3");
    assert_eq!(settings.store_root, PathBuf::from("/tmp/calc"));
    assert_eq!(settings.scan_failure_policy, ScanFailurePolicy::Isolate);
    assert_eq!(settings.max_body_bytes, 1024);
}

#[test]
fn malformed_env_values_keep_previous_setting() {
    let mut settings = Settings::default();
    apply_env(
        &mut settings,
        env_of(&[
            ("APP__MAX_SCAN_POINTS", "lots"),
            ("APP__SCAN_FAILURE_POLICY", "retry"),
        ]),
    );
    assert_eq!(settings, Settings::default());
}

#[test]
fn store_root_is_created() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings {
        store_root: dir.path().join("nested").join("calculations"),
        ..Settings::default()
    };
    let root = prepare_store_root(&settings).expect("prepare");
    assert!(root.is_dir());
}
