use std::{fs, path::PathBuf};

use anyhow::Context;
use serde::Deserialize;
use server_api::{ScanFailurePolicy, ServiceConfig, DEFAULT_MAX_SCAN_POINTS};
use tracing::warn;

const CONFIG_FILE: &str = "server.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_bind: String,
    pub store_root: PathBuf,
    pub max_scan_points: usize,
    pub scan_failure_policy: ScanFailurePolicy,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8000".into(),
            store_root: PathBuf::from("./data/calculations"),
            max_scan_points: DEFAULT_MAX_SCAN_POINTS,
            scan_failure_policy: ScanFailurePolicy::FailFast,
            max_body_bytes: 64 * 1024,
        }
    }
}

impl Settings {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            max_scan_points: self.max_scan_points,
            scan_failure_policy: self.scan_failure_policy,
        }
    }
}

/// Keys accepted in `server.toml`; anything absent keeps its default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    bind_addr: Option<String>,
    store_root: Option<PathBuf>,
    max_scan_points: Option<usize>,
    scan_failure_policy: Option<ScanFailurePolicy>,
    max_body_bytes: Option<usize>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(CONFIG_FILE) {
        if let Err(error) = apply_file(&mut settings, &raw) {
            warn!(file = CONFIG_FILE, %error, "ignoring unreadable config file");
        }
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());

    settings
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw).context("invalid server.toml")?;
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.store_root {
        settings.store_root = v;
    }
    if let Some(v) = file_cfg.max_scan_points {
        settings.max_scan_points = v;
    }
    if let Some(v) = file_cfg.scan_failure_policy {
        settings.scan_failure_policy = v;
    }
    if let Some(v) = file_cfg.max_body_bytes {
        settings.max_body_bytes = v;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = lookup("APP__STORE_ROOT") {
        settings.store_root = PathBuf::from(v);
    }

    if let Some(v) = lookup("APP__MAX_SCAN_POINTS") {
        match v.parse::<usize>() {
            Ok(parsed) => settings.max_scan_points = parsed,
            Err(error) => warn!(value = %v, %error, "ignoring APP__MAX_SCAN_POINTS"),
        }
    }

    if let Some(v) = lookup("APP__SCAN_FAILURE_POLICY") {
        match v.parse::<ScanFailurePolicy>() {
            Ok(parsed) => settings.scan_failure_policy = parsed,
            Err(error) => warn!(value = %v, %error, "ignoring APP__SCAN_FAILURE_POLICY"),
        }
    }

    if let Some(v) = lookup("APP__MAX_BODY_BYTES") {
        match v.parse::<usize>() {
            Ok(parsed) => settings.max_body_bytes = parsed,
            Err(error) => warn!(value = %v, %error, "ignoring APP__MAX_BODY_BYTES"),
        }
    }
}

/// Creates the store root if needed so startup fails early on a bad path.
pub fn prepare_store_root(settings: &Settings) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(&settings.store_root).with_context(|| {
        format!(
            "failed to create store root '{}'",
            settings.store_root.display()
        )
    })?;
    Ok(settings.store_root.clone())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
