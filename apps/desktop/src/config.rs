use std::{fs, time::Duration};

use anyhow::Context;
use client_core::{InboundPolicy, ReconnectPolicy};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `None` runs the client offline.
    pub relay_url: Option<String>,
    pub database_url: String,
    pub inbound_policy: InboundPolicy,
    pub reconnect: ReconnectPolicy,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_url: Some("ws://127.0.0.1:8765".into()),
            database_url: "sqlite://./data/concord.db".into(),
            inbound_policy: InboundPolicy::Replace,
            reconnect: ReconnectPolicy::default(),
            log_filter: "info".into(),
        }
    }
}

/// Optional keys of `concord.toml`.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    relay_url: Option<String>,
    database_url: Option<String>,
    inbound_policy: Option<InboundPolicy>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    log_filter: Option<String>,
}

pub fn load_settings(config_path: &str) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(config_path) {
        apply_file_overrides(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{config_path}'"))?;
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;

    Ok(settings)
}

fn apply_file_overrides(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.relay_url {
        settings.relay_url = relay_url_or_offline(v);
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.inbound_policy {
        settings.inbound_policy = v;
    }
    if let Some(v) = file_cfg.reconnect_initial_ms {
        settings.reconnect.initial_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_ms {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_attempts {
        settings.reconnect.max_attempts = Some(v);
    }
    if let Some(v) = file_cfg.log_filter {
        settings.log_filter = v;
    }
    Ok(())
}

fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = lookup("CONCORD_RELAY_URL") {
        settings.relay_url = relay_url_or_offline(v);
    }
    if let Some(v) = lookup("APP__RELAY_URL") {
        settings.relay_url = relay_url_or_offline(v);
    }

    if let Some(v) = lookup("CONCORD_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = lookup("CONCORD_INBOUND_POLICY") {
        settings.inbound_policy = v.parse().map_err(anyhow::Error::msg)?;
    }

    if let Some(v) = lookup("RUST_LOG") {
        settings.log_filter = v;
    }
    Ok(())
}

/// An empty url or `offline` disables the relay.
pub fn relay_url_or_offline(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("offline") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
