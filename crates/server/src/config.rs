use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub session_secret: String,
    pub session_ttl_hours: i64,
    pub reaction_cap: i64,
    pub channel_cap: i64,
    pub rate_limit_max_actions: u64,
    pub rate_limit_window_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/chat.db".into(),
            session_secret: "dev-session-secret".into(),
            session_ttl_hours: 24 * 7,
            reaction_cap: server_api::DEFAULT_REACTION_CAP,
            channel_cap: server_api::DEFAULT_CHANNEL_CAP,
            rate_limit_max_actions: 30,
            rate_limit_window_secs: 10,
        }
    }
}

/// Defaults, then `server.toml` when present, then `APP__*` variables.
pub fn load_settings() -> anyhow::Result<Settings> {
    build_settings(Some(Path::new("server.toml")), Environment::default())
}

pub(crate) fn build_settings(file: Option<&Path>, env: Environment) -> anyhow::Result<Settings> {
    let defaults = Settings::default();
    let mut builder = Config::builder()
        .set_default("bind_addr", defaults.bind_addr)?
        .set_default("database_url", defaults.database_url)?
        .set_default("session_secret", defaults.session_secret)?
        .set_default("session_ttl_hours", defaults.session_ttl_hours)?
        .set_default("reaction_cap", defaults.reaction_cap)?
        .set_default("channel_cap", defaults.channel_cap)?
        .set_default("rate_limit_max_actions", defaults.rate_limit_max_actions)?
        .set_default("rate_limit_window_secs", defaults.rate_limit_window_secs)?;
    if let Some(path) = file {
        builder = builder.add_source(File::from(path).required(false));
    }
    let settings = builder
        .add_source(env.prefix("APP").separator("__").try_parsing(true))
        .build()
        .context("failed to assemble server settings")?
        .try_deserialize::<Settings>()
        .context("invalid server settings")?;
    Ok(settings)
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
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
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url)
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
    else {
        return Ok(());
    };

    fs::create_dir_all(&parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
