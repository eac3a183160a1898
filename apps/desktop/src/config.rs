use std::{fs, path::Path, time::Duration};

use client_core::ReconnectPolicy;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub database_url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub remember_credentials: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".into(),
            database_url: "sqlite://./data/client.db".into(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            remember_credentials: true,
        }
    }
}

impl Settings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    database_url: Option<String>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    remember_credentials: Option<bool>,
}

/// Defaults, then `path` (if present), then `CHAT_*` / `APP__*` variables.
pub fn load_settings(path: &Path) -> Settings {
    load_settings_with(path, |key| std::env::var(key).ok())
}

fn load_settings_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.server_url {
                    settings.server_url = v;
                }
                if let Some(v) = file_cfg.database_url {
                    settings.database_url = v;
                }
                if let Some(v) = file_cfg.reconnect_attempts {
                    settings.reconnect_attempts = v;
                }
                if let Some(v) = file_cfg.reconnect_delay_ms {
                    settings.reconnect_delay_ms = v;
                }
                if let Some(v) = file_cfg.remember_credentials {
                    settings.remember_credentials = v;
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "ignoring unreadable config file"),
        }
    }

    for key in ["CHAT_SERVER_URL", "APP__SERVER_URL"] {
        if let Some(v) = env(key) {
            settings.server_url = v;
        }
    }
    for key in ["CHAT_DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = env(key) {
            settings.database_url = v;
        }
    }
    if let Some(v) = env("APP__RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.reconnect_attempts = v;
    }
    if let Some(v) = env("APP__RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = env("CHAT_REMEMBER_CREDENTIALS").and_then(|v| parse_flag(&v)) {
        settings.remember_credentials = v;
    }

    settings
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Turns a bare path into a `sqlite://` url. Parent directories are created
/// by the storage crate when the cache is opened.
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
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_reconnect_policy() {
        let settings = load_settings_with(Path::new("missing-client.toml"), env_of(&[]));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.reconnect_policy(), ReconnectPolicy::default());
    }

    #[test]
    fn file_values_are_overridden_by_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("client.toml");
        fs::write(
            &path,
            "server_url = \"http://chat.local:4000\"\nreconnect_attempts = 2\nremember_credentials = false\n",
        )
        .expect("write config");

        let settings = load_settings_with(
            &path,
            env_of(&[
                ("APP__SERVER_URL", "https://chat.example.com"),
                ("CHAT_DATABASE_URL", "./cache/chat.db"),
                ("APP__RECONNECT_DELAY_MS", "250"),
            ]),
        );

        assert_eq!(settings.server_url, "https://chat.example.com");
        assert_eq!(settings.database_url, "./cache/chat.db");
        assert_eq!(settings.reconnect_attempts, 2);
        assert_eq!(settings.reconnect_delay_ms, 250);
        assert!(!settings.remember_credentials);
    }

    #[test]
    fn malformed_numbers_keep_previous_value() {
        let settings = load_settings_with(
            Path::new("missing-client.toml"),
            env_of(&[("APP__RECONNECT_ATTEMPTS", "lots"), ("CHAT_REMEMBER_CREDENTIALS", "no")]),
        );
        assert_eq!(settings.reconnect_attempts, 5);
        assert!(!settings.remember_credentials);
    }

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
        assert_eq!(normalize_database_url("sqlite:cache.db"), "sqlite://cache.db");
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("  "), Settings::default().database_url);
    }
}
