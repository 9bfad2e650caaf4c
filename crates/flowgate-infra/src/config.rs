//! Configuration loader for Flowgate.
//!
//! Reads `config.toml` (by default from the data directory, `~/.flowgate/`)
//! into [`Settings`]. A missing or malformed file yields defaults, so a
//! fresh install runs without any configuration.

use std::path::{Path, PathBuf};

use flowgate_types::config::Settings;

use crate::sqlite::pool::{default_data_dir, default_database_url};

/// Overrides `Settings::database_url` when set.
pub const DATABASE_URL_ENV: &str = "FLOWGATE_DATABASE_URL";

/// `<data_dir>/config.toml`.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// Load settings from `path`, then apply environment overrides.
///
/// - If the file does not exist, defaults are used.
/// - If the file cannot be read or parsed, a warning is logged and defaults are used.
pub async fn load_settings(path: &Path) -> Settings {
    let settings = read_settings_file(path).await;
    apply_env_overrides(settings, std::env::var(DATABASE_URL_ENV).ok())
}

async fn read_settings_file(path: &Path) -> Settings {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Settings::default();
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read config, using defaults");
            return Settings::default();
        }
    };

    match toml::from_str::<Settings>(&content) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to parse config, using defaults");
            Settings::default()
        }
    }
}

/// Apply the `FLOWGATE_DATABASE_URL` value (passed in by the caller).
pub fn apply_env_overrides(mut settings: Settings, database_url: Option<String>) -> Settings {
    if let Some(url) = database_url.filter(|u| !u.trim().is_empty()) {
        settings.database_url = Some(url);
    }
    settings
}

/// The configured database URL, else the default under the data directory.
pub fn resolve_database_url(settings: &Settings) -> String {
    settings
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}
