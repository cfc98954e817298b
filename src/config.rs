use crate::storage::ensure_parent_dir;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_FILE: &str = "config.json";
pub const WEATHER_KEY_ENV: &str = "OPENWEATHER_API_KEY";
pub const DEFAULT_WEATHER_ENDPOINT: &str = "https://api.openweathermap.org/data/2.5/weather";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub connect_timeout_secs: u64,
    pub weather_endpoint: String,
    pub weather_api_key: Option<String>,
    /// `None` selects the simulated gateway.
    pub sms_gateway_url: Option<String>,
    pub downloads_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            weather_endpoint: DEFAULT_WEATHER_ENDPOINT.to_owned(),
            weather_api_key: None,
            sms_gateway_url: None,
            downloads_dir: None,
        }
    }
}

impl AppConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Where captured stills and exported logs are written.
    pub fn downloads_dir(&self, data_root: &Path) -> PathBuf {
        self.downloads_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| data_root.join("downloads"))
    }

    fn apply_env(mut self) -> Self {
        if let Ok(key) = env::var(WEATHER_KEY_ENV)
            && !key.trim().is_empty()
        {
            self.weather_api_key = Some(key.trim().to_owned());
        }
        if self
            .weather_api_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            self.weather_api_key = None;
        }
        self
    }
}

pub fn config_path(data_root: &Path) -> PathBuf {
    data_root.join(CONFIG_FILE)
}

/// Reads `config.json` under `data_root`, writing the defaults first when the
/// file does not exist yet.
pub fn load_or_create_config(data_root: &Path) -> Result<AppConfig> {
    let path = config_path(data_root);

    if !path.exists() {
        let defaults = AppConfig::default();
        write_config_file(&path, &defaults)?;
        debug!(path = %path.display(), "created default config");
        return Ok(defaults.apply_env());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed reading config at {}", path.display()))?;
    let parsed = serde_json::from_str::<AppConfig>(&raw)
        .with_context(|| format!("failed parsing config at {}", path.display()))?;
    Ok(parsed.apply_env())
}

fn write_config_file(path: &Path, config: &AppConfig) -> Result<()> {
    ensure_parent_dir(path)?;
    let payload = serde_json::to_string_pretty(config).context("failed serializing config")?;
    fs::write(path, payload)
        .with_context(|| format!("failed writing config at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, config_path, load_or_create_config};
    use std::time::Duration;

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_create_config(dir.path()).unwrap();
        assert!(config_path(dir.path()).exists());
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.sms_gateway_url, None);
    }

    #[test]
    fn partial_config_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            config_path(dir.path()),
            r#"{"connect_timeout_secs": 3, "sms_gateway_url": "http://sms.local/send"}"#,
        )
        .unwrap();
        let config = load_or_create_config(dir.path()).unwrap();
        assert_eq!(config.connect_timeout_secs, 3);
        assert_eq!(
            config.sms_gateway_url.as_deref(),
            Some("http://sms.local/send")
        );
        assert_eq!(config.weather_endpoint, AppConfig::default().weather_endpoint);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(config_path(dir.path()), "{ nope").unwrap();
        assert!(load_or_create_config(dir.path()).is_err());
    }

    #[test]
    fn explicit_downloads_dir_wins() {
        let config = AppConfig {
            downloads_dir: Some("/tmp/stills".into()),
            ..AppConfig::default()
        };
        assert_eq!(
            config.downloads_dir("/data".as_ref()),
            std::path::PathBuf::from("/tmp/stills")
        );
    }
}
