use crate::activity::{ActivityLog, SharedActivityLog};
use crate::config::{AppConfig, load_or_create_config};
use crate::notify::{Notifier, gateway_from_config};
use crate::storage::{FileStore, SharedStore, data_root};
use crate::weather::WeatherClient;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "rescue-console.log";

/// Everything a command needs: where data lives, the store over it, the
/// loaded config and the session's activity log.
pub struct AppContext {
    pub data_root: PathBuf,
    pub store: SharedStore,
    pub config: AppConfig,
    pub log: SharedActivityLog,
}

impl AppContext {
    pub fn open(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_root = match data_dir {
            Some(dir) => dir,
            None => data_root()?,
        };
        fs::create_dir_all(&data_root)
            .with_context(|| format!("failed creating data directory {}", data_root.display()))?;
        let config = load_or_create_config(&data_root)?;
        Ok(Self {
            store: Arc::new(FileStore::new(&data_root)),
            data_root,
            config,
            log: ActivityLog::shared(),
        })
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.config.downloads_dir(&self.data_root)
    }

    pub fn notifier(&self) -> Notifier {
        Notifier::new(
            gateway_from_config(self.config.sms_gateway_url.as_deref()),
            Arc::clone(&self.log),
        )
    }

    pub fn weather_client(&self) -> WeatherClient {
        WeatherClient::new(
            self.config.weather_endpoint.clone(),
            self.config.weather_api_key.clone(),
        )
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Full-screen commands log to a daily file under `<data>/logs` so the
/// terminal stays clean; the returned guard flushes it on drop.
pub fn init_file_tracing(data_root: &Path) -> Result<WorkerGuard> {
    let dir = data_root.join(LOG_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed creating log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

pub fn init_stderr_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}
