use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PORT: u16 = 6710;
const DEFAULT_RESUME_HANDLE_TTL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub recovery_service_url: String,
    pub request_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
    pub max_launch_attempts: u32,
    pub resume_handle_ttl_secs: u64,
    pub plans_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let database_url = crate::paths::data_dir()
            .map(|dir| format!("sqlite:{}", dir.join("recovery_orchestrator.db").display()))
            .unwrap_or_else(|_| "sqlite:recovery_orchestrator.db".to_string());
        let plans_file = crate::paths::conf_dir()
            .map(|dir| dir.join("plans.json"))
            .ok()
            .filter(|path| path.is_file());
        Self {
            database_url,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            recovery_service_url: "http://127.0.0.1:6711".to_string(),
            request_timeout_secs: 10,
            poll_interval_secs: 30,
            max_poll_attempts: 120,
            max_launch_attempts: 5,
            resume_handle_ttl_secs: DEFAULT_RESUME_HANDLE_TTL_SECS,
            plans_file,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = Self::from_conf_file()? {
            config.apply_file(file_config);
        }

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }

        if let Ok(port) = std::env::var("PORT") {
            config.port = port.parse().unwrap_or(DEFAULT_PORT);
        }

        if let Ok(url) = std::env::var("RECOVERY_SERVICE_URL") {
            config.recovery_service_url = url;
        }

        if let Ok(interval) = std::env::var("POLL_INTERVAL_SECS") {
            config.poll_interval_secs = interval
                .parse()
                .with_context(|| format!("Invalid POLL_INTERVAL_SECS '{}'", interval))?;
        }

        if let Ok(attempts) = std::env::var("MAX_POLL_ATTEMPTS") {
            config.max_poll_attempts = attempts
                .parse()
                .with_context(|| format!("Invalid MAX_POLL_ATTEMPTS '{}'", attempts))?;
        }

        config.validate()?;
        config.normalize_database_url()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Polling budget per wave: `max_poll_attempts` ticks of the poll interval.
    pub fn poll_window(&self) -> Duration {
        self.poll_interval().saturating_mul(self.max_poll_attempts)
    }

    pub fn resume_handle_ttl(&self) -> Duration {
        Duration::from_secs(self.resume_handle_ttl_secs)
    }

    fn from_conf_file() -> Result<Option<FileConfig>> {
        let path = crate::paths::conf_dir()?.join("config.json");
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file_config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(Some(file_config))
    }

    fn apply_file(&mut self, file_config: FileConfig) {
        if let Some(database_url) = file_config.database_url {
            self.database_url = database_url;
        }
        if let Some(host) = file_config.host {
            self.host = host;
        }
        if let Some(port) = file_config.port {
            self.port = port;
        }
        if let Some(url) = file_config.recovery_service_url {
            self.recovery_service_url = url;
        }
        if let Some(secs) = file_config.request_timeout_secs {
            self.request_timeout_secs = secs;
        }
        if let Some(secs) = file_config.poll_interval_secs {
            self.poll_interval_secs = secs;
        }
        if let Some(attempts) = file_config.max_poll_attempts {
            self.max_poll_attempts = attempts;
        }
        if let Some(attempts) = file_config.max_launch_attempts {
            self.max_launch_attempts = attempts;
        }
        if let Some(secs) = file_config.resume_handle_ttl_secs {
            self.resume_handle_ttl_secs = secs;
        }
        if let Some(plans_file) = file_config.plans_file {
            self.plans_file = Some(PathBuf::from(plans_file));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than zero");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }
        if self.max_poll_attempts == 0 || self.max_launch_attempts == 0 {
            anyhow::bail!("max_poll_attempts and max_launch_attempts must be at least 1");
        }
        if self.resume_handle_ttl_secs == 0 {
            anyhow::bail!("resume_handle_ttl_secs must be greater than zero");
        }
        Ok(())
    }

    fn normalize_database_url(&mut self) -> Result<()> {
        let Some(path_str) = self.database_url.strip_prefix("sqlite:") else {
            return Ok(());
        };
        if path_str.starts_with(":memory:") {
            return Ok(());
        }

        let path = Path::new(path_str);
        if path.is_absolute() {
            return Ok(());
        }

        if path
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir))
        {
            anyhow::bail!("SQLite database path cannot contain '..'");
        }

        let root = crate::paths::install_root()?;
        self.database_url = format!("sqlite:{}", root.join(path).display());
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database_url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    recovery_service_url: Option<String>,
    request_timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    max_poll_attempts: Option<u32>,
    max_launch_attempts: Option<u32>,
    resume_handle_ttl_secs: Option<u64>,
    plans_file: Option<String>,
}
