//! Process configuration, resolved once at startup from the environment and
//! handed to constructors. No global mutable state; tests build their own.

use crate::core::{AppError, AppResult, RateLimitConfig};
use crate::storage::{CloudStorageProvider, LocalStorageProvider, StorageProvider};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    Cloud,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    pub object_store_url: Option<String>,
    pub object_store_token: Option<String>,
    pub dashboard_url: String,
    pub bind: String,
    pub rate_limit: RateLimitConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            data_dir: PathBuf::from("./data"),
            object_store_url: None,
            object_store_token: None,
            dashboard_url: "https://dashboards.example.org".to_string(),
            bind: "127.0.0.1:8080".to_string(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> AppResult<Option<T>> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| AppError::Validation(format!("invalid value for {}: '{}'", name, raw))),
    }
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        let mut config = Self::default();

        if let Some(backend) = env_var("DISTSTATS_STORAGE_BACKEND") {
            config.backend = match backend.as_str() {
                "local" => StorageBackend::Local,
                "cloud" => StorageBackend::Cloud,
                other => {
                    return Err(AppError::Validation(format!(
                        "DISTSTATS_STORAGE_BACKEND must be 'local' or 'cloud', got '{}'",
                        other
                    )));
                }
            };
        }
        if let Some(dir) = env_var("DISTSTATS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.object_store_url = env_var("DISTSTATS_OBJECT_STORE_URL");
        config.object_store_token = env_var("DISTSTATS_OBJECT_STORE_TOKEN");
        if let Some(url) = env_var("DISTSTATS_DASHBOARD_URL") {
            config.dashboard_url = url;
        }
        if let Some(bind) = env_var("DISTSTATS_BIND") {
            config.bind = bind;
        }

        if let Some(v) = parse_env("DISTSTATS_RATE_MAX_PER_MINUTE")? {
            config.rate_limit.max_requests_per_minute = v;
        }
        if let Some(v) = parse_env("DISTSTATS_RATE_MAX_CONCURRENT")? {
            config.rate_limit.max_concurrent = v;
        }
        if let Some(v) = parse_env("DISTSTATS_RATE_MIN_DELAY_MS")? {
            config.rate_limit.min_delay_ms = v;
        }
        if let Some(v) = parse_env("DISTSTATS_RATE_MAX_DELAY_MS")? {
            config.rate_limit.max_delay_ms = v;
        }
        if let Some(v) = parse_env("DISTSTATS_RATE_BACKOFF_MULTIPLIER")? {
            config.rate_limit.backoff_multiplier = v;
        }
        config.rate_limit.validate()?;

        Ok(config)
    }

    pub fn build_storage(&self) -> AppResult<Arc<dyn StorageProvider>> {
        match self.backend {
            StorageBackend::Local => Ok(Arc::new(LocalStorageProvider::new(&self.data_dir)?)),
            StorageBackend::Cloud => {
                let url = self.object_store_url.clone().ok_or_else(|| {
                    AppError::Validation(
                        "DISTSTATS_OBJECT_STORE_URL is required for the cloud backend".into(),
                    )
                })?;
                Ok(Arc::new(CloudStorageProvider::new(
                    url,
                    self.object_store_token.clone(),
                )?))
            }
        }
    }
}
