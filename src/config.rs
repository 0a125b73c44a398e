use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::schedule::RetryPolicy;

const DEFAULT_BIND: &str = "127.0.0.1:7200";
const DEFAULT_SQLITE_PATH: &str = "sqlite://./asr_data/database/storage.db?mode=rwc";
const DEFAULT_UPLOAD_DIR: &str = "./asr_data/uploads";
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_MODELS_DIR: &str = "./models";
const DEFAULT_LANGUAGE: &str = "zh";
const DEFAULT_INITIAL_PROMPT: &str = "以下是普通话的转录：";

/// Which whisper model the worker pool loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSelection {
    /// Set through `ASR_MODEL`.
    Explicit(String),
    /// Picked from the build: accelerator builds get the large model.
    Default(String),
}

impl ModelSelection {
    pub fn resolve(explicit: Option<String>) -> Self {
        match explicit.filter(|m| !m.trim().is_empty()) {
            Some(name) => ModelSelection::Explicit(name),
            None if accelerator_available() => ModelSelection::Default("large-v2".to_string()),
            None => ModelSelection::Default("medium".to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ModelSelection::Explicit(name) | ModelSelection::Default(name) => name,
        }
    }

    /// `ggml-{name}.bin` under the models directory, or the value itself when it
    /// already points at a file.
    pub fn model_path(&self, models_dir: &std::path::Path) -> PathBuf {
        let name = self.name();
        if name.ends_with(".bin") {
            return PathBuf::from(name);
        }
        models_dir.join(format!("ggml-{}.bin", name))
    }
}

fn accelerator_available() -> bool {
    cfg!(any(feature = "cuda", feature = "metal"))
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: String,
    pub database_url: String,
    pub upload_dir: PathBuf,
    pub log_dir: String,
    pub log_level: String,
    pub model: ModelSelection,
    pub models_dir: PathBuf,
    pub language: String,
    pub initial_prompt: String,
    pub workers: usize,
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub time_limit: Duration,
    pub lease_grace: Duration,
    pub poll_interval: Duration,
    pub max_upload_bytes: u64,
    pub sweep_interval: Duration,
    pub orphan_grace: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND.to_string(),
            database_url: DEFAULT_SQLITE_PATH.to_string(),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            log_level: "info".to_string(),
            model: ModelSelection::resolve(None),
            models_dir: PathBuf::from(DEFAULT_MODELS_DIR),
            language: DEFAULT_LANGUAGE.to_string(),
            initial_prompt: DEFAULT_INITIAL_PROMPT.to_string(),
            workers: 1,
            max_retries: 3,
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(600),
            time_limit: Duration::from_secs(3600),
            lease_grace: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1000),
            max_upload_bytes: 500 * 1024 * 1024,
            sweep_interval: Duration::from_secs(300),
            orphan_grace: Duration::from_secs(3600),
        }
    }
}

impl AppConfig {
    /// Build the config from the process environment, loading `.env` first.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        Self {
            bind_address: env_or("ASR_BIND", &defaults.bind_address),
            database_url: env_or("ASR_DATABASE_URL", &defaults.database_url),
            upload_dir: PathBuf::from(env_or("ASR_UPLOAD_DIR", DEFAULT_UPLOAD_DIR)),
            log_dir: env_or("ASR_LOG_DIR", &defaults.log_dir),
            log_level: env_or("ASR_LOG", &defaults.log_level),
            model: ModelSelection::resolve(env::var("ASR_MODEL").ok()),
            models_dir: PathBuf::from(env_or("ASR_MODELS_DIR", DEFAULT_MODELS_DIR)),
            language: env_or("ASR_LANGUAGE", &defaults.language),
            initial_prompt: env_or("ASR_INITIAL_PROMPT", &defaults.initial_prompt),
            workers: parse_env("ASR_WORKERS", defaults.workers).max(1),
            max_retries: parse_env("ASR_MAX_RETRIES", defaults.max_retries),
            min_backoff: Duration::from_millis(parse_env("ASR_MIN_BACKOFF_MS", 10_000)),
            max_backoff: Duration::from_millis(parse_env("ASR_MAX_BACKOFF_MS", 600_000)),
            time_limit: Duration::from_secs(parse_env("ASR_TIME_LIMIT_SECS", 3600)),
            lease_grace: Duration::from_secs(parse_env("ASR_LEASE_GRACE_SECS", 60)),
            poll_interval: Duration::from_millis(parse_env("ASR_POLL_INTERVAL_MS", 1000)),
            max_upload_bytes: megabytes(parse_env("ASR_MAX_UPLOAD_MB", 500)),
            sweep_interval: Duration::from_secs(parse_env("ASR_SWEEP_INTERVAL_SECS", 300)),
            orphan_grace: Duration::from_secs(parse_env("ASR_ORPHAN_GRACE_SECS", 3600)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
        }
    }

    /// Lease length handed out by the queue: the handler limit plus slack for
    /// settling the delivery.
    pub fn lease_duration(&self) -> Duration {
        self.time_limit + self.lease_grace
    }

    pub fn model_path(&self) -> PathBuf {
        self.model.model_path(&self.models_dir)
    }

    pub fn log_summary(&self) {
        info!(
            bind = %self.bind_address,
            database = %self.database_url,
            upload_dir = %self.upload_dir.display(),
            model = %self.model.name(),
            workers = self.workers,
            max_retries = self.max_retries,
            time_limit_secs = self.time_limit.as_secs(),
            "configuration loaded"
        );
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn megabytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
