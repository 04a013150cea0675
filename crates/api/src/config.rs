//! Process configuration read from the environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use roomstage_observability::LogFormat;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_format: LogFormat,
    /// Worker pool size; also sizes the bridge channel and queue consumer.
    pub concurrency: usize,
    pub default_queue: String,
    /// Queues consumed and accepted at submission; always holds `default_queue`.
    pub queues: Vec<String>,
    pub idle_backoff: Duration,
    /// Postgres images + Redis queue/bus instead of in-memory stores.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub staging: StagingSettings,
}

#[derive(Debug, Clone)]
pub struct StagingSettings {
    pub api_token: Option<String>,
    pub api_base_url: String,
    pub model_version: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub bucket: String,
    /// Path-style S3-compatible endpoint; unset keeps objects in memory.
    pub storage_endpoint: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_format: LogFormat::Json,
            concurrency: 4,
            default_queue: "default".to_string(),
            queues: vec!["default".to_string()],
            idle_backoff: Duration::from_millis(50),
            use_persistent_stores: false,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            staging: StagingSettings::default(),
        }
    }
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            api_token: None,
            api_base_url: roomstage_ai::replicate::DEFAULT_BASE_URL.to_string(),
            model_version: String::new(),
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
            bucket: "roomstage".to_string(),
            storage_endpoint: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Unset and blank
    /// variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = AppConfig::default();
        let staging = StagingSettings::default();

        let mut config = AppConfig {
            bind_addr: parsed(&var, "ROOMSTAGE_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            log_format: parsed(&var, "LOG_FORMAT")?.unwrap_or(defaults.log_format),
            concurrency: parsed(&var, "ROOMSTAGE_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            default_queue: var("ROOMSTAGE_DEFAULT_QUEUE").unwrap_or(defaults.default_queue),
            queues: var("ROOMSTAGE_QUEUES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|q| !q.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            idle_backoff: parsed(&var, "ROOMSTAGE_IDLE_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_backoff),
            use_persistent_stores: parsed(&var, "USE_PERSISTENT_STORES")?.unwrap_or(false),
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL").unwrap_or(defaults.redis_url),
            staging: StagingSettings {
                api_token: var("REPLICATE_API_TOKEN"),
                api_base_url: var("REPLICATE_BASE_URL").unwrap_or(staging.api_base_url),
                model_version: var("STAGING_MODEL_VERSION").unwrap_or(staging.model_version),
                poll_interval: parsed(&var, "STAGING_POLL_INTERVAL_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(staging.poll_interval),
                timeout: parsed(&var, "STAGING_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(staging.timeout),
                bucket: var("STAGING_BUCKET").unwrap_or(staging.bucket),
                storage_endpoint: var("STORAGE_ENDPOINT"),
            },
        };

        let mut queues = Vec::with_capacity(config.queues.len() + 1);
        if !config.queues.contains(&config.default_queue) {
            queues.push(config.default_queue.clone());
        }
        for queue in config.queues.drain(..) {
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }
        config.queues = queues;

        if config.concurrency == 0 {
            bail!("ROOMSTAGE_CONCURRENCY must be at least 1");
        }
        if config.staging.timeout.is_zero() {
            bail!("STAGING_TIMEOUT_SECS must be at least 1");
        }
        if config.use_persistent_stores && config.database_url.is_none() {
            bail!("USE_PERSISTENT_STORES=true requires DATABASE_URL");
        }
        Ok(config)
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid {key}: '{raw}'")))
        .transpose()
}
