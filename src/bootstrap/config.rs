use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;
use log::{LevelFilter, warn};
use rocket::figment::Figment;
use serde::Deserialize;

use crate::common::{CURRENT_NUM_THREADS, DEFAULT_JANITOR_INTERVAL, DEFAULT_WATERMARK_TTL};
use crate::operations::executor::ExecLimits;

pub const ENV_PREFIX: &str = "RESIZER_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Magick,
    Native,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Aws,
    Local,
}

fn default_port() -> u16 {
    8080
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    *CURRENT_NUM_THREADS
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_memory_mb() -> u64 {
    512
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("image-resizer")
}

fn default_watermark_ttl_secs() -> u64 {
    DEFAULT_WATERMARK_TTL.as_secs()
}

fn default_janitor_interval_secs() -> u64 {
    DEFAULT_JANITOR_INTERVAL.as_secs()
}

fn default_store_root() -> PathBuf {
    PathBuf::from("./buckets")
}

/// Service configuration, read from `RESIZER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResizerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Wall-clock limit for one executor or store call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_watermark_ttl_secs")]
    pub watermark_ttl_secs: u64,
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,
    #[serde(default)]
    pub executor: ExecutorKind,
    #[serde(default)]
    pub store: StoreKind,
    /// Root directory of the local store.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
}

impl ResizerConfig {
    /// Load `.env` if present, then read the environment.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        envy::prefixed(ENV_PREFIX)
            .from_env::<ResizerConfig>()
            .context("Failed to read RESIZER_* configuration")
    }

    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(ENV_PREFIX)
            .from_iter(pairs)
            .context("Failed to read RESIZER_* configuration")
    }

    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn limits(&self) -> ExecLimits {
        ExecLimits {
            timeout: self.timeout(),
            memory_mb: self.memory_mb,
        }
    }

    pub fn watermark_ttl(&self) -> Duration {
        Duration::from_secs(self.watermark_ttl_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }

    pub fn watermark_dir(&self) -> PathBuf {
        self.work_dir.join("watermarks")
    }

    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            warn!("Unknown log level `{}`, using info", self.log_level);
            LevelFilter::Info
        })
    }

    pub fn figment(&self) -> Figment {
        rocket::Config::figment()
            .merge(("port", self.port))
            .merge(("address", self.address.clone()))
            .merge(("shutdown.ctrlc", true))
    }
}
