use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::services::preview::DEFAULT_PREVIEW_COMMAND;
use crate::services::worker::WorkerSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for job records and the task queue
    pub redis_url: String,

    /// Root that relative input paths are resolved against
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,

    /// Where outputs and previews are written; defaults to `<uploads_dir>/rendered`
    #[serde(default)]
    pub rendered_dir: Option<PathBuf>,

    /// Concurrent render tasks per worker process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Expiry of persisted job records, refreshed on every write
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    /// Age after which a cached job is re-read from Redis
    #[serde(default = "default_cache_max_age_ms")]
    pub cache_max_age_ms: u64,

    /// Idle sleep between queue polls
    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval of the synthetic progress ticker
    #[serde(default = "default_interval_ms")]
    pub progress_tick_ms: u64,

    /// Progress added per tick
    #[serde(default = "default_progress_step")]
    pub progress_step: u8,

    /// Seconds a worker's delivered tasks stay reserved without a heartbeat
    #[serde(default = "default_worker_lease_secs")]
    pub worker_lease_secs: u64,

    /// Preview command template with `{input}` and `{output}` placeholders
    #[serde(default = "default_preview_command")]
    pub preview_command: String,

    /// Shell used to run command strings
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Seconds between orphan sweeps; 0 disables the sweep
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Run a worker pool inside the HTTP server process
    #[serde(default)]
    pub embedded_worker: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_job_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_age_ms() -> u64 {
    1000
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_progress_step() -> u8 {
    10
}

fn default_worker_lease_secs() -> u64 {
    30
}

fn default_preview_command() -> String {
    DEFAULT_PREVIEW_COMMAND.to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn rendered_dir(&self) -> PathBuf {
        self.rendered_dir
            .clone()
            .unwrap_or_else(|| self.uploads_dir.join("rendered"))
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_millis(self.cache_max_age_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            concurrency: self.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            progress_tick: Duration::from_millis(self.progress_tick_ms),
            progress_step: self.progress_step,
            lease_ttl: Duration::from_secs(self.worker_lease_secs.max(1)),
        }
    }
}
