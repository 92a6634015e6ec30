use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_SECS: u64 = 60;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 10_000;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_SHELL: &str = "sh";
pub const DEFAULT_HISTORY_PER_TASK: usize = 50;
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Top-level config (cronkeeper.toml + CRONKEEPER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronkeeperConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Trigger loop and dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between trigger-loop wake-ups. Ticks are aligned to wall-clock
    /// multiples of this value so a 60 s tick lands on every minute boundary.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Per-stream cap on captured stdout/stderr before middle-omission kicks in.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    /// How long shutdown waits for running commands before giving up on them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Shell used to interpret task command lines (`<shell> -c <command>`).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Most recent records per task kept in memory for history queries.
    /// The history store keeps everything.
    #[serde(default = "default_history_per_task")]
    pub history_per_task: usize,
    /// Request timeout for completion webhooks.
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

impl SchedulerConfig {
    /// Tick interval, never shorter than one second.
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            shell: DEFAULT_SHELL.to_string(),
            history_per_task: DEFAULT_HISTORY_PER_TASK,
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}
fn default_history_per_task() -> usize {
    DEFAULT_HISTORY_PER_TASK
}
fn default_webhook_timeout_secs() -> u64 {
    DEFAULT_WEBHOOK_TIMEOUT_SECS
}
fn default_db_path() -> String {
    format!("{}/cronkeeper.db", home_dir())
}

impl CronkeeperConfig {
    /// Load config from a TOML file with CRONKEEPER_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `CRONKEEPER_CONFIG` env var
    ///   3. ~/.cronkeeper/cronkeeper.toml
    ///
    /// A missing file is not an error; every field has a default. Env
    /// overrides use a double underscore between section and key, e.g.
    /// `CRONKEEPER_SCHEDULER__TICK_SECS=1`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("CRONKEEPER_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        tracing::debug!(%path, "loading configuration");

        let config: CronkeeperConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRONKEEPER_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn home_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronkeeper", home)
}

fn default_config_path() -> String {
    format!("{}/cronkeeper.toml", home_dir())
}
