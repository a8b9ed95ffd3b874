//! Configuration loader and validator for the reel monitoring daemon.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub scheduler: Scheduler,
    #[serde(default)]
    pub monitor: Monitor,
    #[serde(default)]
    pub graph: Graph,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
    /// Prometheus text file rewritten by the daemon; defaults to
    /// `{data_dir}/metrics.prom`.
    #[serde(default)]
    pub metrics_file: Option<String>,
    /// How often the metrics file is rewritten; 0 disables it.
    #[serde(default = "default_metrics_flush_seconds")]
    pub metrics_flush_seconds: u64,
}

fn default_metrics_flush_seconds() -> u64 {
    15
}

/// Scheduling policy shared by all tenants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Scheduler {
    pub default_interval_seconds: u64,
    /// Ticks later than this are dropped instead of run late.
    pub misfire_grace_seconds: u64,
    /// Size of the worker pool shared by all tenants.
    pub max_concurrent_cycles: usize,
    /// How often the daemon reconciles jobs with the store; 0 disables it.
    pub resync_seconds: u64,
    /// How often the daemon picks up queued manual triggers.
    pub trigger_poll_seconds: u64,
    pub cycle_timeout_seconds: Option<u64>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            default_interval_seconds: 300,
            misfire_grace_seconds: 30,
            max_concurrent_cycles: 8,
            resync_seconds: 60,
            trigger_poll_seconds: 2,
            cycle_timeout_seconds: None,
        }
    }
}

/// Cycle executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Monitor {
    pub call_timeout_seconds: u64,
    /// Run the remote reply check when a comment carries no reply summary.
    pub verify_when_summary_missing: bool,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            call_timeout_seconds: 15,
            verify_when_summary_missing: false,
        }
    }
}

/// Graph API client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Graph {
    pub base_url: String,
    pub default_version: String,
    pub request_timeout_seconds: u64,
    pub user_agent: String,
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com/".into(),
            default_version: "v20.0".into(),
            request_timeout_seconds: 15,
            user_agent: "reel-watchbot/0.1".into(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins, then `app.database_url`, then a file in `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/reel-watchbot.db", self.app.data_dir))
    }

    pub fn metrics_path(&self) -> PathBuf {
        match &self.app.metrics_file {
            Some(file) if !file.trim().is_empty() => PathBuf::from(file),
            _ => Path::new(&self.app.data_dir).join("metrics.prom"),
        }
    }
}

impl Scheduler {
    pub fn misfire_grace(&self) -> Duration {
        Duration::from_secs(self.misfire_grace_seconds)
    }

    pub fn cycle_timeout(&self) -> Option<Duration> {
        self.cycle_timeout_seconds.map(Duration::from_secs)
    }
}

impl Monitor {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

/// Parse and validate configuration from YAML text.
pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.scheduler.default_interval_seconds == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.default_interval_seconds must be > 0",
        ));
    }
    if cfg.scheduler.max_concurrent_cycles == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.max_concurrent_cycles must be > 0",
        ));
    }
    if cfg.scheduler.trigger_poll_seconds == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.trigger_poll_seconds must be > 0",
        ));
    }
    if cfg.scheduler.cycle_timeout_seconds == Some(0) {
        return Err(ConfigError::Invalid(
            "scheduler.cycle_timeout_seconds must be > 0 when set",
        ));
    }
    if cfg.monitor.call_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("monitor.call_timeout_seconds must be > 0"));
    }
    if cfg.graph.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("graph.base_url must be non-empty"));
    }
    if cfg.graph.default_version.trim().is_empty() {
        return Err(ConfigError::Invalid("graph.default_version must be non-empty"));
    }
    if cfg.graph.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "graph.request_timeout_seconds must be > 0",
        ));
    }
    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  metrics_flush_seconds: 15

scheduler:
  default_interval_seconds: 300
  misfire_grace_seconds: 30
  max_concurrent_cycles: 8
  resync_seconds: 60
  trigger_poll_seconds: 2

monitor:
  call_timeout_seconds: 15
  verify_when_summary_missing: false

graph:
  base_url: "https://graph.facebook.com/"
  default_version: "v20.0"
  request_timeout_seconds: 15
  user_agent: "reel-watchbot/0.1"
"#
}
