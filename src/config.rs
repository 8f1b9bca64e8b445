//! Configuration loader and validator for the backfill engine.
use crate::model::Provider;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub queue: Queue,
    pub indexer: Indexer,
    pub providers: BTreeMap<Provider, ProviderConfig>,
    #[serde(default)]
    pub tenants: Vec<Tenant>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub max_attempts: i32,
}

/// Transport limits of the job queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    /// Longest delay a single redelivery may ask for.
    pub max_redelivery_delay_seconds: u64,
    /// Added on top of the remaining wait of a deferred job.
    pub safety_buffer_seconds: u64,
    /// Lease on a delivered job; also the handler's time budget.
    pub visibility_timeout_seconds: u64,
}

impl Queue {
    pub fn max_redelivery_delay(&self) -> Duration {
        Duration::from_secs(self.max_redelivery_delay_seconds)
    }

    pub fn safety_buffer(&self) -> Duration {
        Duration::from_secs(self.safety_buffer_seconds)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }
}

/// Indexing service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Indexer {
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
}

/// Per-provider rate constants and, for window-based providers, window tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub batch_size: usize,
    pub burst_capacity: usize,
    pub sustained_rate_per_hour: u32,
    #[serde(default = "default_unit_concurrency")]
    pub unit_concurrency: usize,
    #[serde(default)]
    pub window: Option<WindowSettings>,
}

fn default_unit_concurrency() -> usize {
    4
}

/// Window walker tuning. Empirical knobs, not invariants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowSettings {
    pub initial_window_hours: i64,
    pub min_window_hours: i64,
    pub max_window_hours: i64,
    pub low_water_mark: usize,
    pub high_water_mark: usize,
    pub growth_factor: f64,
    pub sync_floor: DateTime<Utc>,
    pub page_size: u32,
    pub min_page_size: u32,
    #[serde(default = "default_overlap_seconds")]
    pub resume_overlap_seconds: i64,
}

fn default_overlap_seconds() -> i64 {
    60
}

impl WindowSettings {
    pub fn initial_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.initial_window_hours)
    }

    pub fn min_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.min_window_hours)
    }

    pub fn max_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.max_window_hours)
    }

    pub fn resume_overlap(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.resume_overlap_seconds)
    }
}

/// Tenant and the scopes (projects/teams/boards) selected per provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub scopes: BTreeMap<Provider, Vec<String>>,
}

impl Tenant {
    /// Selected scopes for a provider; `None` means everything is in scope.
    pub fn scope(&self, provider: Provider) -> Option<&[String]> {
        self.scopes
            .get(&provider)
            .filter(|s| !s.is_empty())
            .map(Vec::as_slice)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.get(&provider)
    }

    pub fn tenant(&self, id: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|t| t.id == id)
    }

    /// SQLite URL under the data dir, unless `DATABASE_URL` overrides it.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/backfill.db", self.app.resolved_data_dir())
        })
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_attempts <= 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }

    if cfg.queue.max_redelivery_delay_seconds == 0 {
        return Err(ConfigError::Invalid(
            "queue.max_redelivery_delay_seconds must be > 0",
        ));
    }
    if cfg.queue.visibility_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "queue.visibility_timeout_seconds must be > 0",
        ));
    }

    if cfg.indexer.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("indexer.endpoint must be non-empty"));
    }

    for p in cfg.providers.values() {
        if p.batch_size == 0 {
            return Err(ConfigError::Invalid("providers.*.batch_size must be > 0"));
        }
        if p.sustained_rate_per_hour == 0 {
            return Err(ConfigError::Invalid(
                "providers.*.sustained_rate_per_hour must be > 0",
            ));
        }
        if p.unit_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "providers.*.unit_concurrency must be > 0",
            ));
        }
        if let Some(w) = &p.window {
            validate_window(w)?;
        }
    }

    for t in &cfg.tenants {
        if t.id.trim().is_empty() {
            return Err(ConfigError::Invalid("tenants[].id must be non-empty"));
        }
    }

    Ok(())
}

fn validate_window(w: &WindowSettings) -> Result<(), ConfigError> {
    if w.min_window_hours <= 0 {
        return Err(ConfigError::Invalid(
            "providers.*.window.min_window_hours must be > 0",
        ));
    }
    if w.max_window_hours < w.min_window_hours {
        return Err(ConfigError::Invalid(
            "providers.*.window.max_window_hours must be >= min_window_hours",
        ));
    }
    if w.initial_window_hours < w.min_window_hours || w.initial_window_hours > w.max_window_hours
    {
        return Err(ConfigError::Invalid(
            "providers.*.window.initial_window_hours must lie within [min, max]",
        ));
    }
    if w.low_water_mark > w.high_water_mark {
        return Err(ConfigError::Invalid(
            "providers.*.window.low_water_mark must be <= high_water_mark",
        ));
    }
    if !(w.growth_factor > 1.0) {
        return Err(ConfigError::Invalid(
            "providers.*.window.growth_factor must be > 1",
        ));
    }
    if w.min_page_size == 0 || w.page_size < w.min_page_size {
        return Err(ConfigError::Invalid(
            "providers.*.window.page_size must be >= min_page_size > 0",
        ));
    }
    if w.resume_overlap_seconds < 0 {
        return Err(ConfigError::Invalid(
            "providers.*.window.resume_overlap_seconds must be >= 0",
        ));
    }
    Ok(())
}

/// Returns the canonical example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 300
  max_attempts: 5

queue:
  max_redelivery_delay_seconds: 900
  safety_buffer_seconds: 3
  visibility_timeout_seconds: 900

indexer:
  endpoint: "http://127.0.0.1:8700/"
  token: "YOUR_INDEXER_TOKEN"

providers:
  figma:
    batch_size: 10
    burst_capacity: 15
    sustained_rate_per_hour: 600
  jira:
    batch_size: 25
    burst_capacity: 200
    sustained_rate_per_hour: 3600
    unit_concurrency: 8
  zendesk:
    batch_size: 100
    burst_capacity: 400
    sustained_rate_per_hour: 24000
    window:
      initial_window_hours: 168
      min_window_hours: 24
      max_window_hours: 2160
      low_water_mark: 100
      high_water_mark: 1000
      growth_factor: 2.0
      sync_floor: "2015-01-01T00:00:00Z"
      page_size: 100
      min_page_size: 10

tenants:
  - id: "acme"
    scopes:
      jira:
        - "PLAT"
        - "OPS"
  - id: "globex"
"#
}
