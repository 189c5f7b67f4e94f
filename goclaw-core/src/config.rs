//! Configuration for the Goclaw engine.
//!
//! Configuration is loaded from a TOML file with `GOCLAW_*` environment
//! variable overrides layered on top, then validated before the engine
//! starts. Every knob maps to a documented runtime effect; the only value
//! mutated after startup is the log level (hot-reloadable through the CLI).

use crate::error::{GoclawError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "GOCLAW";

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoclawConfig {
    pub log_level: String,
    pub storage: StorageConfig,
    pub orchestration: OrchestrationConfig,
    pub saga: SagaConfig,
    pub signal: SignalConfig,
    pub lanes: Vec<LaneConfig>,
}

impl Default for GoclawConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            orchestration: OrchestrationConfig::default(),
            saga: SagaConfig::default(),
            signal: SignalConfig::default(),
            lanes: vec![LaneConfig::default()],
        }
    }
}

impl GoclawConfig {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );
        let cfg: Self = builder
            .build()
            .map_err(|e| GoclawError::config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| GoclawError::config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.orchestration.validate()?;
        if self.lanes.is_empty() {
            return Err(GoclawError::config("at least one lane must be configured"));
        }
        let mut seen = std::collections::HashSet::new();
        for lane in &self.lanes {
            lane.validate()?;
            if !seen.insert(lane.name.as_str()) {
                return Err(GoclawError::config(format!(
                    "duplicate lane name '{}'",
                    lane.name
                )));
            }
        }
        for lane in &self.lanes {
            if let BackpressurePolicy::Redirect { target } = &lane.backpressure {
                if !seen.contains(target.as_str()) {
                    return Err(GoclawError::config(format!(
                        "lane '{}' redirects to unknown lane '{}'",
                        lane.name, target
                    )));
                }
                if target == &lane.name {
                    return Err(GoclawError::config(format!(
                        "lane '{}' redirects to itself",
                        lane.name
                    )));
                }
            }
        }
        self.saga.validate()?;
        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(GoclawError::config(format!("invalid log level '{other}'"))),
        }
    }

    /// Lane configuration by name, if present.
    pub fn lane(&self, name: &str) -> Option<&LaneConfig> {
        self.lanes.iter().find(|l| l.name == name)
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    Memory,
    EmbeddedKv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    /// Database directory for the embedded KV backend
    pub path: PathBuf,
    /// Flush to disk on every transition write
    pub sync_writes: bool,
    /// Segment size hint for the embedded KV backend, in bytes
    pub value_log_file_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            path: PathBuf::from("./goclaw-data"),
            sync_writes: false,
            value_log_file_size: 64 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        if self.kind == StorageKind::EmbeddedKv && self.path.as_os_str().is_empty() {
            return Err(GoclawError::config("storage.path must be set for embedded-kv"));
        }
        Ok(())
    }
}

/// Scheduler/queue selection for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Upper bound on concurrently executing workflows
    pub max_agents: usize,
    /// Grace window for running tasks after cancellation or stop
    pub grace_period_secs: u64,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_agents: 64,
            grace_period_secs: 30,
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl OrchestrationConfig {
    fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(GoclawError::config("orchestration.max_agents must be > 0"));
        }
        self.queue.validate()?;
        self.scheduler.validate()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            size: 1024,
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<()> {
        match self.kind.as_str() {
            "memory" | "distributed" => Ok(()),
            other => Err(GoclawError::config(format!(
                "invalid orchestration.queue.type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: "layered".to_string(),
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.kind != "layered" {
            return Err(GoclawError::config(format!(
                "invalid orchestration.scheduler.type '{}'",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Backpressure policy applied when a lane queue is full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackpressurePolicy {
    /// Wait for queue space, honoring caller cancellation
    Block,
    /// Discard the submission
    Drop,
    /// Forward the submission to another lane
    Redirect { target: String },
}

impl TryFrom<String> for BackpressurePolicy {
    type Error = GoclawError;

    fn try_from(s: String) -> Result<Self> {
        match s.as_str() {
            "block" => Ok(Self::Block),
            "drop" => Ok(Self::Drop),
            other => match other.strip_prefix("redirect:") {
                Some(target) if !target.is_empty() => Ok(Self::Redirect {
                    target: target.to_string(),
                }),
                _ => Err(GoclawError::config(format!(
                    "invalid backpressure policy '{other}' (expected block, drop, or redirect:<lane>)"
                ))),
            },
        }
    }
}

impl From<BackpressurePolicy> for String {
    fn from(p: BackpressurePolicy) -> Self {
        match p {
            BackpressurePolicy::Block => "block".to_string(),
            BackpressurePolicy::Drop => "drop".to_string(),
            BackpressurePolicy::Redirect { target } => format!("redirect:{target}"),
        }
    }
}

/// Per-lane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    pub name: String,
    /// Queue bound; 0 means no buffering (direct handoff under Block)
    pub capacity: usize,
    pub max_concurrency: usize,
    /// Lower bound for dynamic worker scaling
    pub min_concurrency: Option<usize>,
    pub backpressure: BackpressurePolicy,
    /// Token-bucket admissions per second; 0 disables limiting
    pub rate_limit: u32,
    /// Dequeue by (priority, enqueue sequence) instead of FIFO
    pub priority_ordering: bool,
    pub enable_dynamic_workers: bool,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            capacity: 64,
            max_concurrency: 4,
            min_concurrency: None,
            backpressure: BackpressurePolicy::Block,
            rate_limit: 0,
            priority_ordering: false,
            enable_dynamic_workers: false,
        }
    }
}

impl LaneConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GoclawError::config("lane name must not be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(GoclawError::config(format!(
                "lane '{}': max_concurrency must be > 0",
                self.name
            )));
        }
        if let Some(min) = self.min_concurrency {
            if min == 0 || min > self.max_concurrency {
                return Err(GoclawError::config(format!(
                    "lane '{}': min_concurrency must be in [1, max_concurrency]",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Saga orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    pub enabled: bool,
    /// How long WAL records of terminal sagas are retained
    pub wal_retention_secs: u64,
    pub wal_cleanup_interval_secs: u64,
    /// Compensation retry budget
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wal_retention_secs: 24 * 60 * 60,
            wal_cleanup_interval_secs: 60 * 60,
            max_retries: 3,
            initial_backoff_ms: 100,
            backoff_factor: 2.0,
        }
    }
}

impl SagaConfig {
    fn validate(&self) -> Result<()> {
        if self.backoff_factor < 1.0 {
            return Err(GoclawError::config("saga.backoff_factor must be >= 1.0"));
        }
        Ok(())
    }

    pub fn wal_retention(&self) -> Duration {
        Duration::from_secs(self.wal_retention_secs)
    }

    pub fn wal_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.wal_cleanup_interval_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// Lifecycle event signaling mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// `local` or `distributed`; distributed falls back to local when the
    /// cluster bus is unavailable
    pub mode: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            mode: "local".to_string(),
        }
    }
}
