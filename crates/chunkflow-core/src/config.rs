use std::{collections::BTreeMap, env, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use config as cfg;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{ConfidencePolicy, Methodology, DEFAULT_MAX_CHUNK_BYTES};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

/// Worker pool shared by every running task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PoolConfig {
    #[serde(default = "PoolConfig::default_workers")]
    pub workers: usize,
}

impl PoolConfig {
    fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChunkingConfig {
    /// Default chunk size bound S for the built-in methodologies.
    #[serde(default = "ChunkingConfig::default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

impl ChunkingConfig {
    fn default_max_chunk_bytes() -> usize {
        DEFAULT_MAX_CHUNK_BYTES
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: Self::default_max_chunk_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoordinatorConfig {
    #[serde(default = "CoordinatorConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "CoordinatorConfig::default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "CoordinatorConfig::default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "CoordinatorConfig::default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Whole-task timeout; `None` disables it.
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
    /// Grace period for in-flight dispatches after cancellation.
    #[serde(default = "CoordinatorConfig::default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl CoordinatorConfig {
    fn default_max_retries() -> u32 {
        3
    }
    fn default_retry_base_ms() -> u64 {
        200
    }
    fn default_retry_max_ms() -> u64 {
        5_000
    }
    fn default_dispatch_timeout_ms() -> u64 {
        60_000
    }
    fn default_drain_timeout_ms() -> u64 {
        5_000
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Exponential backoff `base * 2^retries`, capped at `retry_max_ms`.
    pub fn backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.retry_base_ms as u128;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = (self.retry_max_ms as u128).max(base_ms);
        let multiplier = 1u128 << retries_used.min(20);
        let backoff_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX))
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            retry_base_ms: Self::default_retry_base_ms(),
            retry_max_ms: Self::default_retry_max_ms(),
            dispatch_timeout_ms: Self::default_dispatch_timeout_ms(),
            task_timeout_ms: None,
            drain_timeout_ms: Self::default_drain_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    File,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "StorageConfig::default_path")]
    pub path: PathBuf,
}

impl StorageConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("data/chunkflow")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: Self::default_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct GraphConfig {
    /// Per edge type (display name) confidence policy overrides.
    #[serde(default)]
    pub confidence_policies: BTreeMap<String, ConfidencePolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    #[serde(default = "Settings::default_env")]
    pub env: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub methodologies: Vec<Methodology>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: Self::default_env(),
            logging: LoggingConfig::default(),
            pool: PoolConfig::default(),
            chunking: ChunkingConfig::default(),
            coordinator: CoordinatorConfig::default(),
            storage: StorageConfig::default(),
            graph: GraphConfig::default(),
            methodologies: Vec::new(),
        }
    }
}

impl Settings {
    fn default_env() -> String {
        env::var("APP_ENV")
            .ok()
            .or_else(|| env::var("RUST_ENV").ok())
            .unwrap_or_else(|| "development".to_string())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.pool.workers > 0, "pool.workers must be > 0");
        anyhow::ensure!(
            self.chunking.max_chunk_bytes > 0,
            "chunking.max_chunk_bytes must be > 0"
        );
        anyhow::ensure!(
            self.coordinator.dispatch_timeout_ms > 0,
            "coordinator.dispatch_timeout_ms must be > 0"
        );
        anyhow::ensure!(
            self.coordinator.retry_max_ms >= self.coordinator.retry_base_ms,
            "coordinator.retry_max_ms must be >= retry_base_ms"
        );
        if self.storage.backend == StorageBackend::File {
            anyhow::ensure!(
                !self.storage.path.as_os_str().is_empty(),
                "storage.path cannot be empty for the file backend"
            );
        }
        for m in &self.methodologies {
            m.validate()
                .with_context(|| format!("methodology {}", m.reference()))?;
        }
        Ok(())
    }
}

pub struct ConfigManager;

impl ConfigManager {
    /// Layer `default.*`, `{env}.*`, `local.toml` and `CHUNKFLOW__*` variables.
    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<Settings> {
        let settings: Settings = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.yaml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.json")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.yaml", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(cfg::Environment::with_prefix("CHUNKFLOW").separator("__"))
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        settings.validate()?;
        info!(
            "Loaded configuration from {:?} (env {})",
            config_dir, env_name
        );
        Ok(settings)
    }

    /// Load using `APP_ENV`/`RUST_ENV` to pick the environment file.
    pub fn load(config_dir: &Path) -> Result<Settings> {
        Self::load_from_sources(config_dir, &Settings::default_env())
    }
}
