use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::granularity::shard::parse_shards;
use crate::granularity::SelectionAlgorithm;
use crate::schedule::RerollPolicy;

/// Top-level configuration for a rollwheel instance.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shard ownership.
    #[serde(default)]
    pub shards: ShardsConfig,

    /// Rollup scheduling.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Shard state synchronization through the shared store.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Read-path granularity selection.
    #[serde(default)]
    pub query: QueryConfig,

    /// Bounded ingestion queue.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Shared shard state store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Shard ownership. Both keys take `ALL` or a comma separated list.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardsConfig {
    /// Shards this instance schedules rollups for. Default: "ALL".
    #[serde(default = "default_shards")]
    pub managed: String,

    /// Shards whose state is pushed and pulled. Default: "ALL".
    #[serde(default = "default_shards")]
    pub all: String,
}

impl ShardsConfig {
    pub fn managed_shards(&self) -> Result<Vec<u32>> {
        parse_shards(&self.managed).context("shards.managed")
    }

    pub fn all_shards(&self) -> Result<Vec<u32>> {
        parse_shards(&self.all).context("shards.all")
    }
}

/// Rollup scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Run the built-in rollup poller. Only useful with an executor that
    /// persists rollups. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// How long a slot must be idle before it is rolled up. Default: 5m.
    #[serde(default = "default_rollup_delay", with = "humantime_serde")]
    pub rollup_delay: Duration,

    /// How often the poller scans for eligible slots. Default: 1m.
    #[serde(default = "default_poll_period", with = "humantime_serde")]
    pub poll_period: Duration,

    /// Minimum age of a slot before it is rolled again after a recent
    /// rollup. Default: 10m.
    #[serde(default = "default_short_delay", with = "humantime_serde")]
    pub short_delay: Duration,

    /// Quiet period required after ingest before re-rolling a slot whose
    /// last sample arrived more than `short_delay` late. Default: 5m.
    #[serde(default = "default_long_delay_wait", with = "humantime_serde")]
    pub long_delay_wait: Duration,

    /// A rollup younger than this makes the next one a re-roll. Zero turns
    /// the re-roll delays off. Default: 72h.
    #[serde(default = "default_reroll_window", with = "humantime_serde")]
    pub reroll_window: Duration,
}

impl ScheduleConfig {
    /// Re-roll delays in millis, or `None` when turned off.
    pub fn reroll_policy(&self) -> Option<RerollPolicy> {
        if self.reroll_window.is_zero() {
            return None;
        }
        Some(RerollPolicy {
            short_delay: millis(self.short_delay),
            long_delay_wait: millis(self.long_delay_wait),
            window: millis(self.reroll_window),
        })
    }
}

/// Shard state synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Enable push and pull workers. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between pushes of local changes. Default: 2s.
    #[serde(default = "default_push_period", with = "humantime_serde")]
    pub push_period: Duration,

    /// Interval between pulls of shared state. Default: 20s.
    #[serde(default = "default_pull_period", with = "humantime_serde")]
    pub pull_period: Duration,
}

/// Read-path configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Sample interval assumed for full-resolution data when picking a
    /// granularity from a point count. Default: 60s.
    #[serde(default = "default_assumed_full_interval", with = "humantime_serde")]
    pub assumed_full_interval: Duration,

    /// How a granularity is picked from a point count. Default: "geometric".
    #[serde(default)]
    pub selection: SelectionAlgorithm,
}

/// Ingestion configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Total queued samples across workers. Default: 65536.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Number of ingest workers. Default: 1.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Shard state store backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; state is lost on restart.
    #[default]
    Memory,
    /// Shared ClickHouse table.
    ClickHouse,
}

/// Shard state store configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend selection. Default: "memory".
    #[serde(default)]
    pub backend: StoreBackend,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseStoreConfig,
}

/// ClickHouse connection configuration of the state store.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseStoreConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "rollwheel".
    #[serde(default = "default_database")]
    pub database: String,

    /// Slot state table name. Default: "slot_states".
    #[serde(default = "default_table")]
    pub table: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shards() -> String {
    "ALL".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rollup_delay() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_poll_period() -> Duration {
    Duration::from_secs(60)
}

fn default_short_delay() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_long_delay_wait() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_reroll_window() -> Duration {
    Duration::from_secs(72 * 60 * 60)
}

fn default_push_period() -> Duration {
    Duration::from_secs(2)
}

fn default_pull_period() -> Duration {
    Duration::from_secs(20)
}

fn default_assumed_full_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_queue_size() -> usize {
    65536
}

fn default_workers() -> usize {
    1
}

fn default_database() -> String {
    "rollwheel".to_string()
}

fn default_table() -> String {
    "slot_states".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            shards: ShardsConfig::default(),
            schedule: ScheduleConfig::default(),
            sync: SyncConfig::default(),
            query: QueryConfig::default(),
            ingest: IngestConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            managed: default_shards(),
            all: default_shards(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rollup_delay: default_rollup_delay(),
            poll_period: default_poll_period(),
            short_delay: default_short_delay(),
            long_delay_wait: default_long_delay_wait(),
            reroll_window: default_reroll_window(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            push_period: default_push_period(),
            pull_period: default_pull_period(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            assumed_full_interval: default_assumed_full_interval(),
            selection: SelectionAlgorithm::default(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            workers: default_workers(),
        }
    }
}

impl Default for ClickHouseStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::parse(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn parse(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let managed = self.shards.managed_shards()?;
        let all = self.shards.all_shards()?;
        if let Some(shard) = managed.iter().find(|s| all.binary_search(*s).is_err()) {
            bail!("shards.managed contains shard {shard} which is not in shards.all");
        }

        if self.schedule.rollup_delay.is_zero() {
            bail!("schedule.rollup_delay must be positive");
        }
        if self.schedule.poll_period.is_zero() {
            bail!("schedule.poll_period must be positive");
        }

        if self.sync.push_period.is_zero() {
            bail!("sync.push_period must be positive");
        }
        if self.sync.pull_period.is_zero() {
            bail!("sync.pull_period must be positive");
        }

        if self.query.assumed_full_interval.is_zero() {
            bail!("query.assumed_full_interval must be positive");
        }

        if self.ingest.queue_size == 0 {
            bail!("ingest.queue_size must be positive");
        }
        if self.ingest.workers == 0 {
            bail!("ingest.workers must be positive");
        }
        if self.ingest.workers > self.ingest.queue_size {
            bail!("ingest.workers must not exceed ingest.queue_size");
        }

        if self.store.backend == StoreBackend::ClickHouse {
            let ch = &self.store.clickhouse;
            if ch.endpoint.is_empty() {
                bail!("store.clickhouse.endpoint is required when store.backend is clickhouse");
            }
            if ch.database.is_empty() {
                bail!("store.clickhouse.database is required");
            }
            if ch.table.is_empty() {
                bail!("store.clickhouse.table is required");
            }
        }

        Ok(())
    }
}
