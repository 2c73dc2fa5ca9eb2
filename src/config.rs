//! TOML configuration for the `fleet` binary.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/fleet.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [dispatch]
//! page_size = 100
//! batch_limit = 20
//! claim_ttl_secs = 300
//!
//! [placement]
//! reallocation = true
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use fleet_coordinator_core::dispatch::DispatchSettings;
use fleet_coordinator_core::nodes::BackoffPolicy;
use fleet_coordinator_core::partitions::PartitionPolicy;
use fleet_coordinator_core::placement::PlacementPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub partitions: PartitionsConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            batch_limit: default_batch_limit(),
            claim_ttl_secs: default_claim_ttl_secs(),
        }
    }
}

fn default_page_size() -> usize {
    100
}
fn default_batch_limit() -> usize {
    20
}
fn default_claim_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_secs")]
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_secs: default_max_secs(),
        }
    }
}

fn default_base_ms() -> u64 {
    1000
}
fn default_max_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct PartitionsConfig {
    #[serde(default = "default_duration_hours")]
    pub duration_hours: u64,
}

impl Default for PartitionsConfig {
    fn default() -> Self {
        Self {
            duration_hours: default_duration_hours(),
        }
    }
}

fn default_duration_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlacementConfig {
    #[serde(default = "default_buffer_factor")]
    pub buffer_factor: u64,
    #[serde(default = "default_watermark_low")]
    pub watermark_low: f64,
    #[serde(default = "default_watermark_high")]
    pub watermark_high: f64,
    /// Shed namespaces from nodes above the high watermark.
    #[serde(default)]
    pub reallocation: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            buffer_factor: default_buffer_factor(),
            watermark_low: default_watermark_low(),
            watermark_high: default_watermark_high(),
            reallocation: false,
        }
    }
}

fn default_buffer_factor() -> u64 {
    3
}
fn default_watermark_low() -> f64 {
    0.7
}
fn default_watermark_high() -> f64 {
    0.8
}

#[derive(Debug, Deserialize, Clone)]
pub struct HousekeepingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_grace_days")]
    pub grace_days: i64,
    #[serde(default = "default_subscription_batch")]
    pub batch_size: usize,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            grace_days: default_grace_days(),
            batch_size: default_subscription_batch(),
        }
    }
}

fn default_grace_days() -> i64 {
    30
}
fn default_subscription_batch() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default `tracing` filter; `RUST_LOG` takes precedence.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            page_size: self.dispatch.page_size,
            batch_limit: self.dispatch.batch_limit,
            claim_ttl: chrono::Duration::seconds(self.dispatch.claim_ttl_secs as i64),
            housekeeping_interval: StdDuration::from_secs(self.housekeeping.interval_secs),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: StdDuration::from_millis(self.backoff.base_ms),
            max: StdDuration::from_secs(self.backoff.max_secs),
        }
    }

    pub fn partition_policy(&self) -> PartitionPolicy {
        PartitionPolicy {
            duration: chrono::Duration::hours(self.partitions.duration_hours as i64),
        }
    }

    pub fn placement_policy(&self) -> PlacementPolicy {
        PlacementPolicy {
            buffer_factor: self.placement.buffer_factor,
            watermark_low: self.placement.watermark_low,
            watermark_high: self.placement.watermark_high,
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    if config.dispatch.page_size == 0 {
        bail!("dispatch.page_size must be > 0");
    }
    if config.dispatch.batch_limit == 0 {
        bail!("dispatch.batch_limit must be > 0");
    }
    if config.dispatch.claim_ttl_secs == 0 || config.dispatch.claim_ttl_secs > 86_400 {
        bail!("dispatch.claim_ttl_secs must be in [1, 86400]");
    }

    if config.backoff.base_ms == 0 {
        bail!("backoff.base_ms must be > 0");
    }
    if config.backoff.max_secs.saturating_mul(1000) < config.backoff.base_ms {
        bail!("backoff.max_secs must not be shorter than backoff.base_ms");
    }

    if config.partitions.duration_hours == 0 || config.partitions.duration_hours > 24 * 366 {
        bail!("partitions.duration_hours must be in [1, 8784]");
    }

    let placement = &config.placement;
    if placement.buffer_factor == 0 {
        bail!("placement.buffer_factor must be >= 1");
    }
    if !(0.0..=1.0).contains(&placement.watermark_low)
        || !(0.0..=1.0).contains(&placement.watermark_high)
    {
        bail!("placement watermarks must be in [0.0, 1.0]");
    }
    if placement.watermark_low > placement.watermark_high {
        bail!("placement.watermark_low must not exceed placement.watermark_high");
    }

    if config.housekeeping.interval_secs == 0 {
        bail!("housekeeping.interval_secs must be > 0");
    }

    if config.subscriptions.grace_days < 0 {
        bail!("subscriptions.grace_days must be >= 0");
    }
    if config.subscriptions.batch_size == 0 {
        bail!("subscriptions.batch_size must be > 0");
    }

    Ok(())
}
