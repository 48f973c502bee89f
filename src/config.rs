use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for a connection to one database home.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Directory holding local objects, the metadata log and the lock file
    pub home: PathBuf,

    /// Block manager configuration
    pub block: BlockConfig,

    /// Tiered storage configuration
    pub tiered: TieredConfig,

    /// Eviction thresholds
    pub eviction: EvictionConfig,

    /// Query planner configuration
    pub planner: PlannerConfig,
}

#[derive(Debug, Clone)]
pub struct BlockConfig {
    /// Every block offset and size is a multiple of this (default: 4KB)
    pub allocation_size: u64,

    /// Number of non-current handles a block manager keeps open before
    /// releasing the oldest ones (default: 16)
    pub max_handle_array: usize,
}

#[derive(Debug, Clone)]
pub struct TieredConfig {
    /// Bucket objects are flushed to (default: "tierdb")
    pub bucket: String,

    /// Prefix prepended to every remote object name (default: "")
    pub bucket_prefix: String,

    /// Name of the storage source backing the bucket (default: "dir_store")
    pub storage_source: String,

    /// How often the tiered work queue is drained (default: 1s)
    pub work_interval: Duration,

    /// How often the handle cache is swept (default: 5s)
    pub sweep_interval: Duration,

    /// Flush attempts before an item is parked in the failed list (default: 3)
    pub max_flush_attempts: u32,
}

/// Eviction thresholds, either as a percentage of the cache or as absolute
/// byte counts (any value above 100 is treated as bytes).
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Cache size in bytes (default: 100MB)
    pub cache_size: u64,

    /// Eviction works to bring usage down to this level (default: 80)
    pub target: f64,

    /// Eviction starts above this level (default: 95)
    pub trigger: f64,
}

/// Which execution engine a query is planned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Vectorized when the query is compatible, classic otherwise
    Auto,
    Classic,
    Vectorized,
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Engine selection (default: Auto)
    pub engine: EngineMode,

    /// Maximum entries per plan cache (default: 5000)
    pub cache_capacity: usize,

    /// A trial ends once any candidate produces this many results (default: 101)
    pub max_results_per_trial: usize,

    /// Lower bound of the total trial works budget (default: 10000)
    pub min_trial_works: usize,

    /// Fraction of the collection size used as trial works budget (default: 0.3)
    pub trial_collection_fraction: f64,

    /// A cached plan needing more than this multiple of its decision works is
    /// evicted and replanned (default: 10)
    pub replan_ratio: usize,

    /// Run single solutions through the trial period so they get cached (default: false)
    pub force_multiplan: bool,

    /// Allow the express point-lookup paths (default: true)
    pub use_express: bool,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            allocation_size: 4096,
            max_handle_array: 16,
        }
    }
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            bucket: "tierdb".to_string(),
            bucket_prefix: String::new(),
            storage_source: "dir_store".to_string(),
            work_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(5),
            max_flush_attempts: 3,
        }
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            cache_size: 100 * 1024 * 1024, // 100MB
            target: 80.0,
            trigger: 95.0,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            engine: EngineMode::Auto,
            cache_capacity: 5000,
            max_results_per_trial: 101,
            min_trial_works: 10_000,
            trial_collection_fraction: 0.3,
            replan_ratio: 10,
            force_multiplan: false,
            use_express: true,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("./tierdb"),
            block: BlockConfig::default(),
            tiered: TieredConfig::default(),
            eviction: EvictionConfig::default(),
            planner: PlannerConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new config with the given home directory
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Default::default()
        }
    }

    pub fn block(mut self, config: BlockConfig) -> Self {
        self.block = config;
        self
    }

    pub fn tiered(mut self, config: TieredConfig) -> Self {
        self.tiered = config;
        self
    }

    pub fn eviction(mut self, config: EvictionConfig) -> Self {
        self.eviction = config;
        self
    }

    pub fn planner(mut self, config: PlannerConfig) -> Self {
        self.planner = config;
        self
    }

    /// Checks every section; called when a connection is opened.
    pub fn validate(&self) -> Result<()> {
        if self.block.allocation_size == 0 || !self.block.allocation_size.is_power_of_two() {
            return Err(Error::InvalidOperation(format!(
                "allocation_size must be a power of two, got {}",
                self.block.allocation_size
            )));
        }
        if self.tiered.max_flush_attempts == 0 {
            return Err(Error::InvalidOperation(
                "max_flush_attempts must be at least 1".to_string(),
            ));
        }
        self.eviction.validate()?;
        Ok(())
    }
}

impl BlockConfig {
    pub fn allocation_size(mut self, size: u64) -> Self {
        self.allocation_size = size;
        self
    }

    pub fn max_handle_array(mut self, max: usize) -> Self {
        self.max_handle_array = max;
        self
    }
}

impl TieredConfig {
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn bucket_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bucket_prefix = prefix.into();
        self
    }

    pub fn storage_source(mut self, source: impl Into<String>) -> Self {
        self.storage_source = source.into();
        self
    }

    pub fn work_interval(mut self, interval: Duration) -> Self {
        self.work_interval = interval;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn max_flush_attempts(mut self, attempts: u32) -> Self {
        self.max_flush_attempts = attempts;
        self
    }
}

impl EvictionConfig {
    pub fn cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn target(mut self, value: f64) -> Self {
        self.target = value;
        self
    }

    pub fn trigger(mut self, value: f64) -> Self {
        self.trigger = value;
        self
    }

    /// Target as a percentage of the cache size.
    pub fn target_pct(&self) -> Result<f64> {
        self.to_percentage("eviction_target", self.target)
    }

    /// Trigger as a percentage of the cache size.
    pub fn trigger_pct(&self) -> Result<f64> {
        self.to_percentage("eviction_trigger", self.trigger)
    }

    pub fn validate(&self) -> Result<()> {
        let target = self.target_pct()?;
        let trigger = self.trigger_pct()?;
        if target >= trigger {
            return Err(Error::InvalidOperation(format!(
                "eviction_target ({:.2}%) must be lower than eviction_trigger ({:.2}%)",
                target, trigger
            )));
        }
        Ok(())
    }

    fn to_percentage(&self, name: &str, value: f64) -> Result<f64> {
        if value <= 0.0 {
            return Err(Error::InvalidOperation(format!(
                "{} must be positive, got {}",
                name, value
            )));
        }
        if value <= 100.0 {
            return Ok(value);
        }
        // Anything above 100 is an absolute value.
        if value > self.cache_size as f64 {
            return Err(Error::InvalidOperation(format!(
                "{} should not exceed cache size",
                name
            )));
        }
        Ok(value * 100.0 / self.cache_size as f64)
    }
}

impl PlannerConfig {
    pub fn engine(mut self, engine: EngineMode) -> Self {
        self.engine = engine;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn max_results_per_trial(mut self, results: usize) -> Self {
        self.max_results_per_trial = results;
        self
    }

    pub fn min_trial_works(mut self, works: usize) -> Self {
        self.min_trial_works = works;
        self
    }

    pub fn replan_ratio(mut self, ratio: usize) -> Self {
        self.replan_ratio = ratio;
        self
    }

    pub fn force_multiplan(mut self, enabled: bool) -> Self {
        self.force_multiplan = enabled;
        self
    }

    pub fn use_express(mut self, enabled: bool) -> Self {
        self.use_express = enabled;
        self
    }

    /// Total works a multi-plan trial may spend across all candidates.
    pub fn trial_works_budget(&self, collection_size: usize) -> usize {
        let fraction = (collection_size as f64 * self.trial_collection_fraction) as usize;
        self.min_trial_works.max(fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.home, PathBuf::from("./tierdb"));
        assert_eq!(config.block.allocation_size, 4096);
        assert_eq!(config.tiered.bucket, "tierdb");
        assert_eq!(config.tiered.max_flush_attempts, 3);
        assert_eq!(config.planner.engine, EngineMode::Auto);
        assert_eq!(config.planner.max_results_per_trial, 101);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConnectionConfig::new("/tmp/test")
            .block(BlockConfig::default().allocation_size(512).max_handle_array(4))
            .tiered(
                TieredConfig::default()
                    .bucket("cold")
                    .bucket_prefix("pfx/")
                    .work_interval(Duration::from_millis(10))
                    .max_flush_attempts(5),
            )
            .planner(
                PlannerConfig::default()
                    .engine(EngineMode::Classic)
                    .replan_ratio(4),
            );

        assert_eq!(config.home, PathBuf::from("/tmp/test"));
        assert_eq!(config.block.allocation_size, 512);
        assert_eq!(config.block.max_handle_array, 4);
        assert_eq!(config.tiered.bucket, "cold");
        assert_eq!(config.tiered.bucket_prefix, "pfx/");
        assert_eq!(config.tiered.work_interval, Duration::from_millis(10));
        assert_eq!(config.tiered.max_flush_attempts, 5);
        assert_eq!(config.planner.engine, EngineMode::Classic);
        assert_eq!(config.planner.replan_ratio, 4);
    }

    #[test]
    fn test_allocation_size_must_be_power_of_two() {
        let config =
            ConnectionConfig::new("/tmp/x").block(BlockConfig::default().allocation_size(1000));
        assert!(matches!(config.validate(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_eviction_absolute_values_convert_to_percentages() -> Result<()> {
        let config = EvictionConfig::default()
            .cache_size(1000)
            .target(500.0)
            .trigger(900.0);
        assert_eq!(config.target_pct()?, 50.0);
        assert_eq!(config.trigger_pct()?, 90.0);
        config.validate()
    }

    #[test]
    fn test_eviction_absolute_value_above_cache_size() {
        let config = EvictionConfig::default().cache_size(1000).trigger(2000.0);
        assert!(matches!(config.validate(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_eviction_target_must_be_below_trigger() {
        let config = EvictionConfig::default().target(90.0).trigger(80.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trial_works_budget() {
        let config = PlannerConfig::default();
        assert_eq!(config.trial_works_budget(100), 10_000);
        assert_eq!(config.trial_works_budget(1_000_000), 300_000);
    }
}
