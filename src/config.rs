//! Store and query configuration.
//!
//! Two families of knobs live here: per-tier store settings (chunk sizing,
//! retention, eviction) and runtime settings for query execution
//! (scheduler pool, staleness lookback, fan-out bounds).

use std::sync::Arc;
use std::time::Duration;

/// Retention tier a planner or store instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Most recent samples at full resolution.
    Raw,
    /// Rolled-up samples with a longer horizon.
    Downsample,
    /// Pre-aggregated recording-rule output.
    RecordingRules,
}

impl Tier {
    /// Display name used in plan trees and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Downsample => "downsample",
            Tier::RecordingRules => "recording-rules",
        }
    }
}

/// Callback producing the earliest timestamp a tier still retains.
///
/// Retention moves with the wall clock, so the store and planners take a
/// function instead of a fixed timestamp.
pub type RetentionFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Eviction policy for shard-local partitions.
///
/// The only built-in policy caps the partition count and evicts the least
/// recently ingested partitions once the cap would be exceeded.
#[derive(Debug, Clone)]
pub struct FixedMaxPartitionsEvictionPolicy {
    /// Hard cap on partitions per shard.
    pub max_partitions: usize,
}

impl FixedMaxPartitionsEvictionPolicy {
    /// Policy with the given cap.
    pub fn new(max_partitions: usize) -> Self {
        Self { max_partitions }
    }

    /// How many partitions must be evicted before admitting `incoming`
    /// new partitions.
    pub fn num_to_evict(&self, current: usize, incoming: usize) -> usize {
        (current + incoming).saturating_sub(self.max_partitions)
    }
}

/// Per-shard store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Seal the write chunk at this many samples.
    pub max_chunk_size: usize,
    /// Seal the write chunk once it spans this much time.
    pub chunk_duration: Duration,
    /// Soft budget for shard memory, bytes. Informational; eviction is
    /// driven by the partition cap.
    pub shard_mem_size: usize,
    /// Partition eviction policy.
    pub eviction_policy: FixedMaxPartitionsEvictionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 400,
            chunk_duration: Duration::from_secs(2 * 60 * 60),
            shard_mem_size: 256 * 1024 * 1024,
            eviction_policy: FixedMaxPartitionsEvictionPolicy::new(1_000_000),
        }
    }
}

/// Worker pool bounds for the query scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Core pool size.
    pub pool_size: usize,
    /// Upper bound on concurrent plan dispatches.
    pub max_pool_size: usize,
    /// Queued dispatches beyond the pool before callers are rejected.
    pub queue_length: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cores = num_cpus::get();
        Self {
            pool_size: cores,
            max_pool_size: cores * 2,
            queue_length: 1024,
        }
    }
}

/// Runtime settings for query planning and execution.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How far an instant selector looks back for the latest sample.
    pub stale_sample_after: Duration,
    /// Bound on shards a single leaf fan-out may touch.
    pub max_shards_per_query: usize,
    /// Candidate-shard count above which aggregation gets a second,
    /// per-node reduce level.
    pub reduce_shards_per_node: usize,
    /// Maximum subquery nesting depth before the query is rejected.
    pub max_subquery_depth: usize,
    /// Scheduler bounds.
    pub scheduler: SchedulerConfig,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_sample_after: Duration::from_secs(5 * 60),
            max_shards_per_query: 256,
            reduce_shards_per_node: 32,
            max_subquery_depth: 4,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl QueryConfig {
    /// Staleness lookback in milliseconds.
    pub fn stale_lookback_ms(&self) -> i64 {
        self.stale_sample_after.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_counts() {
        let policy = FixedMaxPartitionsEvictionPolicy::new(10);
        assert_eq!(policy.num_to_evict(10, 1), 1);
        assert_eq!(policy.num_to_evict(5, 1), 0);
        assert_eq!(policy.num_to_evict(10, 5), 5);
    }

    #[test]
    fn test_default_lookback_is_five_minutes() {
        assert_eq!(QueryConfig::default().stale_lookback_ms(), 300_000);
    }
}
