//! Shard hashing, shard mapping and spread tracking.
//!
//! A series lands on a shard by hashing its shard-key columns and its full
//! partition key:
//!
//! ```text
//! shard = (shardKeyHash & !spreadMask) | (partKeyHash & spreadMask)
//! ```
//!
//! where `spreadMask = 2^spread - 1`. All series of one shard key therefore
//! occupy a contiguous group of `2^spread` shards, and the planner can
//! enumerate that group without touching the rest of the cluster. Spread
//! may change over time; [`FunctionalSpreadProvider`] reports the change
//! points so the planner can split a query at them.

use crate::types::{ShardId, ShardStatus};
use std::fmt;

/// 32-bit FNV-1a over a byte string. Stable across platforms and releases,
/// which shard placement requires.
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Hash of the shard-key column values in column order.
pub fn shard_key_hash<S: AsRef<str>>(values: &[S]) -> u32 {
    let mut buf = Vec::with_capacity(32);
    for v in values {
        buf.extend_from_slice(v.as_ref().as_bytes());
        buf.push(0xff);
    }
    fnv1a(&buf)
}

/// Shard for one series given both hashes, the spread and the shard count.
///
/// `num_shards` must be a power of two.
pub fn shard_from_hashes(
    shard_key_hash: u32,
    part_key_hash: u32,
    spread: u8,
    num_shards: u16,
) -> ShardId {
    debug_assert!(num_shards.is_power_of_two());
    let spread_mask = (1u32 << spread) - 1;
    let combined = (shard_key_hash & !spread_mask) | (part_key_hash & spread_mask);
    (combined & (num_shards as u32 - 1)) as ShardId
}

/// All shards a shard key can occupy at the given spread.
pub fn shards_for_shard_key(shard_key_hash: u32, spread: u8, num_shards: u16) -> Vec<ShardId> {
    let spread_mask = (1u32 << spread) - 1;
    let base = (shard_key_hash & !spread_mask) & (num_shards as u32 - 1);
    (0..(1u32 << spread))
        .map(|i| (base | i) as ShardId)
        .collect()
}

/// Cluster view of shard assignment, injected into each planner.
///
/// The mapper itself is maintained outside the core; planners only read
/// statuses and node assignments from it.
pub trait ShardMapper: Send + Sync {
    /// Total shards in the dataset. Always a power of two.
    fn num_shards(&self) -> u16;

    /// Status of one shard.
    fn status_for_shard(&self, shard: ShardId) -> ShardStatus;

    /// Shards owned by the given node.
    fn shards_for_node(&self, node: &str) -> Vec<ShardId>;

    /// Every shard currently in a queryable state.
    fn queryable_shards(&self) -> Vec<ShardId> {
        (0..self.num_shards())
            .filter(|s| self.status_for_shard(*s).queryable())
            .collect()
    }
}

/// Static shard mapper backed by a lookup table. The production mapper is
/// fed by cluster membership events; this one is built directly and serves
/// tests and single-process deployments.
#[derive(Debug, Clone)]
pub struct LookupShardMapper {
    statuses: Vec<ShardStatus>,
    node_assignments: Vec<String>,
}

impl LookupShardMapper {
    /// Mapper with every shard Active and owned by `node`.
    pub fn all_active(num_shards: u16, node: &str) -> Self {
        Self {
            statuses: vec![ShardStatus::Active; num_shards as usize],
            node_assignments: vec![node.to_string(); num_shards as usize],
        }
    }

    /// Override the status of one shard.
    pub fn set_status(&mut self, shard: ShardId, status: ShardStatus) {
        self.statuses[shard as usize] = status;
    }

    /// Reassign one shard to a node.
    pub fn set_node(&mut self, shard: ShardId, node: &str) {
        self.node_assignments[shard as usize] = node.to_string();
    }
}

impl ShardMapper for LookupShardMapper {
    fn num_shards(&self) -> u16 {
        self.statuses.len() as u16
    }

    fn status_for_shard(&self, shard: ShardId) -> ShardStatus {
        self.statuses
            .get(shard as usize)
            .copied()
            .unwrap_or(ShardStatus::Unassigned)
    }

    fn shards_for_node(&self, node: &str) -> Vec<ShardId> {
        self.node_assignments
            .iter()
            .enumerate()
            .filter(|(_, n)| n.as_str() == node)
            .map(|(i, _)| i as ShardId)
            .collect()
    }
}

/// A spread value taking effect at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpreadChange {
    /// Epoch ms at which the new spread applies.
    pub at_ms: i64,
    /// The spread from that point on.
    pub spread: u8,
}

impl fmt::Display for SpreadChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spread={} from {}", self.spread, self.at_ms)
    }
}

/// Source of spread values over time for a shard-key class.
pub trait SpreadProvider: Send + Sync {
    /// Spread in effect at `at_ms`.
    fn spread_at(&self, at_ms: i64) -> u8;

    /// Change points strictly inside `(start_ms, end_ms]`, ascending.
    fn changes_in(&self, start_ms: i64, end_ms: i64) -> Vec<SpreadChange>;
}

/// Spread provider over an explicit, time-ordered change list.
#[derive(Debug, Clone)]
pub struct FunctionalSpreadProvider {
    default_spread: u8,
    changes: Vec<SpreadChange>,
}

impl FunctionalSpreadProvider {
    /// Constant spread, no changes.
    pub fn constant(spread: u8) -> Self {
        Self {
            default_spread: spread,
            changes: Vec::new(),
        }
    }

    /// Provider with explicit change points. `changes` must be ascending
    /// by time.
    pub fn with_changes(default_spread: u8, changes: Vec<SpreadChange>) -> Self {
        debug_assert!(changes.windows(2).all(|w| w[0].at_ms < w[1].at_ms));
        Self {
            default_spread,
            changes,
        }
    }
}

impl SpreadProvider for FunctionalSpreadProvider {
    fn spread_at(&self, at_ms: i64) -> u8 {
        self.changes
            .iter()
            .rev()
            .find(|c| c.at_ms <= at_ms)
            .map(|c| c.spread)
            .unwrap_or(self.default_spread)
    }

    fn changes_in(&self, start_ms: i64, end_ms: i64) -> Vec<SpreadChange> {
        self.changes
            .iter()
            .filter(|c| c.at_ms > start_ms && c.at_ms <= end_ms)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vector() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_ne!(fnv1a(b"a"), fnv1a(b"b"));
    }

    #[test]
    fn test_shard_group_is_contiguous() {
        let h = shard_key_hash(&["demo", "localNs", "foo"]);
        let shards = shards_for_shard_key(h, 2, 32);
        assert_eq!(shards.len(), 4);
        for w in shards.windows(2) {
            assert_eq!(w[1], w[0] + 1);
        }
    }

    #[test]
    fn test_shard_from_hashes_lands_in_group() {
        let skh = shard_key_hash(&["demo", "localNs", "foo"]);
        let group = shards_for_shard_key(skh, 3, 64);
        for part_hash in [0u32, 17, 12345, u32::MAX] {
            let shard = shard_from_hashes(skh, part_hash, 3, 64);
            assert!(group.contains(&shard));
        }
    }

    #[test]
    fn test_spread_provider_changes() {
        let provider = FunctionalSpreadProvider::with_changes(
            1,
            vec![SpreadChange {
                at_ms: 1000,
                spread: 2,
            }],
        );
        assert_eq!(provider.spread_at(999), 1);
        assert_eq!(provider.spread_at(1000), 2);
        assert_eq!(provider.changes_in(0, 5000).len(), 1);
        assert!(provider.changes_in(1000, 5000).is_empty());
    }

    #[test]
    fn test_lookup_mapper_statuses() {
        let mut mapper = LookupShardMapper::all_active(4, "node-a");
        mapper.set_status(2, ShardStatus::Recovery);
        assert_eq!(mapper.queryable_shards(), vec![0, 1, 3]);
        assert_eq!(mapper.shards_for_node("node-a").len(), 4);
    }
}
