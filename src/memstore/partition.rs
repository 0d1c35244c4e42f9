//! Shard-local partition: the chunked, append-only sample container for
//! one series.
//!
//! A partition owns an ordered list of immutable, sealed chunks plus a
//! single mutable write chunk at the tail. The sealed list is swapped as a
//! whole (`Arc<Vec<Arc<Chunk>>>`), so scans snapshot it with one atomic
//! clone and never observe a half-sealed state. The write chunk sits
//! behind its own short-lived lock; a scan copies the in-range rows out
//! rather than holding the lock while streaming.
//!
//! Invariants:
//! - timestamps strictly increase within a chunk
//! - chunk time ranges are non-overlapping and ascending
//! - only the shard's single ingest task calls [`TimeSeriesPartition::append`]

use crate::config::StoreConfig;
use crate::types::{LabelSet, PartId, PartKey, TimeRange};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Sequence number of a chunk within its partition.
pub type ChunkId = u32;

/// An immutable, sealed run of samples.
#[derive(Debug)]
pub struct Chunk {
    /// Chunk sequence number.
    pub id: ChunkId,
    /// Sample timestamps, strictly ascending, epoch ms.
    pub timestamps: Vec<i64>,
    /// Sample values, parallel to `timestamps`.
    pub values: Vec<f64>,
}

impl Chunk {
    /// First timestamp in the chunk.
    #[inline]
    pub fn first_ts(&self) -> i64 {
        self.timestamps[0]
    }

    /// Last timestamp in the chunk.
    #[inline]
    pub fn last_ts(&self) -> i64 {
        self.timestamps[self.timestamps.len() - 1]
    }

    /// Number of samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the chunk holds no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Copy rows inside `range` into `out`.
    fn copy_range_into(&self, range: &TimeRange, out: &mut Vec<(i64, f64)>) {
        let start = self.timestamps.partition_point(|&t| t < range.start_ms);
        for i in start..self.timestamps.len() {
            let t = self.timestamps[i];
            if t > range.end_ms {
                break;
            }
            out.push((t, self.values[i]));
        }
    }
}

/// The mutable chunk at the tail of a partition.
#[derive(Debug)]
struct WriteChunk {
    id: ChunkId,
    timestamps: Vec<i64>,
    values: Vec<f64>,
}

impl WriteChunk {
    fn new(id: ChunkId, capacity: usize) -> Self {
        Self {
            id,
            timestamps: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    fn last_ts(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }

    fn first_ts(&self) -> Option<i64> {
        self.timestamps.first().copied()
    }

    fn seal(&mut self, next_id: ChunkId, capacity: usize) -> Chunk {
        let sealed = Chunk {
            id: self.id,
            timestamps: std::mem::take(&mut self.timestamps),
            values: std::mem::take(&mut self.values),
        };
        *self = WriteChunk::new(next_id, capacity);
        sealed
    }
}

/// Outcome of appending one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Sample accepted.
    Appended,
    /// Sample at or before the write chunk's last timestamp, dropped.
    DroppedOutOfOrder,
}

/// Shard-local container for all chunks of one part key.
pub struct TimeSeriesPartition {
    part_id: PartId,
    part_key: PartKey,
    labels: LabelSet,
    schema: String,
    /// Sealed chunks, swapped as a whole on seal.
    sealed: RwLock<Arc<Vec<Arc<Chunk>>>>,
    write: RwLock<WriteChunk>,
    /// Last ingest wall time, drives LRU eviction.
    last_ingest_ms: AtomicI64,
}

impl TimeSeriesPartition {
    /// Create an empty partition for a series.
    pub fn new(part_id: PartId, labels: LabelSet, schema: String, config: &StoreConfig) -> Self {
        let part_key = PartKey::encode(&labels);
        Self {
            part_id,
            part_key,
            labels,
            schema,
            sealed: RwLock::new(Arc::new(Vec::new())),
            write: RwLock::new(WriteChunk::new(0, config.max_chunk_size)),
            last_ingest_ms: AtomicI64::new(0),
        }
    }

    /// Partition handle within the shard.
    pub fn part_id(&self) -> PartId {
        self.part_id
    }

    /// Canonical series identity.
    pub fn part_key(&self) -> &PartKey {
        &self.part_key
    }

    /// Decoded labels of the series.
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Name of the data schema the samples follow.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Wall time of the last accepted sample, for LRU eviction.
    pub fn last_ingest_ms(&self) -> i64 {
        self.last_ingest_ms.load(Ordering::Relaxed)
    }

    /// Append one sample. Samples at or before the write chunk's last
    /// timestamp are dropped; the caller counts them.
    ///
    /// Must only be called from the shard's ingest task.
    pub fn append(&self, ts: i64, value: f64, config: &StoreConfig, now_ms: i64) -> AppendResult {
        let mut write = self.write.write();

        if let Some(last) = write.last_ts() {
            if ts <= last {
                return AppendResult::DroppedOutOfOrder;
            }
            let duration_ms = config.chunk_duration.as_millis() as i64;
            let full = write.timestamps.len() >= config.max_chunk_size
                || ts - write.first_ts().unwrap_or(ts) >= duration_ms;
            if full {
                let next_id = write.id + 1;
                let sealed_chunk = Arc::new(write.seal(next_id, config.max_chunk_size));
                let mut sealed = self.sealed.write();
                let mut list = Vec::with_capacity(sealed.len() + 1);
                list.extend(sealed.iter().cloned());
                list.push(sealed_chunk);
                *sealed = Arc::new(list);
            }
        }

        write.timestamps.push(ts);
        write.values.push(value);
        self.last_ingest_ms.store(now_ms, Ordering::Relaxed);
        AppendResult::Appended
    }

    /// Earliest timestamp held, across sealed chunks and the write chunk.
    pub fn min_ts(&self) -> Option<i64> {
        let sealed = self.sealed.read().clone();
        sealed
            .first()
            .map(|c| c.first_ts())
            .or_else(|| self.write.read().first_ts())
    }

    /// Latest timestamp held.
    pub fn max_ts(&self) -> Option<i64> {
        self.write
            .read()
            .last_ts()
            .or_else(|| self.sealed.read().last().map(|c| c.last_ts()))
    }

    /// Whether any chunk of this partition intersects `range`.
    pub fn intersects(&self, range: &TimeRange) -> bool {
        match (self.min_ts(), self.max_ts()) {
            (Some(min), Some(max)) => TimeRange::new(min, max).overlaps(range),
            _ => false,
        }
    }

    /// Copy every row inside `range` out of the partition, in timestamp
    /// order. Sealed chunks are read from a snapshot; the write chunk is
    /// copied under a short read lock.
    pub fn read_rows(&self, range: &TimeRange) -> Vec<(i64, f64)> {
        let sealed = self.sealed.read().clone();
        let mut rows = Vec::new();
        for chunk in sealed.iter() {
            if chunk.is_empty() || chunk.last_ts() < range.start_ms {
                continue;
            }
            if chunk.first_ts() > range.end_ms {
                break;
            }
            chunk.copy_range_into(range, &mut rows);
        }
        {
            let write = self.write.read();
            let start = write.timestamps.partition_point(|&t| t < range.start_ms);
            for i in start..write.timestamps.len() {
                let t = write.timestamps[i];
                if t > range.end_ms {
                    break;
                }
                rows.push((t, write.values[i]));
            }
        }
        rows
    }

    /// Drop sealed chunks wholly before `earliest_ms`. Returns how many
    /// chunks were evicted.
    pub fn drop_chunks_before(&self, earliest_ms: i64) -> usize {
        let mut sealed = self.sealed.write();
        let keep: Vec<Arc<Chunk>> = sealed
            .iter()
            .filter(|c| c.last_ts() >= earliest_ms)
            .cloned()
            .collect();
        let dropped = sealed.len() - keep.len();
        if dropped > 0 {
            *sealed = Arc::new(keep);
        }
        dropped
    }

    /// Total samples currently held.
    pub fn num_samples(&self) -> usize {
        let sealed = self.sealed.read().clone();
        let sealed_count: usize = sealed.iter().map(|c| c.len()).sum();
        sealed_count + self.write.read().timestamps.len()
    }

    /// Number of sealed chunks plus the write chunk if non-empty.
    pub fn num_chunks(&self) -> usize {
        let sealed = self.sealed.read().len();
        let write_nonempty = !self.write.read().timestamps.is_empty() as usize;
        sealed + write_nonempty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(max_chunk: usize) -> StoreConfig {
        StoreConfig {
            max_chunk_size: max_chunk,
            chunk_duration: Duration::from_secs(3600),
            ..StoreConfig::default()
        }
    }

    fn test_partition(config: &StoreConfig) -> TimeSeriesPartition {
        let mut labels = LabelSet::new();
        labels.insert("_metric_".into(), "cpu".into());
        TimeSeriesPartition::new(0, labels, "gauge".into(), config)
    }

    #[test]
    fn test_append_and_read_back() {
        let config = test_config(100);
        let part = test_partition(&config);
        for i in 0..50 {
            assert_eq!(
                part.append(i * 10, i as f64, &config, 0),
                AppendResult::Appended
            );
        }
        let rows = part.read_rows(&TimeRange::new(100, 200));
        assert_eq!(rows.len(), 11);
        assert_eq!(rows[0], (100, 10.0));
        assert_eq!(rows[10], (200, 20.0));
    }

    #[test]
    fn test_out_of_order_sample_dropped() {
        let config = test_config(100);
        let part = test_partition(&config);
        part.append(100, 1.0, &config, 0);
        assert_eq!(
            part.append(100, 2.0, &config, 0),
            AppendResult::DroppedOutOfOrder
        );
        assert_eq!(
            part.append(50, 3.0, &config, 0),
            AppendResult::DroppedOutOfOrder
        );
        assert_eq!(part.num_samples(), 1);
    }

    #[test]
    fn test_chunk_seals_at_max_size() {
        let config = test_config(10);
        let part = test_partition(&config);
        for i in 0..25 {
            part.append(i, i as f64, &config, 0);
        }
        // 25 samples with chunks of 10: two sealed chunks plus a write chunk.
        assert_eq!(part.num_chunks(), 3);
        assert_eq!(part.num_samples(), 25);

        // Rows still come back in order across the chunk boundary.
        let rows = part.read_rows(&TimeRange::new(0, 24));
        assert_eq!(rows.len(), 25);
        assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_chunk_seals_at_duration() {
        let mut config = test_config(1_000_000);
        config.chunk_duration = Duration::from_millis(100);
        let part = test_partition(&config);
        part.append(0, 0.0, &config, 0);
        part.append(50, 1.0, &config, 0);
        part.append(150, 2.0, &config, 0);
        assert_eq!(part.num_chunks(), 2);
    }

    #[test]
    fn test_retention_drop() {
        let config = test_config(5);
        let part = test_partition(&config);
        for i in 0..20 {
            part.append(i * 10, i as f64, &config, 0);
        }
        let dropped = part.drop_chunks_before(100);
        assert!(dropped > 0);
        assert!(part.min_ts().unwrap() >= 50);
    }

    #[test]
    fn test_min_max_span_sealed_and_write() {
        let config = test_config(4);
        let part = test_partition(&config);
        for i in 1..=10 {
            part.append(i * 100, 0.0, &config, 0);
        }
        assert_eq!(part.min_ts(), Some(100));
        assert_eq!(part.max_ts(), Some(1000));
    }
}
