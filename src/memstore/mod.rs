//! In-memory time-series store.
//!
//! [`TimeSeriesMemStore`] owns one [`TimeSeriesShard`] per `(dataset,
//! shard)` pair it was set up for. Each shard holds the partitions of its
//! series, an inverted label index over their part keys, and ingest
//! bookkeeping. Scans are read-only and run concurrently with ingest;
//! ingest is single-writer per shard.
//!
//! ```text
//! TimeSeriesMemStore
//!   └── (dataset, shard) ──► TimeSeriesShard
//!                               ├── PartKeyIndex   (label -> parts)
//!                               ├── partitions     (PartId -> chunks)
//!                               └── ShardIngestStats
//! ```

pub mod index;
pub mod partition;

pub use index::PartKeyIndex;
pub use partition::{AppendResult, Chunk, TimeSeriesPartition};

use crate::config::{RetentionFn, StoreConfig};
use crate::error::{QueryError, StoreError};
use crate::query::filter::ColumnFilter;
use crate::types::{
    ChunkScanMethod, DatasetRef, LabelSet, PartId, PartKey, SampleRecord, Schema, ShardId,
    METRIC_COLUMN, PROM_METRIC_LABEL,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Snapshot of one shard's ingest counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardIngestStats {
    /// Samples accepted.
    pub ingested: u64,
    /// Samples dropped for arriving at or before the write chunk tail.
    pub dropped_out_of_order: u64,
    /// Samples skipped for per-sample errors (unknown schema).
    pub skipped_errors: u64,
    /// Partitions evicted by the partition cap.
    pub evicted_partitions: u64,
}

#[derive(Default)]
struct IngestCounters {
    ingested: AtomicU64,
    dropped_out_of_order: AtomicU64,
    skipped_errors: AtomicU64,
    evicted_partitions: AtomicU64,
}

impl IngestCounters {
    fn snapshot(&self) -> ShardIngestStats {
        ShardIngestStats {
            ingested: self.ingested.load(Ordering::Relaxed),
            dropped_out_of_order: self.dropped_out_of_order.load(Ordering::Relaxed),
            skipped_errors: self.skipped_errors.load(Ordering::Relaxed),
            evicted_partitions: self.evicted_partitions.load(Ordering::Relaxed),
        }
    }
}

/// One row of a label-values response: the requested label names mapped to
/// the values one matching series carries.
pub type LabelValueRow = BTreeMap<String, String>;

/// All state for one shard of one dataset.
pub struct TimeSeriesShard {
    dataset: DatasetRef,
    shard: ShardId,
    config: StoreConfig,
    schemas: Vec<Schema>,
    metric_column: String,
    partitions: RwLock<HashMap<PartId, Arc<TimeSeriesPartition>>>,
    by_part_key: RwLock<HashMap<PartKey, PartId>>,
    index: PartKeyIndex,
    next_part_id: AtomicU32,
    counters: IngestCounters,
}

impl TimeSeriesShard {
    fn new(dataset: DatasetRef, shard: ShardId, schemas: Vec<Schema>, config: StoreConfig) -> Self {
        Self {
            dataset,
            shard,
            config,
            schemas,
            metric_column: METRIC_COLUMN.to_string(),
            partitions: RwLock::new(HashMap::new()),
            by_part_key: RwLock::new(HashMap::new()),
            index: PartKeyIndex::new(),
            next_part_id: AtomicU32::new(0),
            counters: IngestCounters::default(),
        }
    }

    /// Canonicalize incoming labels: `__name__` moves to the metric column.
    fn canonicalize(&self, mut labels: LabelSet) -> LabelSet {
        if let Some(metric) = labels.remove(PROM_METRIC_LABEL) {
            labels.insert(self.metric_column.clone(), metric);
        }
        labels
    }

    fn ingest_record(&self, record: SampleRecord, now_ms: i64) -> Result<(), StoreError> {
        if !self.schemas.iter().any(|s| s.name == record.schema) {
            return Err(StoreError::UnknownSchema(record.schema));
        }
        let labels = self.canonicalize(record.labels);
        let part_key = PartKey::encode(&labels);

        let part = {
            let existing = self.by_part_key.read().get(&part_key).copied();
            match existing {
                Some(part_id) => self.partitions.read().get(&part_id).cloned(),
                None => None,
            }
        };

        let part = match part {
            Some(p) => p,
            None => self.create_partition(part_key, labels, record.schema),
        };

        match part.append(record.timestamp_ms, record.value, &self.config, now_ms) {
            AppendResult::Appended => {
                self.counters.ingested.fetch_add(1, Ordering::Relaxed);
            }
            AppendResult::DroppedOutOfOrder => {
                self.counters
                    .dropped_out_of_order
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn create_partition(
        &self,
        part_key: PartKey,
        labels: LabelSet,
        schema: String,
    ) -> Arc<TimeSeriesPartition> {
        self.maybe_evict(1);
        let part_id = self.next_part_id.fetch_add(1, Ordering::Relaxed);
        let part = Arc::new(TimeSeriesPartition::new(
            part_id,
            labels.clone(),
            schema,
            &self.config,
        ));
        self.partitions.write().insert(part_id, Arc::clone(&part));
        self.by_part_key.write().insert(part_key, part_id);
        self.index.add_part(part_id, labels);
        part
    }

    /// Evict least-recently-ingested partitions until `incoming` new ones
    /// fit under the cap. Holds the partition write lock only while
    /// removing the chosen victims.
    fn maybe_evict(&self, incoming: usize) {
        let current = self.partitions.read().len();
        let to_evict = self
            .config
            .eviction_policy
            .num_to_evict(current, incoming);
        if to_evict == 0 {
            return;
        }

        let mut by_ingest: Vec<(i64, PartId)> = self
            .partitions
            .read()
            .values()
            .map(|p| (p.last_ingest_ms(), p.part_id()))
            .collect();
        by_ingest.sort_unstable();

        let victims: Vec<PartId> = by_ingest.iter().take(to_evict).map(|(_, id)| *id).collect();
        let mut partitions = self.partitions.write();
        let mut by_key = self.by_part_key.write();
        for part_id in victims {
            if let Some(part) = partitions.remove(&part_id) {
                by_key.remove(part.part_key());
                self.index.remove_part(part_id, part.labels().clone());
                self.counters
                    .evicted_partitions
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    dataset = %self.dataset,
                    shard = self.shard,
                    part_id,
                    "evicted partition under the partition cap"
                );
            }
        }
    }

    fn matching_parts(
        &self,
        filters: &[ColumnFilter],
        method: ChunkScanMethod,
    ) -> Result<Vec<Arc<TimeSeriesPartition>>, QueryError> {
        // New series become visible no later than the next scan.
        self.index.refresh();
        let ids = self.index.lookup(filters)?;
        let range = method.time_range();
        let partitions = self.partitions.read();
        Ok(ids
            .iter()
            .filter_map(|id| partitions.get(id).cloned())
            .filter(|p| p.intersects(&range))
            .collect())
    }

    /// Ingest counters snapshot.
    pub fn ingest_stats(&self) -> ShardIngestStats {
        self.counters.snapshot()
    }
}

/// Shard-sharded, in-memory sample store serving the raw tier.
pub struct TimeSeriesMemStore {
    shards: DashMap<(DatasetRef, ShardId), Arc<TimeSeriesShard>>,
    /// Earliest timestamp this tier still retains, as a wall-clock
    /// function. Scans clip below it.
    earliest_retained_fn: RetentionFn,
}

impl TimeSeriesMemStore {
    /// Store with unbounded retention.
    pub fn new() -> Self {
        Self::with_retention(Arc::new(|| i64::MIN))
    }

    /// Store with the given retention horizon.
    pub fn with_retention(earliest_retained_fn: RetentionFn) -> Self {
        Self {
            shards: DashMap::new(),
            earliest_retained_fn,
        }
    }

    /// Register a shard. Idempotence is rejected explicitly: setting up
    /// the same `(dataset, shard)` twice is a [`StoreError::ShardAlreadySetup`].
    pub fn setup(
        &self,
        dataset: &DatasetRef,
        schemas: &[Schema],
        shard: ShardId,
        config: StoreConfig,
    ) -> Result<(), StoreError> {
        let key = (dataset.clone(), shard);
        if self.shards.contains_key(&key) {
            return Err(StoreError::ShardAlreadySetup {
                dataset: dataset.0.clone(),
                shard,
            });
        }
        self.shards.insert(
            key,
            Arc::new(TimeSeriesShard::new(
                dataset.clone(),
                shard,
                schemas.to_vec(),
                config,
            )),
        );
        debug!(dataset = %dataset, shard, "shard set up");
        Ok(())
    }

    fn shard(
        &self,
        dataset: &DatasetRef,
        shard: ShardId,
    ) -> Result<Arc<TimeSeriesShard>, StoreError> {
        self.shards
            .get(&(dataset.clone(), shard))
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| StoreError::ShardNotSetup {
                dataset: dataset.0.clone(),
                shard,
            })
    }

    /// Append a batch of samples to the targeted shard. Per-sample errors
    /// are counted and skipped; the returned stats snapshot reflects the
    /// shard after the batch.
    pub fn ingest(
        &self,
        dataset: &DatasetRef,
        shard: ShardId,
        batch: Vec<SampleRecord>,
        now_ms: i64,
    ) -> Result<ShardIngestStats, StoreError> {
        let shard = self.shard(dataset, shard)?;
        for record in batch {
            if let Err(err) = shard.ingest_record(record, now_ms) {
                shard.counters.skipped_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%err, "skipping sample");
            }
        }
        Ok(shard.ingest_stats())
    }

    /// Flush buffered index updates for every shard of a dataset.
    pub fn refresh_index(&self, dataset: &DatasetRef) {
        for entry in self.shards.iter() {
            if &entry.key().0 == dataset {
                entry.value().index.refresh();
            }
        }
    }

    /// Partitions matching `filters` whose chunk range intersects the scan
    /// window. The scan window is clipped below the retention horizon.
    pub fn scan_partitions(
        &self,
        dataset: &DatasetRef,
        shard: ShardId,
        filters: &[ColumnFilter],
        method: ChunkScanMethod,
    ) -> Result<Vec<Arc<TimeSeriesPartition>>, QueryError> {
        let shard = self.shard(dataset, shard)?;
        shard.matching_parts(filters, self.clip_to_retention(method))
    }

    /// The scan window with its start clipped to the retention horizon, so
    /// lookback buffering can never surface evictable samples.
    pub fn clip_to_retention(&self, method: ChunkScanMethod) -> ChunkScanMethod {
        let earliest = (self.earliest_retained_fn)();
        match method {
            ChunkScanMethod::All if earliest == i64::MIN => ChunkScanMethod::All,
            other => {
                let range = other.time_range();
                ChunkScanMethod::TimeRange(crate::types::TimeRange::new(
                    range.start_ms.max(earliest),
                    range.end_ms,
                ))
            }
        }
    }

    /// Distinct combinations of the requested label names among matching
    /// series, bounded by `[start_ms, end_ms]`.
    pub fn label_values(
        &self,
        dataset: &DatasetRef,
        shard: ShardId,
        filters: &[ColumnFilter],
        label_names: &[String],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<LabelValueRow>, QueryError> {
        let shard = self.shard(dataset, shard)?;
        let method = ChunkScanMethod::TimeRange(crate::types::TimeRange::new(start_ms, end_ms));
        let parts = shard.matching_parts(filters, method)?;
        let mut seen: BTreeSet<LabelValueRow> = BTreeSet::new();
        for part in parts {
            let mut row = LabelValueRow::new();
            for name in label_names {
                if let Some(value) = part.labels().get(name) {
                    row.insert(name.clone(), value.clone());
                }
            }
            if !row.is_empty() {
                seen.insert(row);
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Distinct label names among matching series.
    pub fn label_names(
        &self,
        dataset: &DatasetRef,
        shard: ShardId,
        filters: &[ColumnFilter],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<BTreeSet<String>, QueryError> {
        let shard = self.shard(dataset, shard)?;
        let method = ChunkScanMethod::TimeRange(crate::types::TimeRange::new(start_ms, end_ms));
        let parts = shard.matching_parts(filters, method)?;
        let mut names = BTreeSet::new();
        for part in parts {
            names.extend(part.labels().keys().cloned());
        }
        Ok(names)
    }

    /// Part keys (full label sets) of matching series.
    pub fn part_keys(
        &self,
        dataset: &DatasetRef,
        shard: ShardId,
        filters: &[ColumnFilter],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<LabelSet>, QueryError> {
        let shard = self.shard(dataset, shard)?;
        let method = ChunkScanMethod::TimeRange(crate::types::TimeRange::new(start_ms, end_ms));
        let parts = shard.matching_parts(filters, method)?;
        Ok(parts.iter().map(|p| p.labels().clone()).collect())
    }

    /// Distinct value count per label name among matching series.
    pub fn label_cardinality(
        &self,
        dataset: &DatasetRef,
        shard: ShardId,
        filters: &[ColumnFilter],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<BTreeMap<String, usize>, QueryError> {
        let shard = self.shard(dataset, shard)?;
        let method = ChunkScanMethod::TimeRange(crate::types::TimeRange::new(start_ms, end_ms));
        let parts = shard.matching_parts(filters, method)?;
        let mut values_per_label: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
        for part in &parts {
            for (name, value) in part.labels() {
                values_per_label
                    .entry(name.clone())
                    .or_default()
                    .insert(value.as_str());
            }
        }
        Ok(values_per_label
            .into_iter()
            .map(|(name, values)| (name, values.len()))
            .collect())
    }

    /// Top-k metric names by series count under a shard-key prefix,
    /// descending. `include_inactive` also counts partitions whose chunks
    /// no longer intersect retention.
    pub fn topk_cardinality(
        &self,
        dataset: &DatasetRef,
        shard: ShardId,
        shard_key_prefix: &[String],
        k: usize,
        include_inactive: bool,
    ) -> Result<Vec<(String, usize)>, QueryError> {
        let shard_handle = self.shard(dataset, shard)?;
        shard_handle.index.refresh();
        let earliest = (self.earliest_retained_fn)();

        let shard_key_columns = [
            crate::types::WS_COLUMN,
            crate::types::NS_COLUMN,
            METRIC_COLUMN,
        ];
        let mut counts: HashMap<String, usize> = HashMap::new();
        for part in shard_handle.partitions.read().values() {
            let labels = part.labels();
            let prefix_matches = shard_key_prefix
                .iter()
                .zip(shard_key_columns.iter())
                .all(|(want, column)| labels.get(*column).map(String::as_str) == Some(want));
            if !prefix_matches {
                continue;
            }
            if !include_inactive && part.max_ts().map(|t| t < earliest).unwrap_or(true) {
                continue;
            }
            if let Some(metric) = labels.get(METRIC_COLUMN) {
                *counts.entry(metric.clone()).or_default() += 1;
            }
        }

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(k);
        Ok(ranked)
    }

    /// Ingest counters for one shard.
    pub fn ingest_stats(
        &self,
        dataset: &DatasetRef,
        shard: ShardId,
    ) -> Result<ShardIngestStats, StoreError> {
        Ok(self.shard(dataset, shard)?.ingest_stats())
    }

    /// Drop all shards of a dataset.
    pub fn shutdown(&self, dataset: &DatasetRef) {
        self.shards.retain(|(ds, _), _| ds != dataset);
    }
}

impl Default for TimeSeriesMemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FixedMaxPartitionsEvictionPolicy;
    use crate::types::TimeRange;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample(labels: LabelSet, ts: i64, value: f64) -> SampleRecord {
        SampleRecord {
            labels,
            timestamp_ms: ts,
            value,
            schema: "gauge".into(),
        }
    }

    fn setup_store() -> (TimeSeriesMemStore, DatasetRef) {
        let store = TimeSeriesMemStore::new();
        let dataset = DatasetRef::new("prometheus");
        store
            .setup(&dataset, &[Schema::gauge()], 0, StoreConfig::default())
            .unwrap();
        (store, dataset)
    }

    #[test]
    fn test_setup_twice_fails() {
        let (store, dataset) = setup_store();
        let err = store
            .setup(&dataset, &[Schema::gauge()], 0, StoreConfig::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::ShardAlreadySetup { shard: 0, .. }));
        // A different shard is fine.
        store
            .setup(&dataset, &[Schema::gauge()], 1, StoreConfig::default())
            .unwrap();
    }

    #[test]
    fn test_ingest_and_scan() {
        let (store, dataset) = setup_store();
        let series = labels(&[("__name__", "cpu"), ("host", "a")]);
        let batch: Vec<_> = (0..10).map(|i| sample(series.clone(), i * 10, i as f64)).collect();
        store.ingest(&dataset, 0, batch, 0).unwrap();

        let parts = store
            .scan_partitions(
                &dataset,
                0,
                &[ColumnFilter::equals(METRIC_COLUMN, "cpu")],
                ChunkScanMethod::TimeRange(TimeRange::new(0, 100)),
            )
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].read_rows(&TimeRange::new(0, 100)).len(), 10);
    }

    #[test]
    fn test_scan_prunes_disjoint_time_range() {
        let (store, dataset) = setup_store();
        let series = labels(&[("__name__", "cpu")]);
        store
            .ingest(&dataset, 0, vec![sample(series, 1000, 1.0)], 0)
            .unwrap();
        let parts = store
            .scan_partitions(
                &dataset,
                0,
                &[ColumnFilter::equals(METRIC_COLUMN, "cpu")],
                ChunkScanMethod::TimeRange(TimeRange::new(5000, 6000)),
            )
            .unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn test_name_label_canonicalized() {
        let (store, dataset) = setup_store();
        store
            .ingest(
                &dataset,
                0,
                vec![sample(labels(&[("__name__", "cpu")]), 0, 1.0)],
                0,
            )
            .unwrap();
        let keys = store
            .part_keys(&dataset, 0, &[ColumnFilter::equals(METRIC_COLUMN, "cpu")], 0, 10)
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].contains_key(METRIC_COLUMN));
        assert!(!keys[0].contains_key(PROM_METRIC_LABEL));
    }

    #[test]
    fn test_eviction_by_partition_cap() {
        let store = TimeSeriesMemStore::new();
        let dataset = DatasetRef::new("prometheus");
        let config = StoreConfig {
            eviction_policy: FixedMaxPartitionsEvictionPolicy::new(2),
            ..StoreConfig::default()
        };
        store.setup(&dataset, &[Schema::gauge()], 0, config).unwrap();

        for (i, host) in ["a", "b", "c"].iter().enumerate() {
            store
                .ingest(
                    &dataset,
                    0,
                    vec![sample(labels(&[("__name__", "cpu"), ("host", host)]), 0, 1.0)],
                    i as i64 * 1000,
                )
                .unwrap();
        }
        let stats = store.ingest_stats(&dataset, 0).unwrap();
        assert_eq!(stats.evicted_partitions, 1);

        // The oldest-ingested series ("a") is the one gone.
        let keys = store
            .part_keys(&dataset, 0, &[ColumnFilter::equals("host", "a")], 0, 10)
            .unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_recreated_after_eviction() {
        let store = TimeSeriesMemStore::new();
        let dataset = DatasetRef::new("prometheus");
        let config = StoreConfig {
            eviction_policy: FixedMaxPartitionsEvictionPolicy::new(1),
            ..StoreConfig::default()
        };
        store.setup(&dataset, &[Schema::gauge()], 0, config).unwrap();

        let a = labels(&[("__name__", "cpu"), ("host", "a")]);
        let b = labels(&[("__name__", "cpu"), ("host", "b")]);
        store.ingest(&dataset, 0, vec![sample(a.clone(), 0, 1.0)], 0).unwrap();
        store.ingest(&dataset, 0, vec![sample(b, 100, 1.0)], 1).unwrap();
        // "a" was evicted; later ingest recreates it transparently.
        store.ingest(&dataset, 0, vec![sample(a, 200, 2.0)], 2).unwrap();

        let keys = store
            .part_keys(&dataset, 0, &[ColumnFilter::equals("host", "a")], 0, 1000)
            .unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_unknown_schema_counted_and_skipped() {
        let (store, dataset) = setup_store();
        let stats = store
            .ingest(
                &dataset,
                0,
                vec![SampleRecord {
                    labels: labels(&[("__name__", "cpu")]),
                    timestamp_ms: 0,
                    value: 1.0,
                    schema: "no-such-schema".into(),
                }],
                0,
            )
            .unwrap();
        assert_eq!(stats.skipped_errors, 1);
        assert_eq!(stats.ingested, 0);
    }

    #[test]
    fn test_label_values_and_names() {
        let (store, dataset) = setup_store();
        store
            .ingest(
                &dataset,
                0,
                vec![
                    sample(labels(&[("__name__", "cpu"), ("host", "a"), ("dc", "east")]), 0, 1.0),
                    sample(labels(&[("__name__", "cpu"), ("host", "b"), ("dc", "east")]), 0, 1.0),
                ],
                0,
            )
            .unwrap();

        let rows = store
            .label_values(
                &dataset,
                0,
                &[ColumnFilter::equals(METRIC_COLUMN, "cpu")],
                &["host".to_string()],
                0,
                10,
            )
            .unwrap();
        assert_eq!(rows.len(), 2);

        let names = store
            .label_names(&dataset, 0, &[ColumnFilter::equals(METRIC_COLUMN, "cpu")], 0, 10)
            .unwrap();
        assert!(names.contains("host"));
        assert!(names.contains("dc"));
    }

    #[test]
    fn test_label_cardinality() {
        let (store, dataset) = setup_store();
        store
            .ingest(
                &dataset,
                0,
                vec![
                    sample(labels(&[("__name__", "cpu"), ("host", "a")]), 0, 1.0),
                    sample(labels(&[("__name__", "cpu"), ("host", "b")]), 0, 1.0),
                ],
                0,
            )
            .unwrap();
        let card = store
            .label_cardinality(&dataset, 0, &[ColumnFilter::equals(METRIC_COLUMN, "cpu")], 0, 10)
            .unwrap();
        assert_eq!(card.get("host"), Some(&2));
        assert_eq!(card.get(METRIC_COLUMN), Some(&1));
    }

    #[test]
    fn test_topk_cardinality() {
        let (store, dataset) = setup_store();
        let mut batch = Vec::new();
        for host in ["a", "b", "c"] {
            batch.push(sample(
                labels(&[("__name__", "cpu"), ("_ws_", "demo"), ("_ns_", "ns1"), ("host", host)]),
                0,
                1.0,
            ));
        }
        batch.push(sample(
            labels(&[("__name__", "mem"), ("_ws_", "demo"), ("_ns_", "ns1")]),
            0,
            1.0,
        ));
        store.ingest(&dataset, 0, batch, 0).unwrap();

        let top = store
            .topk_cardinality(&dataset, 0, &["demo".to_string(), "ns1".to_string()], 1, true)
            .unwrap();
        assert_eq!(top, vec![("cpu".to_string(), 3)]);
    }

    #[test]
    fn test_retention_clips_scan_window() {
        let store = TimeSeriesMemStore::with_retention(Arc::new(|| 500));
        let dataset = DatasetRef::new("prometheus");
        store
            .setup(&dataset, &[Schema::gauge()], 0, StoreConfig::default())
            .unwrap();
        let series = labels(&[("__name__", "cpu")]);
        let batch: Vec<_> = (0..100).map(|i| sample(series.clone(), i * 10, 1.0)).collect();
        store.ingest(&dataset, 0, batch, 0).unwrap();

        let parts = store
            .scan_partitions(
                &dataset,
                0,
                &[ColumnFilter::equals(METRIC_COLUMN, "cpu")],
                ChunkScanMethod::TimeRange(TimeRange::new(0, 990)),
            )
            .unwrap();
        let clipped = store.clip_to_retention(ChunkScanMethod::TimeRange(TimeRange::new(0, 990)));
        let rows = parts[0].read_rows(&clipped.time_range());
        assert!(rows.iter().all(|(t, _)| *t >= 500));
    }
}
