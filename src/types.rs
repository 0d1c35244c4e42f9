//! Core data model shared by the store, the planners and the execution
//! operators.
//!
//! # Key Types
//!
//! - **`Dataset`**: a named schema with partition-key columns, data columns
//!   and options such as the metric column and the shard-key columns
//! - **`Schema`**: one concrete row layout (counter, gauge, histogram)
//! - **`PartKey`**: the canonical byte encoding of one series identity
//! - **`TimeRange`** / **`ChunkScanMethod`**: the time window a scan is
//!   gated to
//! - **`ShardStatus`**: assignment state of a shard as reported by the
//!   shard mapper

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Internal column name every incoming `__name__` label is canonicalized to.
pub const METRIC_COLUMN: &str = "_metric_";

/// The label name PromQL exposes for the metric name.
pub const PROM_METRIC_LABEL: &str = "__name__";

/// Workspace shard-key column.
pub const WS_COLUMN: &str = "_ws_";

/// Namespace shard-key column.
pub const NS_COLUMN: &str = "_ns_";

/// Identifier of a shard within a dataset, `0..num_shards`.
pub type ShardId = u16;

/// Monotonic handle for a partition within one shard.
pub type PartId = u32;

/// Reference to a dataset by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetRef(pub String);

impl DatasetRef {
    /// Build a dataset reference from any string-ish name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Column value types a schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Millisecond timestamp column.
    Timestamp,
    /// IEEE-754 double sample column.
    Double,
    /// Bucketed histogram sample column.
    Histogram,
    /// String column (metadata results).
    String,
}

/// One column of a result or data schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Column value type.
    pub col_type: ColumnType,
}

impl ColumnInfo {
    /// Shorthand constructor.
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
        }
    }
}

/// A concrete row layout for samples of one data schema.
///
/// A dataset may carry several of these side by side (a counter schema, a
/// gauge schema, a histogram schema); the first column is always the
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Schema name, e.g. `gauge` or `prom-counter`.
    pub name: String,
    /// Row layout, timestamp first.
    pub columns: Vec<ColumnInfo>,
}

impl Schema {
    /// The conventional gauge schema: timestamp plus one double value.
    pub fn gauge() -> Self {
        Self {
            name: "gauge".into(),
            columns: vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new("value", ColumnType::Double),
            ],
        }
    }

    /// The conventional counter schema, same layout as gauge but treated
    /// as monotonic by the rate family of range functions.
    pub fn prom_counter() -> Self {
        Self {
            name: "prom-counter".into(),
            columns: vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new("value", ColumnType::Double),
            ],
        }
    }

    /// Bucketed histogram schema. Buckets land as one series per `le`
    /// boundary; the value column carries the cumulative bucket count.
    pub fn prom_histogram() -> Self {
        Self {
            name: "prom-histogram".into(),
            columns: vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new("value", ColumnType::Double),
            ],
        }
    }

    /// Name of the default value column.
    pub fn value_column(&self) -> &str {
        &self.columns[1].name
    }
}

/// Per-dataset options that shape planning and label rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetOptions {
    /// Column holding the metric name. Incoming `__name__` filters are
    /// rewritten to this column.
    pub metric_column: String,
    /// Columns participating in shard-key hashing, in hash order.
    pub shard_key_columns: Vec<String>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            metric_column: METRIC_COLUMN.to_string(),
            shard_key_columns: vec![
                WS_COLUMN.to_string(),
                NS_COLUMN.to_string(),
                METRIC_COLUMN.to_string(),
            ],
        }
    }
}

/// A named dataset: identity, partition-key columns and options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Dataset reference.
    pub dataset_ref: DatasetRef,
    /// Columns making up the partition key of a series.
    pub partition_key_columns: Vec<String>,
    /// Options (metric column, shard-key columns).
    pub options: DatasetOptions,
}

impl Dataset {
    /// A dataset with conventional Prometheus-shaped defaults.
    pub fn prometheus(name: impl Into<String>) -> Self {
        Self {
            dataset_ref: DatasetRef::new(name),
            partition_key_columns: vec!["tags".into()],
            options: DatasetOptions::default(),
        }
    }
}

/// Sorted label name/value pairs identifying one series.
///
/// `BTreeMap` keeps the pairs in canonical order so that the byte encoding
/// in [`PartKey`] is deterministic.
pub type LabelSet = BTreeMap<String, String>;

/// Canonical, byte-encoded identity of one time series within a dataset.
///
/// The encoding is a length-prefixed concatenation of the sorted label
/// pairs. It is opaque to everything except [`PartKey::decode`]; equality
/// and hashing go through the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartKey(Bytes);

impl PartKey {
    /// Encode a label set into its canonical byte form.
    pub fn encode(labels: &LabelSet) -> Self {
        let mut buf = Vec::with_capacity(64);
        for (name, value) in labels {
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
        Self(Bytes::from(buf))
    }

    /// Decode back into a label set.
    ///
    /// Returns `None` if the buffer is truncated or not valid UTF-8, which
    /// only happens if the bytes did not come from [`PartKey::encode`].
    pub fn decode(&self) -> Option<LabelSet> {
        let mut labels = LabelSet::new();
        let buf = &self.0[..];
        let mut pos = 0usize;
        while pos < buf.len() {
            let name = Self::read_str(buf, &mut pos)?;
            let value = Self::read_str(buf, &mut pos)?;
            labels.insert(name, value);
        }
        Some(labels)
    }

    fn read_str(buf: &[u8], pos: &mut usize) -> Option<String> {
        if *pos + 2 > buf.len() {
            return None;
        }
        let len = u16::from_le_bytes([buf[*pos], buf[*pos + 1]]) as usize;
        *pos += 2;
        if *pos + len > buf.len() {
            return None;
        }
        let s = std::str::from_utf8(&buf[*pos..*pos + len]).ok()?.to_string();
        *pos += len;
        Some(s)
    }

    /// Raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A closed time window in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start, epoch ms.
    pub start_ms: i64,
    /// Inclusive end, epoch ms.
    pub end_ms: i64,
}

impl TimeRange {
    /// Build a range; callers are expected to pass `start <= end`.
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    /// Whether `ts` falls inside the window.
    #[inline]
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_ms && ts <= self.end_ms
    }

    /// Whether two windows intersect.
    #[inline]
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start_ms <= other.end_ms && other.start_ms <= self.end_ms
    }
}

/// How a leaf scan walks the chunks of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkScanMethod {
    /// Every chunk regardless of time.
    All,
    /// Only chunks intersecting the window; rows outside are dropped.
    TimeRange(TimeRange),
}

impl ChunkScanMethod {
    /// The effective window, unbounded for `All`.
    pub fn time_range(&self) -> TimeRange {
        match self {
            ChunkScanMethod::All => TimeRange::new(i64::MIN, i64::MAX),
            ChunkScanMethod::TimeRange(r) => *r,
        }
    }
}

/// Assignment state of one shard as seen by the shard mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    /// Not assigned to any node.
    Unassigned,
    /// Assigned, not yet ingesting.
    Assigned,
    /// Replaying data, queries may be incomplete.
    Recovery,
    /// Serving ingest and queries.
    Active,
    /// Administratively stopped.
    Stopped,
    /// Failed.
    Error,
}

impl ShardStatus {
    /// Whether a query may read from a shard in this state.
    pub fn queryable(&self) -> bool {
        matches!(self, ShardStatus::Active | ShardStatus::Stopped)
    }
}

/// One ingested sample: series identity plus a timestamped value.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    /// Labels identifying the series, already canonicalized (the metric
    /// name under the dataset's metric column).
    pub labels: LabelSet,
    /// Sample timestamp, epoch ms.
    pub timestamp_ms: i64,
    /// Sample value.
    pub value: f64,
    /// Name of the data schema this sample belongs to.
    pub schema: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_part_key_round_trip() {
        let ls = labels(&[
            (METRIC_COLUMN, "http_req_total"),
            ("_ws_", "demo"),
            ("_ns_", "App-0"),
            ("instance", "h1"),
        ]);
        let key = PartKey::encode(&ls);
        assert_eq!(key.decode(), Some(ls));
    }

    #[test]
    fn test_part_key_deterministic_for_insertion_order() {
        let a = labels(&[("b", "2"), ("a", "1")]);
        let mut b = LabelSet::new();
        b.insert("a".into(), "1".into());
        b.insert("b".into(), "2".into());
        assert_eq!(PartKey::encode(&a), PartKey::encode(&b));
    }

    #[test]
    fn test_time_range_overlaps() {
        let r = TimeRange::new(100, 200);
        assert!(r.overlaps(&TimeRange::new(150, 250)));
        assert!(r.overlaps(&TimeRange::new(200, 300)));
        assert!(!r.overlaps(&TimeRange::new(201, 300)));
        assert!(!r.overlaps(&TimeRange::new(0, 99)));
    }

    #[test]
    fn test_shard_status_queryable() {
        assert!(ShardStatus::Active.queryable());
        assert!(!ShardStatus::Recovery.queryable());
        assert!(!ShardStatus::Unassigned.queryable());
        assert!(!ShardStatus::Error.queryable());
    }
}
