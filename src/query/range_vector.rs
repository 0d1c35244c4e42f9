//! Range vectors: keyed, lazy streams of timestamped values.
//!
//! Every operator consumes and produces [`RangeVector`]s. The rows flow
//! through a pull-based [`RangeVectorCursor`] with an explicit `close`, so
//! cancellation can release upstream resources mid-stream. Ordering is
//! strictly timestamp-ascending within one vector; ordering between
//! vectors is unspecified.
//!
//! Row values are a tagged variant rather than a bare double: partial
//! aggregate states (mean and count for `avg`, Welford triples for
//! `stddev`, candidate sets for `topk`) travel between the map and reduce
//! stages as first-class row values, which keeps cross-node reduction a
//! plain fold over rows.

use crate::types::LabelSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Evaluation grid of a periodic stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RvRange {
    /// First grid point, epoch ms.
    pub start_ms: i64,
    /// Grid step, ms. Zero for instant queries.
    pub step_ms: i64,
    /// Last grid point, epoch ms.
    pub end_ms: i64,
}

impl RvRange {
    /// Iterate the grid points.
    pub fn grid(&self) -> impl Iterator<Item = i64> + '_ {
        let step = self.step_ms.max(1);
        (self.start_ms..=self.end_ms).step_by(step as usize)
    }

    /// Number of grid points.
    pub fn num_points(&self) -> usize {
        if self.end_ms < self.start_ms {
            0
        } else {
            ((self.end_ms - self.start_ms) / self.step_ms.max(1)) as usize + 1
        }
    }
}

/// One value cell of a row.
///
/// `Double` is the common case; the partial variants carry aggregate
/// state between a map stage and the reduce stage above it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowValue {
    /// Plain sample value.
    Double(f64),
    /// Partial average.
    AvgPartial {
        /// Sum of samples folded so far.
        sum: f64,
        /// Sample count folded so far.
        count: f64,
    },
    /// Partial variance state (Welford).
    StdPartial {
        /// Sample count.
        count: f64,
        /// Running mean.
        mean: f64,
        /// Sum of squared deviations from the mean.
        m2: f64,
    },
    /// Candidate set for topk/bottomk: row key string to value.
    TopkPartial(Vec<(String, f64)>),
    /// Per-value occurrence counts for count_values.
    CountValuesPartial(Vec<(String, f64)>),
    /// Raw samples for exact quantile computation.
    QuantilePartial(Vec<f64>),
}

impl RowValue {
    /// The double value, `NaN` for partial variants.
    pub fn as_double(&self) -> f64 {
        match self {
            RowValue::Double(v) => *v,
            _ => f64::NAN,
        }
    }
}

/// One emitted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Timestamp, epoch ms.
    pub timestamp_ms: i64,
    /// Value cell.
    pub value: RowValue,
}

impl Row {
    /// A plain double row.
    pub fn double(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value: RowValue::Double(value),
        }
    }
}

/// Grouping key of a range vector: its label values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct RangeVectorKey {
    /// Sorted label pairs.
    pub labels: LabelSet,
}

impl RangeVectorKey {
    /// Key over the given labels.
    pub fn new(labels: LabelSet) -> Self {
        Self { labels }
    }

    /// Key projected onto `on` labels only.
    pub fn project_on(&self, on: &[String]) -> RangeVectorKey {
        let labels = self
            .labels
            .iter()
            .filter(|(name, _)| on.contains(name))
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        RangeVectorKey { labels }
    }

    /// Key with `ignoring` labels removed.
    pub fn without(&self, ignoring: &[String]) -> RangeVectorKey {
        let labels = self
            .labels
            .iter()
            .filter(|(name, _)| !ignoring.contains(name))
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        RangeVectorKey { labels }
    }
}

impl fmt::Display for RangeVectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for (name, value) in &self.labels {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", name, value)?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// Pull-based row stream with explicit close.
///
/// `close` must release upstream resources and is idempotent; dropping a
/// cursor without closing it must not leak, but cancellation paths call
/// `close` eagerly.
pub trait RangeVectorCursor: Send {
    /// Next row in timestamp order, `None` at end of stream.
    fn next_row(&mut self) -> Option<Row>;

    /// Release upstream resources.
    fn close(&mut self) {}
}

/// Cursor over pre-materialized rows.
pub struct BufferedCursor {
    rows: VecDeque<Row>,
}

impl BufferedCursor {
    /// Cursor over the given rows, assumed timestamp-ascending.
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }

    /// Cursor over `(ts, value)` doubles.
    pub fn from_samples(samples: Vec<(i64, f64)>) -> Self {
        Self::new(
            samples
                .into_iter()
                .map(|(t, v)| Row::double(t, v))
                .collect(),
        )
    }
}

impl RangeVectorCursor for BufferedCursor {
    fn next_row(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    fn close(&mut self) {
        self.rows.clear();
    }
}

/// An empty stream.
pub struct EmptyCursor;

impl RangeVectorCursor for EmptyCursor {
    fn next_row(&mut self) -> Option<Row> {
        None
    }
}

/// A keyed stream of rows with an optional declared output grid.
pub struct RangeVector {
    /// Grouping labels.
    pub key: RangeVectorKey,
    /// The nominal time grid of the rows, when periodic.
    pub output_range: Option<RvRange>,
    /// The row stream.
    pub cursor: Box<dyn RangeVectorCursor>,
}

impl RangeVector {
    /// Range vector over buffered rows.
    pub fn buffered(key: RangeVectorKey, rows: Vec<Row>, output_range: Option<RvRange>) -> Self {
        Self {
            key,
            output_range,
            cursor: Box::new(BufferedCursor::new(rows)),
        }
    }

    /// Keyed empty stream.
    pub fn empty(key: RangeVectorKey) -> Self {
        Self {
            key,
            output_range: None,
            cursor: Box::new(EmptyCursor),
        }
    }

    /// Drain the stream into a vector. Consumes and closes the cursor.
    pub fn collect_rows(mut self) -> (RangeVectorKey, Option<RvRange>, Vec<Row>) {
        let mut rows = Vec::new();
        while let Some(row) = self.cursor.next_row() {
            rows.push(row);
        }
        self.cursor.close();
        (self.key, self.output_range, rows)
    }

    /// Close without draining.
    pub fn close(mut self) {
        self.cursor.close();
    }
}

impl fmt::Debug for RangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeVector")
            .field("key", &self.key)
            .field("output_range", &self.output_range)
            .finish_non_exhaustive()
    }
}

/// Fully materialized range vector for wire transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableRangeVector {
    /// Grouping labels.
    pub key: LabelSet,
    /// Materialized rows.
    pub rows: Vec<Row>,
    /// Declared output grid.
    pub output_range: Option<RvRange>,
}

impl SerializableRangeVector {
    /// Materialize a streaming range vector.
    pub fn from_range_vector(rv: RangeVector) -> Self {
        let (key, output_range, rows) = rv.collect_rows();
        Self {
            key: key.labels,
            rows,
            output_range,
        }
    }

    /// Back into a streaming vector.
    pub fn into_range_vector(self) -> RangeVector {
        RangeVector::buffered(RangeVectorKey::new(self.key), self.rows, self.output_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pairs: &[(&str, &str)]) -> RangeVectorKey {
        RangeVectorKey::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_grid_iteration() {
        let range = RvRange {
            start_ms: 0,
            step_ms: 10,
            end_ms: 35,
        };
        let points: Vec<i64> = range.grid().collect();
        assert_eq!(points, vec![0, 10, 20, 30]);
        assert_eq!(range.num_points(), 4);
    }

    #[test]
    fn test_key_projection() {
        let k = key(&[("job", "api"), ("instance", "h1"), ("dc", "east")]);
        assert_eq!(
            k.project_on(&["job".to_string()]),
            key(&[("job", "api")])
        );
        assert_eq!(
            k.without(&["instance".to_string()]),
            key(&[("job", "api"), ("dc", "east")])
        );
    }

    #[test]
    fn test_buffered_cursor_order() {
        let mut cursor = BufferedCursor::from_samples(vec![(1, 1.0), (2, 2.0)]);
        assert_eq!(cursor.next_row(), Some(Row::double(1, 1.0)));
        assert_eq!(cursor.next_row(), Some(Row::double(2, 2.0)));
        assert_eq!(cursor.next_row(), None);
    }

    #[test]
    fn test_serializable_round_trip() {
        let rv = RangeVector::buffered(
            key(&[("job", "api")]),
            vec![Row::double(1, 1.0), Row::double(2, 2.0)],
            Some(RvRange {
                start_ms: 1,
                step_ms: 1,
                end_ms: 2,
            }),
        );
        let ser = SerializableRangeVector::from_range_vector(rv);
        let json = serde_json::to_string(&ser).unwrap();
        let back: SerializableRangeVector = serde_json::from_str(&json).unwrap();
        assert_eq!(ser, back);
    }

    #[test]
    fn test_partial_value_as_double_is_nan() {
        let v = RowValue::AvgPartial { sum: 4.0, count: 2.0 };
        assert!(v.as_double().is_nan());
        assert_eq!(RowValue::Double(4.0).as_double(), 4.0);
    }

    #[test]
    fn test_key_display() {
        let k = key(&[("job", "api"), ("dc", "east")]);
        assert_eq!(k.to_string(), "{dc=\"east\",job=\"api\"}");
    }
}
