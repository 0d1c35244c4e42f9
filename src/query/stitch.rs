//! Timestamp-ordered merge of streams that carry the same series key,
//! across tiers or shard-change boundaries.
//!
//! The merge is an n-way linear scan over the head of each source; n is
//! the number of tiers or spread segments, always small, so a heap would
//! cost more than it saves. When several sources produce a non-NaN value
//! for the same timestamp the merged stream emits NaN, the
//! unable-to-calculate sentinel, which downstream aggregates treat as an
//! absent sample.

use crate::query::range_vector::{
    RangeVector, RangeVectorCursor, RangeVectorKey, Row, RowValue, RvRange,
};
use std::collections::BTreeMap;

/// Lazy n-way merge cursor.
pub struct StitchCursor {
    sources: Vec<Box<dyn RangeVectorCursor>>,
    heads: Vec<Option<Row>>,
}

impl StitchCursor {
    /// Merge the given cursors.
    pub fn new(sources: Vec<Box<dyn RangeVectorCursor>>) -> Self {
        let heads = (0..sources.len()).map(|_| None).collect();
        let mut cursor = Self { sources, heads };
        for i in 0..cursor.sources.len() {
            cursor.heads[i] = cursor.sources[i].next_row();
        }
        cursor
    }
}

impl RangeVectorCursor for StitchCursor {
    fn next_row(&mut self) -> Option<Row> {
        // Smallest timestamp among the heads; linear scan on purpose.
        let min_ts = self
            .heads
            .iter()
            .flatten()
            .map(|row| row.timestamp_ms)
            .min()?;

        let mut non_nan: Option<f64> = None;
        let mut conflict = false;
        for i in 0..self.heads.len() {
            let at_min = matches!(&self.heads[i], Some(row) if row.timestamp_ms == min_ts);
            if !at_min {
                continue;
            }
            let row = self.heads[i].take().expect("head checked above");
            self.heads[i] = self.sources[i].next_row();
            let v = row.value.as_double();
            if !v.is_nan() {
                if non_nan.is_some() {
                    conflict = true;
                } else {
                    non_nan = Some(v);
                }
            }
        }

        let value = if conflict {
            f64::NAN
        } else {
            non_nan.unwrap_or(f64::NAN)
        };
        Some(Row {
            timestamp_ms: min_ts,
            value: RowValue::Double(value),
        })
    }

    fn close(&mut self) {
        for source in &mut self.sources {
            source.close();
        }
    }
}

/// Union of two optional output grids: earliest start, finest step,
/// latest end.
fn merge_ranges(a: Option<RvRange>, b: Option<RvRange>) -> Option<RvRange> {
    match (a, b) {
        (Some(a), Some(b)) => Some(RvRange {
            start_ms: a.start_ms.min(b.start_ms),
            step_ms: if a.step_ms == 0 { b.step_ms } else { a.step_ms.min(b.step_ms.max(1)) },
            end_ms: a.end_ms.max(b.end_ms),
        }),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Group vectors by key and merge each group into one stitched vector.
pub fn stitch(vectors: Vec<RangeVector>) -> Vec<RangeVector> {
    let mut groups: BTreeMap<RangeVectorKey, (Option<RvRange>, Vec<Box<dyn RangeVectorCursor>>)> =
        BTreeMap::new();
    for rv in vectors {
        let entry = groups.entry(rv.key).or_insert((None, Vec::new()));
        entry.0 = merge_ranges(entry.0, rv.output_range);
        entry.1.push(rv.cursor);
    }
    groups
        .into_iter()
        .map(|(key, (output_range, cursors))| {
            if cursors.len() == 1 {
                let mut cursors = cursors;
                RangeVector {
                    key,
                    output_range,
                    cursor: cursors.pop().expect("one cursor"),
                }
            } else {
                RangeVector {
                    key,
                    output_range,
                    cursor: Box::new(StitchCursor::new(cursors)),
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::range_vector::BufferedCursor;

    fn key(host: &str) -> RangeVectorKey {
        RangeVectorKey::new([("host".to_string(), host.to_string())].into_iter().collect())
    }

    fn rv(host: &str, samples: Vec<(i64, f64)>) -> RangeVector {
        RangeVector {
            key: key(host),
            output_range: None,
            cursor: Box::new(BufferedCursor::from_samples(samples)),
        }
    }

    fn drain(rv: RangeVector) -> Vec<(i64, f64)> {
        let (_, _, rows) = rv.collect_rows();
        rows.into_iter()
            .map(|r| (r.timestamp_ms, r.value.as_double()))
            .collect()
    }

    #[test]
    fn test_stitch_interleaves_disjoint_ranges() {
        let merged = stitch(vec![
            rv("a", vec![(0, 1.0), (20, 3.0)]),
            rv("a", vec![(10, 2.0), (30, 4.0)]),
        ]);
        assert_eq!(merged.len(), 1);
        let rows = drain(merged.into_iter().next().unwrap());
        assert_eq!(rows, vec![(0, 1.0), (10, 2.0), (20, 3.0), (30, 4.0)]);
    }

    #[test]
    fn test_split_then_stitch_is_identity() {
        let full: Vec<(i64, f64)> = (0..20).map(|i| (i * 10, i as f64)).collect();
        let (left, right) = full.split_at(11);
        let merged = stitch(vec![rv("a", left.to_vec()), rv("a", right.to_vec())]);
        let rows = drain(merged.into_iter().next().unwrap());
        assert_eq!(rows, full);
    }

    #[test]
    fn test_conflicting_timestamp_emits_nan() {
        let merged = stitch(vec![
            rv("a", vec![(10, 1.0)]),
            rv("a", vec![(10, 2.0)]),
        ]);
        let rows = drain(merged.into_iter().next().unwrap());
        assert_eq!(rows.len(), 1);
        assert!(rows[0].1.is_nan());
    }

    #[test]
    fn test_unique_non_nan_wins_over_nan() {
        let merged = stitch(vec![
            rv("a", vec![(10, f64::NAN)]),
            rv("a", vec![(10, 5.0)]),
        ]);
        let rows = drain(merged.into_iter().next().unwrap());
        assert_eq!(rows[0].1, 5.0);
    }

    #[test]
    fn test_distinct_keys_stay_separate() {
        let merged = stitch(vec![rv("a", vec![(0, 1.0)]), rv("b", vec![(0, 2.0)])]);
        assert_eq!(merged.len(), 2);
    }
}
