//! Two-stage aggregation: map to partial accumulators, reduce partials,
//! present finals.
//!
//! The map stage runs next to the leaves and folds each group's samples
//! into partial rows (`sum` stays a double; `avg` carries sum and count;
//! `stddev` carries a Welford triple; `topk` carries a candidate set).
//! Reduce nodes fold partial rows from many children; the presenter
//! finalizes on top. Keeping partials associative makes a two-level
//! reduce equal a one-level reduce.
//!
//! Stitch-sentinel NaNs are treated as absent samples by every operator,
//! so a NaN emitted for a tier tie never poisons a group.

use crate::error::QueryError;
use crate::query::logical::{AggParam, AggregationOperator};
use crate::query::range_vector::{RangeVector, RangeVectorKey, Row, RowValue};
use crate::query::result::QueryResult;
use crate::query::transformers::range_functions::quantile_sorted;
use crate::types::{LabelSet, METRIC_COLUMN};
use std::collections::BTreeMap;
use tracing::trace;

/// How rows group under an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Grouping {
    /// Keep only these labels.
    pub by: Vec<String>,
    /// Drop these labels.
    pub without: Vec<String>,
}

impl Grouping {
    /// Group key for one input vector. Bare aggregation drops every
    /// label; `without` additionally drops the metric.
    pub fn key_for(&self, key: &RangeVectorKey) -> RangeVectorKey {
        if !self.by.is_empty() {
            key.project_on(&self.by)
        } else if !self.without.is_empty() {
            let mut dropped = self.without.clone();
            dropped.push(METRIC_COLUMN.to_string());
            key.without(&dropped)
        } else {
            RangeVectorKey::default()
        }
    }
}

/// Map a result into partial-accumulator rows, one vector per group key.
pub fn map_to_partials(
    operator: AggregationOperator,
    params: &[AggParam],
    grouping: &Grouping,
    result: QueryResult,
) -> Result<QueryResult, QueryError> {
    let mut groups: BTreeMap<RangeVectorKey, BTreeMap<i64, RowValue>> = BTreeMap::new();
    for rv in result.range_vectors {
        let group_key = grouping.key_for(&rv.key);
        let source_key = serde_json::to_string(&rv.key.labels)
            .map_err(|e| QueryError::internal(format!("key encode: {e}")))?;
        let (_, _, rows) = rv.collect_rows();
        let group = groups.entry(group_key).or_default();
        for row in rows {
            let value = row.value.as_double();
            if value.is_nan() {
                continue;
            }
            match group.entry(row.timestamp_ms) {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(seed_partial(operator, value, &source_key));
                }
                std::collections::btree_map::Entry::Occupied(mut slot) => {
                    fold_sample(operator, params, slot.get_mut(), value, &source_key);
                }
            }
        }
    }
    trace!(groups = groups.len(), op = ?operator, "mapped to partial accumulators");

    let range_vectors = groups
        .into_iter()
        .map(|(key, by_ts)| {
            let rows = by_ts
                .into_iter()
                .map(|(ts, value)| Row {
                    timestamp_ms: ts,
                    value,
                })
                .collect();
            RangeVector::buffered(key, rows, None)
        })
        .collect();
    Ok(QueryResult {
        range_vectors,
        ..result
    })
}

fn seed_partial(operator: AggregationOperator, value: f64, source_key: &str) -> RowValue {
    match operator {
        AggregationOperator::Sum
        | AggregationOperator::Min
        | AggregationOperator::Max => RowValue::Double(value),
        AggregationOperator::Count => RowValue::Double(1.0),
        AggregationOperator::Group => RowValue::Double(1.0),
        AggregationOperator::Avg => RowValue::AvgPartial {
            sum: value,
            count: 1.0,
        },
        AggregationOperator::Stddev | AggregationOperator::Stdvar => RowValue::StdPartial {
            count: 1.0,
            mean: value,
            m2: 0.0,
        },
        AggregationOperator::TopK | AggregationOperator::BottomK => {
            RowValue::TopkPartial(vec![(source_key.to_string(), value)])
        }
        AggregationOperator::CountValues => {
            RowValue::CountValuesPartial(vec![(format_count_value(value), 1.0)])
        }
        AggregationOperator::Quantile => RowValue::QuantilePartial(vec![value]),
    }
}

fn fold_sample(
    operator: AggregationOperator,
    params: &[AggParam],
    acc: &mut RowValue,
    value: f64,
    source_key: &str,
) {
    match (operator, acc) {
        (AggregationOperator::Sum, RowValue::Double(a)) => *a += value,
        (AggregationOperator::Min, RowValue::Double(a)) => *a = a.min(value),
        (AggregationOperator::Max, RowValue::Double(a)) => *a = a.max(value),
        (AggregationOperator::Count, RowValue::Double(a)) => *a += 1.0,
        (AggregationOperator::Group, RowValue::Double(_)) => {}
        (AggregationOperator::Avg, RowValue::AvgPartial { sum, count }) => {
            *sum += value;
            *count += 1.0;
        }
        (
            AggregationOperator::Stddev | AggregationOperator::Stdvar,
            RowValue::StdPartial { count, mean, m2 },
        ) => {
            // Welford's online update.
            *count += 1.0;
            let delta = value - *mean;
            *mean += delta / *count;
            *m2 += delta * (value - *mean);
        }
        (
            AggregationOperator::TopK | AggregationOperator::BottomK,
            RowValue::TopkPartial(candidates),
        ) => {
            candidates.push((source_key.to_string(), value));
            trim_candidates(operator, params, candidates);
        }
        (AggregationOperator::CountValues, RowValue::CountValuesPartial(counts)) => {
            let rendered = format_count_value(value);
            match counts.iter_mut().find(|(v, _)| *v == rendered) {
                Some((_, n)) => *n += 1.0,
                None => counts.push((rendered, 1.0)),
            }
        }
        (AggregationOperator::Quantile, RowValue::QuantilePartial(values)) => values.push(value),
        (op, acc) => {
            debug_assert!(false, "accumulator shape mismatch: {op:?} vs {acc:?}");
        }
    }
}

/// Merge one partial into another. Both must come from the same operator.
pub fn merge_partials(
    operator: AggregationOperator,
    params: &[AggParam],
    acc: &mut RowValue,
    incoming: RowValue,
) {
    match (operator, acc, incoming) {
        (AggregationOperator::Sum, RowValue::Double(a), RowValue::Double(b)) => *a += b,
        (AggregationOperator::Min, RowValue::Double(a), RowValue::Double(b)) => *a = a.min(b),
        (AggregationOperator::Max, RowValue::Double(a), RowValue::Double(b)) => *a = a.max(b),
        (AggregationOperator::Count, RowValue::Double(a), RowValue::Double(b)) => *a += b,
        (AggregationOperator::Group, RowValue::Double(_), RowValue::Double(_)) => {}
        (
            AggregationOperator::Avg,
            RowValue::AvgPartial { sum, count },
            RowValue::AvgPartial {
                sum: other_sum,
                count: other_count,
            },
        ) => {
            *sum += other_sum;
            *count += other_count;
        }
        (
            AggregationOperator::Stddev | AggregationOperator::Stdvar,
            RowValue::StdPartial { count, mean, m2 },
            RowValue::StdPartial {
                count: count_b,
                mean: mean_b,
                m2: m2_b,
            },
        ) => {
            // Parallel Welford merge.
            if count_b > 0.0 {
                let combined = *count + count_b;
                let delta = mean_b - *mean;
                *m2 += m2_b + delta * delta * (*count * count_b / combined);
                *mean += delta * (count_b / combined);
                *count = combined;
            }
        }
        (
            AggregationOperator::TopK | AggregationOperator::BottomK,
            RowValue::TopkPartial(candidates),
            RowValue::TopkPartial(incoming),
        ) => {
            candidates.extend(incoming);
            trim_candidates(operator, params, candidates);
        }
        (
            AggregationOperator::CountValues,
            RowValue::CountValuesPartial(counts),
            RowValue::CountValuesPartial(incoming),
        ) => {
            for (value, n) in incoming {
                match counts.iter_mut().find(|(v, _)| *v == value) {
                    Some((_, existing)) => *existing += n,
                    None => counts.push((value, n)),
                }
            }
        }
        (
            AggregationOperator::Quantile,
            RowValue::QuantilePartial(values),
            RowValue::QuantilePartial(incoming),
        ) => values.extend(incoming),
        (op, acc, incoming) => {
            debug_assert!(
                false,
                "partial shape mismatch: {op:?} acc {acc:?} incoming {incoming:?}"
            );
        }
    }
}

fn trim_candidates(
    operator: AggregationOperator,
    params: &[AggParam],
    candidates: &mut Vec<(String, f64)>,
) {
    let k = match params.first() {
        Some(AggParam::Number(n)) => *n as usize,
        _ => 1,
    };
    match operator {
        AggregationOperator::TopK => {
            candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        }
        _ => candidates
            .sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)),
    }
    candidates.truncate(k.max(1));
}

/// Fold several partial results into one, grouping by vector key and
/// timestamp.
pub fn reduce_results(
    operator: AggregationOperator,
    params: &[AggParam],
    results: Vec<QueryResult>,
) -> Result<QueryResult, QueryError> {
    let mut merged: BTreeMap<RangeVectorKey, BTreeMap<i64, RowValue>> = BTreeMap::new();
    let mut template: Option<QueryResult> = None;
    for mut result in results {
        let vectors = std::mem::take(&mut result.range_vectors);
        if template.is_none() {
            template = Some(result);
        }
        for rv in vectors {
            let (key, _, rows) = rv.collect_rows();
            let group = merged.entry(key).or_default();
            for row in rows {
                match group.entry(row.timestamp_ms) {
                    std::collections::btree_map::Entry::Vacant(slot) => {
                        slot.insert(row.value);
                    }
                    std::collections::btree_map::Entry::Occupied(mut slot) => {
                        merge_partials(operator, params, slot.get_mut(), row.value);
                    }
                }
            }
        }
    }
    let mut out = template.ok_or_else(|| QueryError::internal("reduce over zero children"))?;
    out.range_vectors = merged
        .into_iter()
        .map(|(key, by_ts)| {
            let rows = by_ts
                .into_iter()
                .map(|(ts, value)| Row {
                    timestamp_ms: ts,
                    value,
                })
                .collect();
            RangeVector::buffered(key, rows, None)
        })
        .collect();
    Ok(out)
}

/// Finalize partial rows into presentable values.
pub fn present(
    operator: AggregationOperator,
    params: &[AggParam],
    result: QueryResult,
) -> Result<QueryResult, QueryError> {
    match operator {
        AggregationOperator::TopK | AggregationOperator::BottomK => present_topk(result),
        AggregationOperator::CountValues => present_count_values(params, result),
        _ => {
            let range_vectors = result
                .range_vectors
                .into_iter()
                .map(|rv| {
                    let (key, output_range, rows) = rv.collect_rows();
                    let finalized = rows
                        .into_iter()
                        .map(|row| Row::double(row.timestamp_ms, finalize_value(operator, params, row.value)))
                        .collect();
                    RangeVector::buffered(key, finalized, output_range)
                })
                .collect();
            Ok(QueryResult {
                range_vectors,
                ..result
            })
        }
    }
}

fn finalize_value(operator: AggregationOperator, params: &[AggParam], value: RowValue) -> f64 {
    match (operator, value) {
        (AggregationOperator::Avg, RowValue::AvgPartial { sum, count }) => {
            if count > 0.0 {
                sum / count
            } else {
                f64::NAN
            }
        }
        (AggregationOperator::Stddev, RowValue::StdPartial { count, m2, .. }) => {
            if count > 0.0 {
                (m2 / count).sqrt()
            } else {
                f64::NAN
            }
        }
        (AggregationOperator::Stdvar, RowValue::StdPartial { count, m2, .. }) => {
            if count > 0.0 {
                m2 / count
            } else {
                f64::NAN
            }
        }
        (AggregationOperator::Quantile, RowValue::QuantilePartial(mut values)) => {
            let q = match params.first() {
                Some(AggParam::Number(n)) => *n,
                _ => return f64::NAN,
            };
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            quantile_sorted(&values, q)
        }
        (_, RowValue::Double(v)) => v,
        (_, other) => other.as_double(),
    }
}

/// Explode topk candidate sets back into one vector per winning series.
fn present_topk(result: QueryResult) -> Result<QueryResult, QueryError> {
    let mut winners: BTreeMap<RangeVectorKey, Vec<Row>> = BTreeMap::new();
    for rv in result.range_vectors {
        let (_, _, rows) = rv.collect_rows();
        for row in rows {
            if let RowValue::TopkPartial(candidates) = row.value {
                for (encoded_key, value) in candidates {
                    let labels: LabelSet = serde_json::from_str(&encoded_key)
                        .map_err(|e| QueryError::internal(format!("key decode: {e}")))?;
                    winners
                        .entry(RangeVectorKey::new(labels))
                        .or_default()
                        .push(Row::double(row.timestamp_ms, value));
                }
            }
        }
    }
    let range_vectors = winners
        .into_iter()
        .map(|(key, rows)| RangeVector::buffered(key, rows, None))
        .collect();
    Ok(QueryResult {
        range_vectors,
        ..result
    })
}

/// One vector per distinct value, labeled with the count_values label.
fn present_count_values(
    params: &[AggParam],
    result: QueryResult,
) -> Result<QueryResult, QueryError> {
    let label = match params.first() {
        Some(AggParam::Text(label)) => label.clone(),
        _ => return Err(QueryError::bad_query("count_values needs a label parameter")),
    };
    let mut per_value: BTreeMap<RangeVectorKey, Vec<Row>> = BTreeMap::new();
    for rv in result.range_vectors {
        let (base_key, _, rows) = rv.collect_rows();
        for row in rows {
            if let RowValue::CountValuesPartial(counts) = row.value {
                for (rendered, n) in counts {
                    let mut labels = base_key.labels.clone();
                    labels.insert(label.clone(), rendered);
                    per_value
                        .entry(RangeVectorKey::new(labels))
                        .or_default()
                        .push(Row::double(row.timestamp_ms, n));
                }
            }
        }
    }
    let range_vectors = per_value
        .into_iter()
        .map(|(key, rows)| RangeVector::buffered(key, rows, None))
        .collect();
    Ok(QueryResult {
        range_vectors,
        ..result
    })
}

fn format_count_value(value: f64) -> String {
    if value == value.trunc() && value.is_finite() {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::result::{QueryStatsSnapshot, ResultSchema};

    fn key(pairs: &[(&str, &str)]) -> RangeVectorKey {
        RangeVectorKey::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn result_with(rvs: Vec<RangeVector>) -> QueryResult {
        QueryResult {
            id: "q".into(),
            schema: ResultSchema::sample_schema(),
            range_vectors: rvs,
            stats: QueryStatsSnapshot::default(),
            partial: false,
            partial_reason: None,
        }
    }

    fn series(pairs: &[(&str, &str)], rows: &[(i64, f64)]) -> RangeVector {
        RangeVector::buffered(
            key(pairs),
            rows.iter().map(|&(t, v)| Row::double(t, v)).collect(),
            None,
        )
    }

    fn finalize(
        op: AggregationOperator,
        params: &[AggParam],
        grouping: &Grouping,
        input: Vec<RangeVector>,
    ) -> Vec<(RangeVectorKey, Vec<Row>)> {
        let mapped = map_to_partials(op, params, grouping, result_with(input)).unwrap();
        let presented = present(op, params, mapped).unwrap();
        presented
            .range_vectors
            .into_iter()
            .map(|rv| {
                let (k, _, rows) = rv.collect_rows();
                (k, rows)
            })
            .collect()
    }

    #[test]
    fn test_sum_drops_metric_label() {
        let out = finalize(
            AggregationOperator::Sum,
            &[],
            &Grouping::default(),
            vec![
                series(&[("_metric_", "foo"), ("host", "a")], &[(0, 1.0), (10, 2.0)]),
                series(&[("_metric_", "foo"), ("host", "b")], &[(0, 3.0), (10, 4.0)]),
            ],
        );
        assert_eq!(out.len(), 1);
        let (k, rows) = &out[0];
        assert!(k.labels.is_empty());
        assert_eq!(rows[0].value.as_double(), 4.0);
        assert_eq!(rows[1].value.as_double(), 6.0);
    }

    #[test]
    fn test_grouping_by() {
        let grouping = Grouping {
            by: vec!["dc".to_string()],
            without: vec![],
        };
        let out = finalize(
            AggregationOperator::Sum,
            &[],
            &grouping,
            vec![
                series(&[("dc", "east"), ("host", "a")], &[(0, 1.0)]),
                series(&[("dc", "east"), ("host", "b")], &[(0, 2.0)]),
                series(&[("dc", "west"), ("host", "c")], &[(0, 5.0)]),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1[0].value.as_double(), 3.0);
        assert_eq!(out[1].1[0].value.as_double(), 5.0);
    }

    #[test]
    fn test_avg_partial_carries_sum_and_count() {
        let mapped = map_to_partials(
            AggregationOperator::Avg,
            &[],
            &Grouping::default(),
            result_with(vec![
                series(&[("host", "a")], &[(0, 1.0)]),
                series(&[("host", "b")], &[(0, 5.0)]),
            ]),
        )
        .unwrap();
        let (_, _, rows) = mapped.range_vectors.into_iter().next().unwrap().collect_rows();
        assert_eq!(
            rows[0].value,
            RowValue::AvgPartial { sum: 6.0, count: 2.0 }
        );
    }

    #[test]
    fn test_two_level_reduce_equals_one_level() {
        // Property check for the associative operators and avg.
        for op in [
            AggregationOperator::Sum,
            AggregationOperator::Count,
            AggregationOperator::Min,
            AggregationOperator::Max,
            AggregationOperator::Avg,
            AggregationOperator::Stddev,
        ] {
            let make = |values: &[f64]| {
                map_to_partials(
                    op,
                    &[],
                    &Grouping::default(),
                    result_with(
                        values
                            .iter()
                            .enumerate()
                            .map(|(i, v)| {
                                series(&[("host", &format!("h{i}"))], &[(0, *v)])
                            })
                            .collect(),
                    ),
                )
                .unwrap()
            };

            // One level: all four series reduced at once.
            let one = reduce_results(op, &[], vec![make(&[1.0, 2.0, 3.0, 4.0])]).unwrap();
            let one = present(op, &[], one).unwrap();
            let (_, _, one_rows) = one.range_vectors.into_iter().next().unwrap().collect_rows();

            // Two levels: two pairs reduced, then reduced again.
            let left = reduce_results(op, &[], vec![make(&[1.0, 2.0])]).unwrap();
            let right = reduce_results(op, &[], vec![make(&[3.0, 4.0])]).unwrap();
            let two = reduce_results(op, &[], vec![left, right]).unwrap();
            let two = present(op, &[], two).unwrap();
            let (_, _, two_rows) = two.range_vectors.into_iter().next().unwrap().collect_rows();

            let a = one_rows[0].value.as_double();
            let b = two_rows[0].value.as_double();
            assert!((a - b).abs() < 1e-9, "{op:?}: {a} vs {b}");
        }
    }

    #[test]
    fn test_topk_presents_winning_series() {
        let out = finalize(
            AggregationOperator::TopK,
            &[AggParam::Number(2.0)],
            &Grouping::default(),
            vec![
                series(&[("host", "a")], &[(0, 1.0)]),
                series(&[("host", "b")], &[(0, 9.0)]),
                series(&[("host", "c")], &[(0, 5.0)]),
            ],
        );
        assert_eq!(out.len(), 2);
        let hosts: Vec<_> = out
            .iter()
            .map(|(k, _)| k.labels.get("host").unwrap().clone())
            .collect();
        assert!(hosts.contains(&"b".to_string()));
        assert!(hosts.contains(&"c".to_string()));
    }

    #[test]
    fn test_count_values() {
        let out = finalize(
            AggregationOperator::CountValues,
            &[AggParam::Text("code".to_string())],
            &Grouping::default(),
            vec![
                series(&[("host", "a")], &[(0, 200.0)]),
                series(&[("host", "b")], &[(0, 200.0)]),
                series(&[("host", "c")], &[(0, 500.0)]),
            ],
        );
        assert_eq!(out.len(), 2);
        let codes: BTreeMap<String, f64> = out
            .iter()
            .map(|(k, rows)| {
                (
                    k.labels.get("code").unwrap().clone(),
                    rows[0].value.as_double(),
                )
            })
            .collect();
        assert_eq!(codes.get("200"), Some(&2.0));
        assert_eq!(codes.get("500"), Some(&1.0));
    }

    #[test]
    fn test_quantile_exact() {
        let out = finalize(
            AggregationOperator::Quantile,
            &[AggParam::Number(0.5)],
            &Grouping::default(),
            vec![
                series(&[("host", "a")], &[(0, 1.0)]),
                series(&[("host", "b")], &[(0, 2.0)]),
                series(&[("host", "c")], &[(0, 3.0)]),
            ],
        );
        assert_eq!(out[0].1[0].value.as_double(), 2.0);
    }

    #[test]
    fn test_nan_inputs_are_skipped() {
        let out = finalize(
            AggregationOperator::Count,
            &[],
            &Grouping::default(),
            vec![
                series(&[("host", "a")], &[(0, f64::NAN)]),
                series(&[("host", "b")], &[(0, 7.0)]),
            ],
        );
        assert_eq!(out[0].1[0].value.as_double(), 1.0);
    }
}
