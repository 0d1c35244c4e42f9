//! Vector-vector binary joins and set operators.
//!
//! Matching follows the `on`/`ignoring` modifiers: the join key of a
//! series is either its projection onto `on` or its label set minus
//! `ignoring` and the metric. Cardinality is enforced: the one side of a
//! many-to-one join must be unique per join key, and one-to-one joins
//! must be unique on both sides.

use crate::error::QueryError;
use crate::query::logical::{BinaryOperator, Cardinality, SetOperator};
use crate::query::range_vector::{RangeVector, RangeVectorKey, Row};
use crate::query::result::{reduce_schemas, QueryResult};
use crate::query::transformers::apply_binary_operator;
use crate::types::{METRIC_COLUMN, PROM_METRIC_LABEL};
use std::collections::{BTreeMap, HashMap};

/// Join-key projection under `on`/`ignoring`.
fn join_key(key: &RangeVectorKey, on: &[String], ignoring: &[String]) -> RangeVectorKey {
    if !on.is_empty() {
        key.project_on(on)
    } else {
        let mut dropped = ignoring.to_vec();
        dropped.push(METRIC_COLUMN.to_string());
        dropped.push(PROM_METRIC_LABEL.to_string());
        key.without(&dropped)
    }
}

struct Side {
    /// join key -> series (key, rows by timestamp)
    groups: HashMap<RangeVectorKey, Vec<(RangeVectorKey, BTreeMap<i64, f64>)>>,
}

fn materialize_side(result: QueryResult, on: &[String], ignoring: &[String]) -> Side {
    let mut groups: HashMap<RangeVectorKey, Vec<(RangeVectorKey, BTreeMap<i64, f64>)>> =
        HashMap::new();
    for rv in result.range_vectors {
        let jk = join_key(&rv.key, on, ignoring);
        let (key, _, rows) = rv.collect_rows();
        let by_ts = rows
            .into_iter()
            .map(|r| (r.timestamp_ms, r.value.as_double()))
            .collect();
        groups.entry(jk).or_default().push((key, by_ts));
    }
    Side { groups }
}

/// `BinaryJoinExec`: arithmetic or comparison between two vectors.
#[allow(clippy::too_many_arguments)]
pub fn execute_binary_join(
    operator: BinaryOperator,
    cardinality: Cardinality,
    on: &[String],
    ignoring: &[String],
    include: &[String],
    lhs: QueryResult,
    rhs: QueryResult,
) -> Result<QueryResult, QueryError> {
    let schema = reduce_schemas(&lhs.schema, &rhs.schema)?;
    let id = lhs.id.clone();
    let stats = lhs.stats;
    let partial = lhs.partial || rhs.partial;
    let partial_reason = lhs.partial_reason.clone().or_else(|| rhs.partial_reason.clone());

    // Normalize so the many side is always on the left.
    let (many, one, operator_flipped) = match cardinality {
        Cardinality::OneToMany => (rhs, lhs, true),
        _ => (lhs, rhs, false),
    };
    let many_side = materialize_side(many, on, ignoring);
    let one_side = materialize_side(one, on, ignoring);

    // Uniqueness checks per cardinality.
    for (jk, series) in &one_side.groups {
        if series.len() > 1 {
            return Err(QueryError::bad_query(format!(
                "multiple series match on the one side of the join for key {jk}"
            )));
        }
    }
    if cardinality == Cardinality::OneToOne {
        for (jk, series) in &many_side.groups {
            if series.len() > 1 {
                return Err(QueryError::bad_query(format!(
                    "many-to-many match for key {jk}; use group_left/group_right"
                )));
            }
        }
    }

    let mut range_vectors = Vec::new();
    for (jk, many_series) in many_side.groups {
        let Some((one_key, one_rows)) = one_side.groups.get(&jk).and_then(|v| v.first()) else {
            continue;
        };
        for (many_key, many_rows) in many_series {
            let mut rows = Vec::new();
            for (&ts, &many_v) in &many_rows {
                let Some(&one_v) = one_rows.get(&ts) else {
                    continue;
                };
                let (l, r) = if operator_flipped {
                    (one_v, many_v)
                } else {
                    (many_v, one_v)
                };
                // Comparisons keep the left operand's value.
                if let Some(v) = apply_binary_operator(operator, l, r, l) {
                    rows.push(Row::double(ts, v));
                }
            }
            if rows.is_empty() {
                continue;
            }
            let result_key = result_labels(
                cardinality,
                operator,
                &many_key,
                one_key,
                &jk,
                on,
                ignoring,
                include,
            );
            range_vectors.push(RangeVector::buffered(result_key, rows, None));
        }
    }

    Ok(QueryResult {
        id,
        schema,
        range_vectors,
        stats,
        partial,
        partial_reason,
    })
}

/// Output labels of one joined series.
#[allow(clippy::too_many_arguments)]
fn result_labels(
    cardinality: Cardinality,
    operator: BinaryOperator,
    many_key: &RangeVectorKey,
    one_key: &RangeVectorKey,
    jk: &RangeVectorKey,
    on: &[String],
    ignoring: &[String],
    include: &[String],
) -> RangeVectorKey {
    match cardinality {
        Cardinality::OneToOne => {
            if operator.is_comparison() {
                // Comparisons keep the full left labels.
                many_key.clone()
            } else if !on.is_empty() {
                jk.clone()
            } else {
                let mut dropped = ignoring.to_vec();
                dropped.push(METRIC_COLUMN.to_string());
                dropped.push(PROM_METRIC_LABEL.to_string());
                many_key.without(&dropped)
            }
        }
        _ => {
            // The many side keeps its identity; include labels come over
            // from the one side.
            let mut labels = many_key
                .without(&[METRIC_COLUMN.to_string(), PROM_METRIC_LABEL.to_string()])
                .labels;
            for name in include {
                if let Some(value) = one_key.labels.get(name) {
                    labels.insert(name.clone(), value.clone());
                }
            }
            RangeVectorKey::new(labels)
        }
    }
}

/// `SetOperatorExec`: `and`, `or`, `unless`.
pub fn execute_set_operator(
    operator: SetOperator,
    on: &[String],
    ignoring: &[String],
    lhs: QueryResult,
    rhs: QueryResult,
) -> Result<QueryResult, QueryError> {
    let schema = reduce_schemas(&lhs.schema, &rhs.schema)?;
    let id = lhs.id.clone();
    let stats = lhs.stats;
    let partial = lhs.partial || rhs.partial;
    let partial_reason = lhs.partial_reason.clone().or_else(|| rhs.partial_reason.clone());

    let lhs_side = materialize_side(lhs, on, ignoring);
    let rhs_side = materialize_side(rhs, on, ignoring);

    let mut range_vectors = Vec::new();
    match operator {
        SetOperator::And => {
            for (jk, series) in lhs_side.groups {
                let Some(rhs_series) = rhs_side.groups.get(&jk) else {
                    continue;
                };
                for (key, rows) in series {
                    let kept: Vec<Row> = rows
                        .into_iter()
                        .filter(|(ts, _)| rhs_series.iter().any(|(_, r)| r.contains_key(ts)))
                        .map(|(ts, v)| Row::double(ts, v))
                        .collect();
                    if !kept.is_empty() {
                        range_vectors.push(RangeVector::buffered(key, kept, None));
                    }
                }
            }
        }
        SetOperator::Unless => {
            for (jk, series) in lhs_side.groups {
                let rhs_series = rhs_side.groups.get(&jk);
                for (key, rows) in series {
                    let kept: Vec<Row> = rows
                        .into_iter()
                        .filter(|(ts, _)| {
                            rhs_series
                                .map(|group| !group.iter().any(|(_, r)| r.contains_key(ts)))
                                .unwrap_or(true)
                        })
                        .map(|(ts, v)| Row::double(ts, v))
                        .collect();
                    if !kept.is_empty() {
                        range_vectors.push(RangeVector::buffered(key, kept, None));
                    }
                }
            }
        }
        SetOperator::Or => {
            let lhs_keys: std::collections::HashSet<RangeVectorKey> =
                lhs_side.groups.keys().cloned().collect();
            for (_, series) in lhs_side.groups {
                for (key, rows) in series {
                    let rows = rows.into_iter().map(|(t, v)| Row::double(t, v)).collect();
                    range_vectors.push(RangeVector::buffered(key, rows, None));
                }
            }
            for (jk, series) in rhs_side.groups {
                if lhs_keys.contains(&jk) {
                    continue;
                }
                for (key, rows) in series {
                    let rows = rows.into_iter().map(|(t, v)| Row::double(t, v)).collect();
                    range_vectors.push(RangeVector::buffered(key, rows, None));
                }
            }
        }
    }

    Ok(QueryResult {
        id,
        schema,
        range_vectors,
        stats,
        partial,
        partial_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::result::{QueryStatsSnapshot, ResultSchema};
    use crate::types::LabelSet;

    fn key(pairs: &[(&str, &str)]) -> RangeVectorKey {
        RangeVectorKey::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<LabelSet>(),
        )
    }

    fn series(pairs: &[(&str, &str)], rows: &[(i64, f64)]) -> RangeVector {
        RangeVector::buffered(
            key(pairs),
            rows.iter().map(|&(t, v)| Row::double(t, v)).collect(),
            None,
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

    fn drain(result: QueryResult) -> Vec<(RangeVectorKey, Vec<(i64, f64)>)> {
        result
            .range_vectors
            .into_iter()
            .map(|rv| {
                let (k, _, rows) = rv.collect_rows();
                (
                    k,
                    rows.into_iter()
                        .map(|r| (r.timestamp_ms, r.value.as_double()))
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_one_to_one_division() {
        let lhs = result_with(vec![series(
            &[("_metric_", "used"), ("host", "a")],
            &[(0, 50.0), (10, 80.0)],
        )]);
        let rhs = result_with(vec![series(
            &[("_metric_", "total"), ("host", "a")],
            &[(0, 100.0), (10, 100.0)],
        )]);
        let out = execute_binary_join(
            BinaryOperator::Div,
            Cardinality::OneToOne,
            &[],
            &[],
            &[],
            lhs,
            rhs,
        )
        .unwrap();
        let rows = drain(out);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, key(&[("host", "a")]));
        assert_eq!(rows[0].1, vec![(0, 0.5), (10, 0.8)]);
    }

    #[test]
    fn test_join_skips_unmatched_timestamps() {
        let lhs = result_with(vec![series(&[("host", "a")], &[(0, 1.0), (10, 2.0)])]);
        let rhs = result_with(vec![series(&[("host", "a")], &[(10, 10.0)])]);
        let out = execute_binary_join(
            BinaryOperator::Add,
            Cardinality::OneToOne,
            &[],
            &[],
            &[],
            lhs,
            rhs,
        )
        .unwrap();
        let rows = drain(out);
        assert_eq!(rows[0].1, vec![(10, 12.0)]);
    }

    #[test]
    fn test_many_to_one_with_include() {
        let lhs = result_with(vec![
            series(&[("host", "a"), ("mode", "user")], &[(0, 10.0)]),
            series(&[("host", "a"), ("mode", "sys")], &[(0, 30.0)]),
        ]);
        let rhs = result_with(vec![series(
            &[("host", "a"), ("role", "db")],
            &[(0, 2.0)],
        )]);
        let out = execute_binary_join(
            BinaryOperator::Mul,
            Cardinality::ManyToOne,
            &["host".to_string()],
            &[],
            &["role".to_string()],
            lhs,
            rhs,
        )
        .unwrap();
        let rows = drain(out);
        assert_eq!(rows.len(), 2);
        for (k, r) in &rows {
            assert_eq!(k.labels.get("role").map(String::as_str), Some("db"));
            let expected = match k.labels.get("mode").map(String::as_str) {
                Some("user") => 20.0,
                Some("sys") => 60.0,
                other => panic!("unexpected mode {other:?}"),
            };
            assert_eq!(r[0].1, expected);
        }
    }

    #[test]
    fn test_one_to_one_rejects_many_match() {
        let lhs = result_with(vec![
            series(&[("host", "a"), ("mode", "user")], &[(0, 1.0)]),
            series(&[("host", "a"), ("mode", "sys")], &[(0, 2.0)]),
        ]);
        let rhs = result_with(vec![series(&[("host", "a"), ("x", "1")], &[(0, 1.0)])]);
        let err = execute_binary_join(
            BinaryOperator::Add,
            Cardinality::OneToOne,
            &["host".to_string()],
            &[],
            &[],
            lhs,
            rhs,
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::BadQuery(_)));
    }

    #[test]
    fn test_comparison_filters_rows() {
        let lhs = result_with(vec![series(&[("host", "a")], &[(0, 1.0), (10, 9.0)])]);
        let rhs = result_with(vec![series(&[("host", "a")], &[(0, 5.0), (10, 5.0)])]);
        let out = execute_binary_join(
            BinaryOperator::Gtr,
            Cardinality::OneToOne,
            &[],
            &[],
            &[],
            lhs,
            rhs,
        )
        .unwrap();
        let rows = drain(out);
        assert_eq!(rows[0].1, vec![(10, 9.0)]);
    }

    #[test]
    fn test_set_and() {
        let lhs = result_with(vec![
            series(&[("host", "a")], &[(0, 1.0), (10, 2.0)]),
            series(&[("host", "b")], &[(0, 3.0)]),
        ]);
        let rhs = result_with(vec![series(&[("host", "a")], &[(10, 0.0)])]);
        let out = execute_set_operator(SetOperator::And, &[], &[], lhs, rhs).unwrap();
        let rows = drain(out);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, vec![(10, 2.0)]);
    }

    #[test]
    fn test_set_or_keeps_unmatched_rhs() {
        let lhs = result_with(vec![series(&[("host", "a")], &[(0, 1.0)])]);
        let rhs = result_with(vec![
            series(&[("host", "a")], &[(0, 9.0)]),
            series(&[("host", "b")], &[(0, 3.0)]),
        ]);
        let out = execute_set_operator(SetOperator::Or, &[], &[], lhs, rhs).unwrap();
        let rows = drain(out);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_set_unless_drops_matched_timestamps() {
        let lhs = result_with(vec![series(&[("host", "a")], &[(0, 1.0), (10, 2.0)])]);
        let rhs = result_with(vec![series(&[("host", "a")], &[(10, 0.0)])]);
        let out = execute_set_operator(SetOperator::Unless, &[], &[], lhs, rhs).unwrap();
        let rows = drain(out);
        assert_eq!(rows[0].1, vec![(0, 1.0)]);
    }
}
