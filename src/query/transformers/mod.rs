//! Range-vector transformers.
//!
//! Every non-leaf data operation that reshapes streams without fanning
//! out to children is a transformer attached to an execution node. The
//! node produces its base result, then its transformers apply in order.
//! Transformers are plain data so plan rewrites can inspect and move
//! them.

pub mod aggregation;
pub mod instant_functions;
pub mod periodic;
pub mod range_functions;

pub use aggregation::Grouping;

use crate::error::QueryError;
use crate::query::filter::{ColumnFilter, Filter};
use crate::query::logical::{
    AggParam, AggregationOperator, BinaryOperator, InstantFunctionId, RangeFunctionId,
};
use crate::query::range_vector::{RangeVector, RangeVectorKey, Row, RvRange};
use crate::query::result::QueryResult;
use crate::query::session::QuerySession;
use crate::query::stitch;
use crate::types::{LabelSet, METRIC_COLUMN, PROM_METRIC_LABEL};
use std::collections::BTreeSet;

/// A stream transformation attached to an execution node.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeVectorTransformer {
    /// Resample raw streams onto the query grid, optionally applying a
    /// range function over a sliding window.
    PeriodicSamplesMapper {
        /// First grid point.
        start_ms: i64,
        /// Grid step.
        step_ms: i64,
        /// Last grid point.
        end_ms: i64,
        /// Window width; instant selector semantics when absent.
        window_ms: Option<i64>,
        /// Range function over the window.
        function: Option<RangeFunctionId>,
        /// Extra function arguments.
        function_args: Vec<f64>,
        /// Offset modifier.
        offset_ms: i64,
    },

    /// Pointwise or histogram instant function.
    InstantVectorFunctionMapper {
        /// The function.
        function: InstantFunctionId,
        /// Scalar arguments.
        args: Vec<f64>,
    },

    /// Map stage of an aggregation: fold samples into partial rows.
    AggregateMapReduce {
        /// The operator.
        operator: AggregationOperator,
        /// Operator parameters.
        params: Vec<AggParam>,
        /// Grouping labels.
        grouping: Grouping,
    },

    /// Present stage of an aggregation: finalize partial rows.
    AggregatePresenter {
        /// The operator.
        operator: AggregationOperator,
        /// Operator parameters.
        params: Vec<AggParam>,
    },

    /// Merge same-key streams produced by different tiers or spread
    /// segments.
    StitchRvsMapper,

    /// `absent()`: emit 1 at grid points where the input has no sample.
    AbsentFunctionMapper {
        /// Selector filters, source of the synthesized labels.
        filters: Vec<ColumnFilter>,
        /// Evaluation grid.
        range: RvRange,
    },

    /// Scalar-vector arithmetic or comparison.
    ScalarOperationMapper {
        /// The operator.
        operator: BinaryOperator,
        /// The scalar operand.
        scalar: f64,
        /// Whether the scalar is the left operand.
        scalar_is_lhs: bool,
    },

    /// Finalize merged label-cardinality rows into distinct counts.
    LabelCardinalityPresenter,

    /// Order merged cardinality rows and keep the top k.
    TopkCardPresenter {
        /// How many metrics to keep.
        k: usize,
    },

    /// Tag the result partial; the planner attaches this when it dropped
    /// unavailable shards under `allowPartialResults`.
    PartialResultMarker {
        /// What is missing.
        reason: String,
    },
}

impl RangeVectorTransformer {
    /// Apply this transformation to a result.
    pub fn apply(
        &self,
        result: QueryResult,
        session: &QuerySession,
    ) -> Result<QueryResult, QueryError> {
        match self {
            RangeVectorTransformer::PeriodicSamplesMapper {
                start_ms,
                step_ms,
                end_ms,
                window_ms,
                function,
                function_args,
                offset_ms,
            } => {
                let range = RvRange {
                    start_ms: *start_ms,
                    step_ms: *step_ms,
                    end_ms: *end_ms,
                };
                let lookback = session.query_config.stale_lookback_ms();
                let range_vectors = periodic::resample(
                    result.range_vectors,
                    range,
                    *window_ms,
                    *function,
                    function_args,
                    *offset_ms,
                    lookback,
                );
                Ok(QueryResult {
                    range_vectors,
                    ..result
                })
            }
            RangeVectorTransformer::InstantVectorFunctionMapper { function, args } => {
                instant_functions::apply(*function, args, result)
            }
            RangeVectorTransformer::AggregateMapReduce {
                operator,
                params,
                grouping,
            } => aggregation::map_to_partials(*operator, params, grouping, result),
            RangeVectorTransformer::AggregatePresenter { operator, params } => {
                aggregation::present(*operator, params, result)
            }
            RangeVectorTransformer::StitchRvsMapper => {
                let range_vectors = stitch::stitch(result.range_vectors);
                Ok(QueryResult {
                    range_vectors,
                    ..result
                })
            }
            RangeVectorTransformer::AbsentFunctionMapper { filters, range } => {
                Ok(apply_absent(filters, *range, result))
            }
            RangeVectorTransformer::ScalarOperationMapper {
                operator,
                scalar,
                scalar_is_lhs,
            } => Ok(apply_scalar_op(*operator, *scalar, *scalar_is_lhs, result)),
            RangeVectorTransformer::LabelCardinalityPresenter => {
                aggregation::present(
                    AggregationOperator::CountValues,
                    &[AggParam::Text("_value_".into())],
                    result,
                )
                .map(count_distinct_rows)
            }
            RangeVectorTransformer::TopkCardPresenter { k } => Ok(present_topk_card(*k, result)),
            RangeVectorTransformer::PartialResultMarker { reason } => Ok(QueryResult {
                partial: true,
                partial_reason: Some(reason.clone()),
                ..result
            }),
        }
    }
}

/// Arithmetic result, or `None` when a comparison filters the row out.
/// Comparisons keep the vector-side value, the PromQL filter semantics.
pub fn apply_binary_operator(
    operator: BinaryOperator,
    lhs: f64,
    rhs: f64,
    vector_value: f64,
) -> Option<f64> {
    match operator {
        BinaryOperator::Add => Some(lhs + rhs),
        BinaryOperator::Sub => Some(lhs - rhs),
        BinaryOperator::Mul => Some(lhs * rhs),
        BinaryOperator::Div => Some(lhs / rhs),
        BinaryOperator::Mod => Some(lhs % rhs),
        BinaryOperator::Pow => Some(lhs.powf(rhs)),
        BinaryOperator::Eql => (lhs == rhs).then_some(vector_value),
        BinaryOperator::Neq => (lhs != rhs).then_some(vector_value),
        BinaryOperator::Gtr => (lhs > rhs).then_some(vector_value),
        BinaryOperator::Lss => (lhs < rhs).then_some(vector_value),
        BinaryOperator::Gte => (lhs >= rhs).then_some(vector_value),
        BinaryOperator::Lte => (lhs <= rhs).then_some(vector_value),
    }
}

fn apply_scalar_op(
    operator: BinaryOperator,
    scalar: f64,
    scalar_is_lhs: bool,
    result: QueryResult,
) -> QueryResult {
    let range_vectors = result
        .range_vectors
        .into_iter()
        .map(|rv| {
            let (mut key, output_range, rows) = rv.collect_rows();
            // Arithmetic drops the metric identity.
            if !operator.is_comparison() {
                key = key.without(&[METRIC_COLUMN.to_string(), PROM_METRIC_LABEL.to_string()]);
            }
            let mapped = rows
                .into_iter()
                .filter_map(|row| {
                    let v = row.value.as_double();
                    let (lhs, rhs) = if scalar_is_lhs { (scalar, v) } else { (v, scalar) };
                    apply_binary_operator(operator, lhs, rhs, v)
                        .map(|out| Row::double(row.timestamp_ms, out))
                })
                .collect();
            RangeVector::buffered(key, mapped, output_range)
        })
        .collect();
    QueryResult {
        range_vectors,
        ..result
    }
}

fn apply_absent(filters: &[ColumnFilter], range: RvRange, result: QueryResult) -> QueryResult {
    // Which grid points have at least one sample anywhere in the input.
    let mut present: BTreeSet<i64> = BTreeSet::new();
    for rv in result.range_vectors {
        let (_, _, rows) = rv.collect_rows();
        present.extend(rows.into_iter().map(|r| r.timestamp_ms));
    }

    let mut labels = LabelSet::new();
    for cf in filters {
        if cf.column == METRIC_COLUMN || cf.column == PROM_METRIC_LABEL {
            continue;
        }
        if let Filter::Equals(value) = &cf.filter {
            labels.insert(cf.column.clone(), value.clone());
        }
    }

    let rows: Vec<Row> = range
        .grid()
        .filter(|ts| !present.contains(ts))
        .map(|ts| Row::double(ts, 1.0))
        .collect();

    let range_vectors = if rows.is_empty() {
        Vec::new()
    } else {
        vec![RangeVector::buffered(
            RangeVectorKey::new(labels),
            rows,
            Some(range),
        )]
    };
    QueryResult {
        range_vectors,
        ..result
    }
}

/// Replace merged distinct-value rows with their counts.
fn count_distinct_rows(result: QueryResult) -> QueryResult {
    let mut counts: std::collections::BTreeMap<RangeVectorKey, usize> =
        std::collections::BTreeMap::new();
    for rv in result.range_vectors {
        let (key, _, rows) = rv.collect_rows();
        let label_key = key.without(&["_value_".to_string()]);
        *counts.entry(label_key).or_default() += rows.len().max(1);
    }
    let range_vectors = counts
        .into_iter()
        .map(|(key, n)| RangeVector::buffered(key, vec![Row::double(0, n as f64)], None))
        .collect();
    QueryResult {
        range_vectors,
        ..result
    }
}

fn present_topk_card(k: usize, result: QueryResult) -> QueryResult {
    let mut entries: Vec<(RangeVectorKey, f64)> = result
        .range_vectors
        .into_iter()
        .map(|rv| {
            let (key, _, rows) = rv.collect_rows();
            let count = rows.iter().map(|r| r.value.as_double()).sum();
            (key, count)
        })
        .collect();
    entries.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    entries.truncate(k);
    let range_vectors = entries
        .into_iter()
        .map(|(key, count)| RangeVector::buffered(key, vec![Row::double(0, count)], None))
        .collect();
    QueryResult {
        range_vectors,
        ..result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::query::result::{QueryStatsSnapshot, ResultSchema};
    use crate::query::session::QueryContext;
    use std::sync::Arc;

    fn session() -> QuerySession {
        QuerySession::new(QueryContext::new("q"), Arc::new(QueryConfig::default()))
    }

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

    #[test]
    fn test_scalar_multiply_drops_metric() {
        let rv = RangeVector::buffered(
            key(&[("_metric_", "foo"), ("host", "a")]),
            vec![Row::double(0, 4.0)],
            None,
        );
        let mapper = RangeVectorTransformer::ScalarOperationMapper {
            operator: BinaryOperator::Mul,
            scalar: 2.0,
            scalar_is_lhs: false,
        };
        let out = mapper.apply(result_with(vec![rv]), &session()).unwrap();
        let (k, _, rows) = out.range_vectors.into_iter().next().unwrap().collect_rows();
        assert!(!k.labels.contains_key("_metric_"));
        assert_eq!(rows[0].value.as_double(), 8.0);
    }

    #[test]
    fn test_scalar_comparison_filters() {
        let rv = RangeVector::buffered(
            key(&[("host", "a")]),
            vec![Row::double(0, 4.0), Row::double(1, 10.0)],
            None,
        );
        let mapper = RangeVectorTransformer::ScalarOperationMapper {
            operator: BinaryOperator::Gtr,
            scalar: 5.0,
            scalar_is_lhs: false,
        };
        let out = mapper.apply(result_with(vec![rv]), &session()).unwrap();
        let (_, _, rows) = out.range_vectors.into_iter().next().unwrap().collect_rows();
        assert_eq!(rows, vec![Row::double(1, 10.0)]);
    }

    #[test]
    fn test_absent_emits_where_input_missing() {
        let rv = RangeVector::buffered(key(&[("host", "a")]), vec![Row::double(10, 1.0)], None);
        let mapper = RangeVectorTransformer::AbsentFunctionMapper {
            filters: vec![ColumnFilter::equals("job", "api")],
            range: RvRange {
                start_ms: 0,
                step_ms: 10,
                end_ms: 20,
            },
        };
        let out = mapper.apply(result_with(vec![rv]), &session()).unwrap();
        let (k, _, rows) = out.range_vectors.into_iter().next().unwrap().collect_rows();
        assert_eq!(k.labels.get("job").map(String::as_str), Some("api"));
        assert_eq!(rows, vec![Row::double(0, 1.0), Row::double(20, 1.0)]);
    }

    #[test]
    fn test_absent_empty_when_fully_present() {
        let rv = RangeVector::buffered(
            key(&[("host", "a")]),
            vec![Row::double(0, 1.0), Row::double(10, 1.0)],
            None,
        );
        let mapper = RangeVectorTransformer::AbsentFunctionMapper {
            filters: vec![],
            range: RvRange {
                start_ms: 0,
                step_ms: 10,
                end_ms: 10,
            },
        };
        let out = mapper.apply(result_with(vec![rv]), &session()).unwrap();
        assert!(out.range_vectors.is_empty());
    }

    #[test]
    fn test_topk_card_presenter_orders_and_truncates() {
        let rvs = vec![
            RangeVector::buffered(key(&[("_metric_", "a")]), vec![Row::double(0, 3.0)], None),
            RangeVector::buffered(key(&[("_metric_", "b")]), vec![Row::double(0, 9.0)], None),
            RangeVector::buffered(key(&[("_metric_", "c")]), vec![Row::double(0, 5.0)], None),
        ];
        let mapper = RangeVectorTransformer::TopkCardPresenter { k: 2 };
        let out = mapper.apply(result_with(rvs), &session()).unwrap();
        let metrics: Vec<String> = out
            .range_vectors
            .into_iter()
            .map(|rv| rv.key.labels.get("_metric_").unwrap().clone())
            .collect();
        assert_eq!(metrics, vec!["b".to_string(), "c".to_string()]);
    }
}
