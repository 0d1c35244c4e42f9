//! Logical query plans.
//!
//! A [`LogicalPlan`] is the parsed, storage-independent form of a query.
//! Planners rewrite and split it, then materialize an executable plan
//! tree from it. The representation is a tagged variant tree of immutable
//! data; rewrites are tree-walks that build new trees.
//!
//! Two rewrites live here because every planner needs them:
//! - [`LogicalPlan::rewrite_labels`] renames filter and grouping columns
//!   (the `__name__` to metric-column rewrite)
//! - [`LogicalPlan::replace_raw_filters`] swaps the leaf filters, used by
//!   the shard-key regex planner to pin expanded key tuples
//!
//! [`LogicalPlan::to_promql`] serializes the accepted subset back to query
//! text so a fragment can be shipped to a remote partition.

use crate::error::QueryError;
use crate::query::filter::{ColumnFilter, Filter};
use crate::types::{TimeRange, METRIC_COLUMN};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Functions applied over a sliding window of raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum RangeFunctionId {
    Rate,
    Increase,
    Delta,
    AvgOverTime,
    MinOverTime,
    MaxOverTime,
    SumOverTime,
    CountOverTime,
    StddevOverTime,
    LastOverTime,
    QuantileOverTime,
    HoltWinters,
    PredictLinear,
    Deriv,
    Changes,
    Resets,
    AbsentOverTime,
}

impl RangeFunctionId {
    /// PromQL spelling.
    pub fn promql_name(&self) -> &'static str {
        match self {
            RangeFunctionId::Rate => "rate",
            RangeFunctionId::Increase => "increase",
            RangeFunctionId::Delta => "delta",
            RangeFunctionId::AvgOverTime => "avg_over_time",
            RangeFunctionId::MinOverTime => "min_over_time",
            RangeFunctionId::MaxOverTime => "max_over_time",
            RangeFunctionId::SumOverTime => "sum_over_time",
            RangeFunctionId::CountOverTime => "count_over_time",
            RangeFunctionId::StddevOverTime => "stddev_over_time",
            RangeFunctionId::LastOverTime => "last_over_time",
            RangeFunctionId::QuantileOverTime => "quantile_over_time",
            RangeFunctionId::HoltWinters => "holt_winters",
            RangeFunctionId::PredictLinear => "predict_linear",
            RangeFunctionId::Deriv => "deriv",
            RangeFunctionId::Changes => "changes",
            RangeFunctionId::Resets => "resets",
            RangeFunctionId::AbsentOverTime => "absent_over_time",
        }
    }
}

/// Pointwise functions on instant vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum InstantFunctionId {
    Abs,
    Ceil,
    Floor,
    Exp,
    Ln,
    Log2,
    Log10,
    Sqrt,
    Round,
    Sgn,
    ClampMin,
    ClampMax,
    HistogramQuantile,
    HistogramMaxQuantile,
    HistogramBucket,
    Hour,
    Minute,
    DayOfMonth,
    DayOfWeek,
    DayOfYear,
    Month,
    Year,
    DaysInMonth,
}

impl InstantFunctionId {
    /// PromQL spelling.
    pub fn promql_name(&self) -> &'static str {
        match self {
            InstantFunctionId::Abs => "abs",
            InstantFunctionId::Ceil => "ceil",
            InstantFunctionId::Floor => "floor",
            InstantFunctionId::Exp => "exp",
            InstantFunctionId::Ln => "ln",
            InstantFunctionId::Log2 => "log2",
            InstantFunctionId::Log10 => "log10",
            InstantFunctionId::Sqrt => "sqrt",
            InstantFunctionId::Round => "round",
            InstantFunctionId::Sgn => "sgn",
            InstantFunctionId::ClampMin => "clamp_min",
            InstantFunctionId::ClampMax => "clamp_max",
            InstantFunctionId::HistogramQuantile => "histogram_quantile",
            InstantFunctionId::HistogramMaxQuantile => "histogram_max_quantile",
            InstantFunctionId::HistogramBucket => "histogram_bucket",
            InstantFunctionId::Hour => "hour",
            InstantFunctionId::Minute => "minute",
            InstantFunctionId::DayOfMonth => "day_of_month",
            InstantFunctionId::DayOfWeek => "day_of_week",
            InstantFunctionId::DayOfYear => "day_of_year",
            InstantFunctionId::Month => "month",
            InstantFunctionId::Year => "year",
            InstantFunctionId::DaysInMonth => "days_in_month",
        }
    }
}

/// Aggregation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum AggregationOperator {
    Sum,
    Avg,
    Count,
    Group,
    Min,
    Max,
    Stddev,
    Stdvar,
    TopK,
    BottomK,
    CountValues,
    Quantile,
}

impl AggregationOperator {
    /// PromQL spelling.
    pub fn promql_name(&self) -> &'static str {
        match self {
            AggregationOperator::Sum => "sum",
            AggregationOperator::Avg => "avg",
            AggregationOperator::Count => "count",
            AggregationOperator::Group => "group",
            AggregationOperator::Min => "min",
            AggregationOperator::Max => "max",
            AggregationOperator::Stddev => "stddev",
            AggregationOperator::Stdvar => "stdvar",
            AggregationOperator::TopK => "topk",
            AggregationOperator::BottomK => "bottomk",
            AggregationOperator::CountValues => "count_values",
            AggregationOperator::Quantile => "quantile",
        }
    }

    /// Whether a two-level reduce of this operator equals a one-level
    /// reduce. Partial-carrying operators qualify through their partial
    /// representation.
    pub fn is_associative(&self) -> bool {
        !matches!(self, AggregationOperator::CountValues)
    }
}

/// Parameter of an aggregation (`k` for topk, `q` for quantile, the label
/// for count_values).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggParam {
    /// Numeric parameter.
    Number(f64),
    /// Label-name parameter.
    Text(String),
}

/// Arithmetic and comparison operators between vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eql,
    Neq,
    Gtr,
    Lss,
    Gte,
    Lte,
}

impl BinaryOperator {
    /// PromQL spelling.
    pub fn promql_name(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Mod => "%",
            BinaryOperator::Pow => "^",
            BinaryOperator::Eql => "==",
            BinaryOperator::Neq => "!=",
            BinaryOperator::Gtr => ">",
            BinaryOperator::Lss => "<",
            BinaryOperator::Gte => ">=",
            BinaryOperator::Lte => "<=",
        }
    }

    /// Whether the operator filters rather than computes.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eql
                | BinaryOperator::Neq
                | BinaryOperator::Gtr
                | BinaryOperator::Lss
                | BinaryOperator::Gte
                | BinaryOperator::Lte
        )
    }
}

/// Set operators between vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum SetOperator {
    And,
    Or,
    Unless,
}

impl SetOperator {
    /// PromQL spelling.
    pub fn promql_name(&self) -> &'static str {
        match self {
            SetOperator::And => "and",
            SetOperator::Or => "or",
            SetOperator::Unless => "unless",
        }
    }
}

/// Join cardinality of a binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Cardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

/// The logical plan tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    /// Raw chunk scan of every series matching the filters.
    RawSeries {
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Scan window, epoch ms.
        range: TimeRange,
        /// Value column override.
        column: Option<String>,
    },

    /// Instant-selector evaluation on a periodic grid: at each grid point
    /// the latest sample within the staleness lookback.
    PeriodicSeries {
        /// The underlying raw scan.
        raw: Box<LogicalPlan>,
        /// First grid point.
        start_ms: i64,
        /// Grid step.
        step_ms: i64,
        /// Last grid point.
        end_ms: i64,
        /// Offset modifier, ms.
        offset_ms: Option<i64>,
    },

    /// Range-function evaluation over a sliding window on a periodic grid.
    PeriodicSeriesWithWindowing {
        /// The underlying raw scan.
        raw: Box<LogicalPlan>,
        /// First grid point.
        start_ms: i64,
        /// Grid step.
        step_ms: i64,
        /// Last grid point.
        end_ms: i64,
        /// Window width, ms.
        window_ms: i64,
        /// The range function.
        function: RangeFunctionId,
        /// Function arguments beyond the window (quantile q, holt-winters
        /// smoothing factors, predict_linear horizon).
        function_args: Vec<f64>,
        /// Offset modifier, ms.
        offset_ms: Option<i64>,
    },

    /// Subquery `inner[window:step]` with an optional outer range function.
    SubqueryWithWindowing {
        /// The subquery body, itself periodic.
        inner: Box<LogicalPlan>,
        /// Outer range function applied over the subquery window.
        function: RangeFunctionId,
        /// Function arguments.
        function_args: Vec<f64>,
        /// Subquery window, ms.
        window_ms: i64,
        /// Subquery step, ms.
        step_ms: i64,
        /// Offset modifier, ms.
        offset_ms: Option<i64>,
    },

    /// Grouped aggregation.
    Aggregate {
        /// The operator.
        operator: AggregationOperator,
        /// Input plan.
        inner: Box<LogicalPlan>,
        /// Operator parameters.
        params: Vec<AggParam>,
        /// Group by these labels.
        by: Vec<String>,
        /// Group by all labels except these.
        without: Vec<String>,
    },

    /// Vector-vector arithmetic or comparison.
    BinaryJoin {
        /// Left input.
        lhs: Box<LogicalPlan>,
        /// Right input.
        rhs: Box<LogicalPlan>,
        /// The operator.
        operator: BinaryOperator,
        /// Join cardinality.
        cardinality: Cardinality,
        /// Join on these labels only.
        on: Vec<String>,
        /// Join ignoring these labels.
        ignoring: Vec<String>,
        /// Labels copied from the one-side in many-to-one joins.
        include: Vec<String>,
    },

    /// Vector-vector set operation.
    SetOp {
        /// Left input.
        lhs: Box<LogicalPlan>,
        /// Right input.
        rhs: Box<LogicalPlan>,
        /// The operator.
        operator: SetOperator,
        /// Match on these labels only.
        on: Vec<String>,
        /// Match ignoring these labels.
        ignoring: Vec<String>,
    },

    /// Scalar-vector arithmetic.
    ScalarVectorBinaryOperation {
        /// The scalar operand.
        scalar: f64,
        /// The vector operand.
        vector: Box<LogicalPlan>,
        /// The operator.
        operator: BinaryOperator,
        /// Whether the scalar is the left operand.
        scalar_is_lhs: bool,
    },

    /// Pointwise instant function.
    ApplyInstantFunction {
        /// Input plan.
        vectors: Box<LogicalPlan>,
        /// The function.
        function: InstantFunctionId,
        /// Scalar arguments.
        args: Vec<f64>,
    },

    /// `absent()` over an instant vector.
    ApplyAbsentFunction {
        /// Input plan.
        vectors: Box<LogicalPlan>,
        /// Filters of the selector, for the synthesized labels.
        filters: Vec<ColumnFilter>,
        /// Evaluation grid.
        start_ms: i64,
        /// Grid step.
        step_ms: i64,
        /// Last grid point.
        end_ms: i64,
    },

    /// Metadata: distinct values of labels among matching series.
    LabelValues {
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Labels to report.
        label_names: Vec<String>,
        /// Window start.
        start_ms: i64,
        /// Window end.
        end_ms: i64,
    },

    /// Metadata: distinct label names among matching series.
    LabelNames {
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Window start.
        start_ms: i64,
        /// Window end.
        end_ms: i64,
    },

    /// Metadata: part keys of matching series.
    SeriesKeysByFilters {
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Window start.
        start_ms: i64,
        /// Window end.
        end_ms: i64,
    },

    /// Metadata: distinct-value count per label.
    LabelCardinality {
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Window start.
        start_ms: i64,
        /// Window end.
        end_ms: i64,
    },

    /// Metadata: top-k metrics by series count under a shard-key prefix.
    TopkCardinality {
        /// Shard-key column values, in column order.
        shard_key_prefix: Vec<String>,
        /// How many metrics to report.
        k: usize,
        /// Count series outside retention too.
        include_inactive: bool,
    },
}

impl LogicalPlan {
    /// Whether this is a metadata plan (no sample rows).
    pub fn is_metadata(&self) -> bool {
        matches!(
            self,
            LogicalPlan::LabelValues { .. }
                | LogicalPlan::LabelNames { .. }
                | LogicalPlan::SeriesKeysByFilters { .. }
                | LogicalPlan::LabelCardinality { .. }
                | LogicalPlan::TopkCardinality { .. }
        )
    }

    /// The evaluation time range of the plan: the periodic grid for data
    /// plans, the metadata window for metadata plans.
    pub fn query_time_range(&self) -> TimeRange {
        match self {
            LogicalPlan::RawSeries { range, .. } => *range,
            LogicalPlan::PeriodicSeries {
                start_ms, end_ms, ..
            }
            | LogicalPlan::PeriodicSeriesWithWindowing {
                start_ms, end_ms, ..
            }
            | LogicalPlan::ApplyAbsentFunction {
                start_ms, end_ms, ..
            }
            | LogicalPlan::LabelValues {
                start_ms, end_ms, ..
            }
            | LogicalPlan::LabelNames {
                start_ms, end_ms, ..
            }
            | LogicalPlan::SeriesKeysByFilters {
                start_ms, end_ms, ..
            }
            | LogicalPlan::LabelCardinality {
                start_ms, end_ms, ..
            } => TimeRange::new(*start_ms, *end_ms),
            LogicalPlan::SubqueryWithWindowing { inner, .. } => inner.query_time_range(),
            LogicalPlan::Aggregate { inner, .. } => inner.query_time_range(),
            LogicalPlan::ApplyInstantFunction { vectors, .. } => vectors.query_time_range(),
            LogicalPlan::ScalarVectorBinaryOperation { vector, .. } => vector.query_time_range(),
            LogicalPlan::BinaryJoin { lhs, .. } | LogicalPlan::SetOp { lhs, .. } => {
                lhs.query_time_range()
            }
            LogicalPlan::TopkCardinality { .. } => TimeRange::new(0, i64::MAX),
        }
    }

    /// Filters of the first raw leaf, empty for metadata-only plans.
    pub fn leaf_filters(&self) -> Vec<ColumnFilter> {
        match self {
            LogicalPlan::RawSeries { filters, .. }
            | LogicalPlan::LabelValues { filters, .. }
            | LogicalPlan::LabelNames { filters, .. }
            | LogicalPlan::SeriesKeysByFilters { filters, .. }
            | LogicalPlan::LabelCardinality { filters, .. } => filters.clone(),
            LogicalPlan::PeriodicSeries { raw, .. }
            | LogicalPlan::PeriodicSeriesWithWindowing { raw, .. } => raw.leaf_filters(),
            LogicalPlan::SubqueryWithWindowing { inner, .. } => inner.leaf_filters(),
            LogicalPlan::Aggregate { inner, .. } => inner.leaf_filters(),
            LogicalPlan::ApplyInstantFunction { vectors, .. }
            | LogicalPlan::ApplyAbsentFunction { vectors, .. } => vectors.leaf_filters(),
            LogicalPlan::ScalarVectorBinaryOperation { vector, .. } => vector.leaf_filters(),
            LogicalPlan::BinaryJoin { lhs, .. } | LogicalPlan::SetOp { lhs, .. } => {
                lhs.leaf_filters()
            }
            LogicalPlan::TopkCardinality { .. } => Vec::new(),
        }
    }

    /// Filters of every raw leaf in the tree.
    pub fn all_leaf_filters(&self) -> Vec<Vec<ColumnFilter>> {
        let mut out = Vec::new();
        self.visit_leaves(&mut |filters| out.push(filters.to_vec()));
        out
    }

    fn visit_leaves(&self, visit: &mut impl FnMut(&[ColumnFilter])) {
        match self {
            LogicalPlan::RawSeries { filters, .. }
            | LogicalPlan::LabelValues { filters, .. }
            | LogicalPlan::LabelNames { filters, .. }
            | LogicalPlan::SeriesKeysByFilters { filters, .. }
            | LogicalPlan::LabelCardinality { filters, .. } => visit(filters),
            LogicalPlan::PeriodicSeries { raw, .. }
            | LogicalPlan::PeriodicSeriesWithWindowing { raw, .. } => raw.visit_leaves(visit),
            LogicalPlan::SubqueryWithWindowing { inner, .. } => inner.visit_leaves(visit),
            LogicalPlan::Aggregate { inner, .. } => inner.visit_leaves(visit),
            LogicalPlan::ApplyInstantFunction { vectors, .. }
            | LogicalPlan::ApplyAbsentFunction { vectors, .. } => vectors.visit_leaves(visit),
            LogicalPlan::ScalarVectorBinaryOperation { vector, .. } => vector.visit_leaves(visit),
            LogicalPlan::BinaryJoin { lhs, rhs, .. } | LogicalPlan::SetOp { lhs, rhs, .. } => {
                lhs.visit_leaves(visit);
                rhs.visit_leaves(visit);
            }
            LogicalPlan::TopkCardinality { .. } => {}
        }
    }

    /// Rename label columns everywhere they appear: filters, `by`,
    /// `without`, `on`, `ignoring` and `include` lists.
    pub fn rewrite_labels(&self, mapping: &HashMap<String, String>) -> LogicalPlan {
        let rename = |name: &String| -> String {
            mapping.get(name).cloned().unwrap_or_else(|| name.clone())
        };
        let rename_list =
            |names: &[String]| -> Vec<String> { names.iter().map(|n| rename(n)).collect() };
        let rename_filters = |filters: &[ColumnFilter]| -> Vec<ColumnFilter> {
            filters
                .iter()
                .map(|cf| ColumnFilter::new(rename(&cf.column), cf.filter.clone()))
                .collect()
        };

        match self {
            LogicalPlan::RawSeries {
                filters,
                range,
                column,
            } => LogicalPlan::RawSeries {
                filters: rename_filters(filters),
                range: *range,
                column: column.clone(),
            },
            LogicalPlan::PeriodicSeries {
                raw,
                start_ms,
                step_ms,
                end_ms,
                offset_ms,
            } => LogicalPlan::PeriodicSeries {
                raw: Box::new(raw.rewrite_labels(mapping)),
                start_ms: *start_ms,
                step_ms: *step_ms,
                end_ms: *end_ms,
                offset_ms: *offset_ms,
            },
            LogicalPlan::PeriodicSeriesWithWindowing {
                raw,
                start_ms,
                step_ms,
                end_ms,
                window_ms,
                function,
                function_args,
                offset_ms,
            } => LogicalPlan::PeriodicSeriesWithWindowing {
                raw: Box::new(raw.rewrite_labels(mapping)),
                start_ms: *start_ms,
                step_ms: *step_ms,
                end_ms: *end_ms,
                window_ms: *window_ms,
                function: *function,
                function_args: function_args.clone(),
                offset_ms: *offset_ms,
            },
            LogicalPlan::SubqueryWithWindowing {
                inner,
                function,
                function_args,
                window_ms,
                step_ms,
                offset_ms,
            } => LogicalPlan::SubqueryWithWindowing {
                inner: Box::new(inner.rewrite_labels(mapping)),
                function: *function,
                function_args: function_args.clone(),
                window_ms: *window_ms,
                step_ms: *step_ms,
                offset_ms: *offset_ms,
            },
            LogicalPlan::Aggregate {
                operator,
                inner,
                params,
                by,
                without,
            } => LogicalPlan::Aggregate {
                operator: *operator,
                inner: Box::new(inner.rewrite_labels(mapping)),
                params: params.clone(),
                by: rename_list(by),
                without: rename_list(without),
            },
            LogicalPlan::BinaryJoin {
                lhs,
                rhs,
                operator,
                cardinality,
                on,
                ignoring,
                include,
            } => LogicalPlan::BinaryJoin {
                lhs: Box::new(lhs.rewrite_labels(mapping)),
                rhs: Box::new(rhs.rewrite_labels(mapping)),
                operator: *operator,
                cardinality: *cardinality,
                on: rename_list(on),
                ignoring: rename_list(ignoring),
                include: rename_list(include),
            },
            LogicalPlan::SetOp {
                lhs,
                rhs,
                operator,
                on,
                ignoring,
            } => LogicalPlan::SetOp {
                lhs: Box::new(lhs.rewrite_labels(mapping)),
                rhs: Box::new(rhs.rewrite_labels(mapping)),
                operator: *operator,
                on: rename_list(on),
                ignoring: rename_list(ignoring),
            },
            LogicalPlan::ScalarVectorBinaryOperation {
                scalar,
                vector,
                operator,
                scalar_is_lhs,
            } => LogicalPlan::ScalarVectorBinaryOperation {
                scalar: *scalar,
                vector: Box::new(vector.rewrite_labels(mapping)),
                operator: *operator,
                scalar_is_lhs: *scalar_is_lhs,
            },
            LogicalPlan::ApplyInstantFunction {
                vectors,
                function,
                args,
            } => LogicalPlan::ApplyInstantFunction {
                vectors: Box::new(vectors.rewrite_labels(mapping)),
                function: *function,
                args: args.clone(),
            },
            LogicalPlan::ApplyAbsentFunction {
                vectors,
                filters,
                start_ms,
                step_ms,
                end_ms,
            } => LogicalPlan::ApplyAbsentFunction {
                vectors: Box::new(vectors.rewrite_labels(mapping)),
                filters: rename_filters(filters),
                start_ms: *start_ms,
                step_ms: *step_ms,
                end_ms: *end_ms,
            },
            LogicalPlan::LabelValues {
                filters,
                label_names,
                start_ms,
                end_ms,
            } => LogicalPlan::LabelValues {
                filters: rename_filters(filters),
                label_names: rename_list(label_names),
                start_ms: *start_ms,
                end_ms: *end_ms,
            },
            LogicalPlan::LabelNames {
                filters,
                start_ms,
                end_ms,
            } => LogicalPlan::LabelNames {
                filters: rename_filters(filters),
                start_ms: *start_ms,
                end_ms: *end_ms,
            },
            LogicalPlan::SeriesKeysByFilters {
                filters,
                start_ms,
                end_ms,
            } => LogicalPlan::SeriesKeysByFilters {
                filters: rename_filters(filters),
                start_ms: *start_ms,
                end_ms: *end_ms,
            },
            LogicalPlan::LabelCardinality {
                filters,
                start_ms,
                end_ms,
            } => LogicalPlan::LabelCardinality {
                filters: rename_filters(filters),
                start_ms: *start_ms,
                end_ms: *end_ms,
            },
            LogicalPlan::TopkCardinality { .. } => self.clone(),
        }
    }

    /// Replace the filters of every raw leaf with `filters`. Used after
    /// shard-key regex expansion pinned a concrete key tuple.
    pub fn replace_raw_filters(&self, filters: &[ColumnFilter]) -> LogicalPlan {
        match self {
            LogicalPlan::RawSeries { range, column, .. } => LogicalPlan::RawSeries {
                filters: filters.to_vec(),
                range: *range,
                column: column.clone(),
            },
            LogicalPlan::PeriodicSeries {
                raw,
                start_ms,
                step_ms,
                end_ms,
                offset_ms,
            } => LogicalPlan::PeriodicSeries {
                raw: Box::new(raw.replace_raw_filters(filters)),
                start_ms: *start_ms,
                step_ms: *step_ms,
                end_ms: *end_ms,
                offset_ms: *offset_ms,
            },
            LogicalPlan::PeriodicSeriesWithWindowing {
                raw,
                start_ms,
                step_ms,
                end_ms,
                window_ms,
                function,
                function_args,
                offset_ms,
            } => LogicalPlan::PeriodicSeriesWithWindowing {
                raw: Box::new(raw.replace_raw_filters(filters)),
                start_ms: *start_ms,
                step_ms: *step_ms,
                end_ms: *end_ms,
                window_ms: *window_ms,
                function: *function,
                function_args: function_args.clone(),
                offset_ms: *offset_ms,
            },
            LogicalPlan::SubqueryWithWindowing {
                inner,
                function,
                function_args,
                window_ms,
                step_ms,
                offset_ms,
            } => LogicalPlan::SubqueryWithWindowing {
                inner: Box::new(inner.replace_raw_filters(filters)),
                function: *function,
                function_args: function_args.clone(),
                window_ms: *window_ms,
                step_ms: *step_ms,
                offset_ms: *offset_ms,
            },
            LogicalPlan::Aggregate {
                operator,
                inner,
                params,
                by,
                without,
            } => LogicalPlan::Aggregate {
                operator: *operator,
                inner: Box::new(inner.replace_raw_filters(filters)),
                params: params.clone(),
                by: by.clone(),
                without: without.clone(),
            },
            LogicalPlan::ApplyInstantFunction {
                vectors,
                function,
                args,
            } => LogicalPlan::ApplyInstantFunction {
                vectors: Box::new(vectors.replace_raw_filters(filters)),
                function: *function,
                args: args.clone(),
            },
            other => other.clone(),
        }
    }

    /// Serialize back to PromQL text. Metadata plans have no PromQL
    /// rendering and return `BadQuery`.
    pub fn to_promql(&self) -> Result<String, QueryError> {
        match self {
            LogicalPlan::RawSeries { filters, .. } => Ok(render_selector(filters, None, None)),
            LogicalPlan::PeriodicSeries { raw, offset_ms, .. } => match raw.as_ref() {
                LogicalPlan::RawSeries { filters, .. } => {
                    Ok(render_selector(filters, None, *offset_ms))
                }
                other => other.to_promql(),
            },
            LogicalPlan::PeriodicSeriesWithWindowing {
                raw,
                window_ms,
                function,
                function_args,
                offset_ms,
                ..
            } => match raw.as_ref() {
                LogicalPlan::RawSeries { filters, .. } => {
                    let selector = render_selector(filters, Some(*window_ms), *offset_ms);
                    Ok(render_call(function.promql_name(), function_args, selector))
                }
                other => Err(QueryError::internal(format!(
                    "windowed plan over a non-raw input: {other:?}"
                ))),
            },
            LogicalPlan::SubqueryWithWindowing {
                inner,
                function,
                function_args,
                window_ms,
                step_ms,
                offset_ms,
            } => {
                let body = inner.to_promql()?;
                let mut selector = format!(
                    "{}[{}:{}]",
                    body,
                    render_duration(*window_ms),
                    render_duration(*step_ms)
                );
                if let Some(offset) = offset_ms {
                    selector = format!("{} offset {}", selector, render_duration(*offset));
                }
                Ok(render_call(function.promql_name(), function_args, selector))
            }
            LogicalPlan::Aggregate {
                operator,
                inner,
                params,
                by,
                without,
            } => {
                let mut out = operator.promql_name().to_string();
                if !by.is_empty() {
                    out.push_str(&format!(" by ({})", by.join(",")));
                } else if !without.is_empty() {
                    out.push_str(&format!(" without ({})", without.join(",")));
                }
                out.push('(');
                for param in params {
                    match param {
                        AggParam::Number(n) => out.push_str(&format!("{n},")),
                        AggParam::Text(t) => out.push_str(&format!("\"{t}\",")),
                    }
                }
                out.push_str(&inner.to_promql()?);
                out.push(')');
                Ok(out)
            }
            LogicalPlan::BinaryJoin {
                lhs,
                rhs,
                operator,
                cardinality,
                on,
                ignoring,
                include,
            } => {
                let mut out = format!("{} {}", lhs.to_promql()?, operator.promql_name());
                if !on.is_empty() {
                    out.push_str(&format!(" on({})", on.join(",")));
                } else if !ignoring.is_empty() {
                    out.push_str(&format!(" ignoring({})", ignoring.join(",")));
                }
                match cardinality {
                    Cardinality::ManyToOne => {
                        out.push_str(&format!(" group_left({})", include.join(",")))
                    }
                    Cardinality::OneToMany => {
                        out.push_str(&format!(" group_right({})", include.join(",")))
                    }
                    _ => {}
                }
                out.push_str(&format!(" {}", rhs.to_promql()?));
                Ok(out)
            }
            LogicalPlan::SetOp {
                lhs,
                rhs,
                operator,
                on,
                ignoring,
            } => {
                let mut out = format!("{} {}", lhs.to_promql()?, operator.promql_name());
                if !on.is_empty() {
                    out.push_str(&format!(" on({})", on.join(",")));
                } else if !ignoring.is_empty() {
                    out.push_str(&format!(" ignoring({})", ignoring.join(",")));
                }
                out.push_str(&format!(" {}", rhs.to_promql()?));
                Ok(out)
            }
            LogicalPlan::ScalarVectorBinaryOperation {
                scalar,
                vector,
                operator,
                scalar_is_lhs,
            } => {
                let v = vector.to_promql()?;
                if *scalar_is_lhs {
                    Ok(format!("{} {} {}", scalar, operator.promql_name(), v))
                } else {
                    Ok(format!("{} {} {}", v, operator.promql_name(), scalar))
                }
            }
            LogicalPlan::ApplyInstantFunction {
                vectors,
                function,
                args,
            } => Ok(render_call(
                function.promql_name(),
                args,
                vectors.to_promql()?,
            )),
            LogicalPlan::ApplyAbsentFunction { vectors, .. } => {
                Ok(format!("absent({})", vectors.to_promql()?))
            }
            other => Err(QueryError::bad_query(format!(
                "no PromQL rendering for {other:?}"
            ))),
        }
    }
}

/// Render a function call; numeric args precede the vector argument, the
/// quantile convention.
fn render_call(name: &str, args: &[f64], selector: String) -> String {
    let mut out = format!("{name}(");
    for arg in args {
        out.push_str(&format!("{arg},"));
    }
    out.push_str(&selector);
    out.push(')');
    out
}

/// Render a vector selector with optional range and offset.
fn render_selector(filters: &[ColumnFilter], window_ms: Option<i64>, offset_ms: Option<i64>) -> String {
    let mut metric = String::new();
    let mut matchers = Vec::new();
    for cf in filters {
        if cf.column == METRIC_COLUMN {
            if let Filter::Equals(name) = &cf.filter {
                metric = name.clone();
                continue;
            }
        }
        matchers.push(format!("{}{}", cf.column, cf.filter));
    }
    let mut out = metric;
    if !matchers.is_empty() {
        out.push_str(&format!("{{{}}}", matchers.join(",")));
    }
    if let Some(window) = window_ms {
        out.push_str(&format!("[{}]", render_duration(window)));
    }
    if let Some(offset) = offset_ms {
        out.push_str(&format!(" offset {}", render_duration(offset)));
    }
    out
}

/// Render milliseconds as the shortest whole PromQL duration.
fn render_duration(ms: i64) -> String {
    const UNITS: &[(i64, &str)] = &[
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];
    for (unit_ms, suffix) in UNITS {
        if ms >= *unit_ms && ms % unit_ms == 0 {
            return format!("{}{}", ms / unit_ms, suffix);
        }
    }
    format!("{ms}ms")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(filters: Vec<ColumnFilter>) -> LogicalPlan {
        LogicalPlan::RawSeries {
            filters,
            range: TimeRange::new(0, 1000),
            column: None,
        }
    }

    #[test]
    fn test_rewrite_labels_renames_filters_and_groupings() {
        let mut mapping = HashMap::new();
        mapping.insert("__name__".to_string(), "kpi".to_string());
        let plan = LogicalPlan::Aggregate {
            operator: AggregationOperator::Sum,
            inner: Box::new(raw(vec![ColumnFilter::equals("__name__", "foo")])),
            params: vec![],
            by: vec!["__name__".to_string()],
            without: vec![],
        };
        let rewritten = plan.rewrite_labels(&mapping);
        match rewritten {
            LogicalPlan::Aggregate { by, inner, .. } => {
                assert_eq!(by, vec!["kpi".to_string()]);
                let filters = inner.leaf_filters();
                assert_eq!(filters[0].column, "kpi");
            }
            _ => panic!("expected aggregate"),
        }
    }

    #[test]
    fn test_to_promql_selector() {
        let plan = raw(vec![
            ColumnFilter::equals(METRIC_COLUMN, "foo"),
            ColumnFilter::equals("_ws_", "demo"),
        ]);
        assert_eq!(plan.to_promql().unwrap(), "foo{_ws_=\"demo\"}");
    }

    #[test]
    fn test_to_promql_windowed_function() {
        let plan = LogicalPlan::PeriodicSeriesWithWindowing {
            raw: Box::new(raw(vec![ColumnFilter::equals(METRIC_COLUMN, "foo")])),
            start_ms: 0,
            step_ms: 10_000,
            end_ms: 100_000,
            window_ms: 600_000,
            function: RangeFunctionId::Rate,
            function_args: vec![],
            offset_ms: None,
        };
        assert_eq!(plan.to_promql().unwrap(), "rate(foo[10m])");
    }

    #[test]
    fn test_to_promql_aggregate_with_by() {
        let plan = LogicalPlan::Aggregate {
            operator: AggregationOperator::Sum,
            inner: Box::new(raw(vec![ColumnFilter::equals(METRIC_COLUMN, "foo")])),
            params: vec![],
            by: vec!["job".to_string()],
            without: vec![],
        };
        assert_eq!(plan.to_promql().unwrap(), "sum by (job)(foo)");
    }

    #[test]
    fn test_render_duration_picks_whole_units() {
        assert_eq!(render_duration(600_000), "10m");
        assert_eq!(render_duration(3_600_000), "1h");
        assert_eq!(render_duration(1_500), "1500ms");
    }

    #[test]
    fn test_replace_raw_filters_reaches_leaves() {
        let plan = LogicalPlan::Aggregate {
            operator: AggregationOperator::Sum,
            inner: Box::new(LogicalPlan::PeriodicSeries {
                raw: Box::new(raw(vec![ColumnFilter::equals("_ns_", "old")])),
                start_ms: 0,
                step_ms: 10,
                end_ms: 100,
                offset_ms: None,
            }),
            params: vec![],
            by: vec![],
            without: vec![],
        };
        let new_filters = vec![ColumnFilter::equals("_ns_", "new")];
        let replaced = plan.replace_raw_filters(&new_filters);
        assert_eq!(replaced.leaf_filters(), new_filters);
    }

    #[test]
    fn test_query_time_range_walks_to_grid() {
        let plan = LogicalPlan::PeriodicSeries {
            raw: Box::new(raw(vec![])),
            start_ms: 500,
            step_ms: 10,
            end_ms: 900,
            offset_ms: None,
        };
        assert_eq!(plan.query_time_range(), TimeRange::new(500, 900));
    }
}
