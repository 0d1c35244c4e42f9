//! Query planners.
//!
//! Planners compile a [`LogicalPlan`] into an [`ExecPlan`]. They compose
//! as a DAG by constructor injection, outermost first:
//!
//! ```text
//! ShardKeyRegexPlanner            expand regex shard keys, lift aggregates
//!   └─ MultiPartitionPlanner      route local vs. remote partitions
//!        └─ SinglePartitionPlanner    route by metric name (recording rules)
//!             └─ LongTimeRangePlanner     split raw vs. downsample tiers
//!                  └─ SingleClusterPlanner    shards, retention, push-down
//! ```
//!
//! Every planner is pure: materializing the same plan twice yields an
//! equivalent tree.

pub mod long_range;
pub mod multi_partition;
pub mod shard_key_regex;
pub mod single_cluster;
pub mod single_partition;

pub use long_range::LongTimeRangePlanner;
pub use multi_partition::{
    MultiPartitionPlanner, PartitionAssignment, PartitionLocationProvider,
};
pub use shard_key_regex::ShardKeyRegexPlanner;
pub use single_cluster::SingleClusterPlanner;
pub use single_partition::SinglePartitionPlanner;

use crate::error::QueryError;
use crate::query::exec::ExecPlan;
use crate::query::filter::{ColumnFilter, Filter};
use crate::query::logical::LogicalPlan;
use crate::query::session::QueryContext;

/// Compiles logical plans against one slice of the world.
pub trait QueryPlanner: Send + Sync {
    /// Materialize an executable plan.
    fn materialize(
        &self,
        plan: &LogicalPlan,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError>;
}

/// Whether re-reducing this aggregate's finalized outputs is still
/// exact. Pushing an aggregate below a partition or shard-key union
/// means each side presents final values, so only operators whose finals
/// re-reduce losslessly qualify; `avg` and friends stay above the union
/// where their partials are available.
pub(crate) fn pushdown_safe(operator: crate::query::logical::AggregationOperator) -> bool {
    use crate::query::logical::AggregationOperator as Op;
    matches!(operator, Op::Sum | Op::Count | Op::Min | Op::Max | Op::Group)
}

/// Equality values of the given columns within a filter list; `None` when
/// any column is missing or non-equality.
pub fn shard_key_values(
    filters: &[ColumnFilter],
    shard_key_columns: &[String],
) -> Option<Vec<String>> {
    shard_key_columns
        .iter()
        .map(|column| {
            filters.iter().find_map(|cf| {
                if &cf.column == column {
                    match &cf.filter {
                        Filter::Equals(value) => Some(value.clone()),
                        _ => None,
                    }
                } else {
                    None
                }
            })
        })
        .collect()
}

/// The periodic evaluation grid of a plan, `(start_ms, step_ms, end_ms)`.
pub(crate) fn grid_of(plan: &LogicalPlan) -> Option<(i64, i64, i64)> {
    match plan {
        LogicalPlan::PeriodicSeries {
            start_ms,
            step_ms,
            end_ms,
            ..
        }
        | LogicalPlan::PeriodicSeriesWithWindowing {
            start_ms,
            step_ms,
            end_ms,
            ..
        }
        | LogicalPlan::ApplyAbsentFunction {
            start_ms,
            step_ms,
            end_ms,
            ..
        } => Some((*start_ms, *step_ms, *end_ms)),
        LogicalPlan::SubqueryWithWindowing { inner, .. } => grid_of(inner),
        LogicalPlan::Aggregate { inner, .. } => grid_of(inner),
        LogicalPlan::ApplyInstantFunction { vectors, .. } => grid_of(vectors),
        LogicalPlan::ScalarVectorBinaryOperation { vector, .. } => grid_of(vector),
        LogicalPlan::BinaryJoin { lhs, .. } | LogicalPlan::SetOp { lhs, .. } => grid_of(lhs),
        _ => None,
    }
}

/// Rewrite the evaluation grid of every periodic node in the tree. Raw
/// leaf ranges follow the new grid.
pub(crate) fn with_grid(
    plan: &LogicalPlan,
    start_ms: i64,
    step_ms: i64,
    end_ms: i64,
) -> LogicalPlan {
    let clip_raw = |raw: &LogicalPlan| -> Box<LogicalPlan> {
        Box::new(match raw {
            LogicalPlan::RawSeries { filters, column, .. } => LogicalPlan::RawSeries {
                filters: filters.clone(),
                range: crate::types::TimeRange::new(start_ms, end_ms),
                column: column.clone(),
            },
            other => other.clone(),
        })
    };
    match plan {
        LogicalPlan::PeriodicSeries { raw, offset_ms, .. } => LogicalPlan::PeriodicSeries {
            raw: clip_raw(raw),
            start_ms,
            step_ms,
            end_ms,
            offset_ms: *offset_ms,
        },
        LogicalPlan::PeriodicSeriesWithWindowing {
            raw,
            window_ms,
            function,
            function_args,
            offset_ms,
            ..
        } => LogicalPlan::PeriodicSeriesWithWindowing {
            raw: clip_raw(raw),
            start_ms,
            step_ms,
            end_ms,
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
            step_ms: sub_step,
            offset_ms,
        } => LogicalPlan::SubqueryWithWindowing {
            inner: Box::new(with_grid(inner, start_ms, step_ms, end_ms)),
            function: *function,
            function_args: function_args.clone(),
            window_ms: *window_ms,
            step_ms: *sub_step,
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
            inner: Box::new(with_grid(inner, start_ms, step_ms, end_ms)),
            params: params.clone(),
            by: by.clone(),
            without: without.clone(),
        },
        LogicalPlan::ApplyInstantFunction {
            vectors,
            function,
            args,
        } => LogicalPlan::ApplyInstantFunction {
            vectors: Box::new(with_grid(vectors, start_ms, step_ms, end_ms)),
            function: *function,
            args: args.clone(),
        },
        LogicalPlan::ApplyAbsentFunction {
            vectors, filters, ..
        } => LogicalPlan::ApplyAbsentFunction {
            vectors: Box::new(with_grid(vectors, start_ms, step_ms, end_ms)),
            filters: filters.clone(),
            start_ms,
            step_ms,
            end_ms,
        },
        LogicalPlan::ScalarVectorBinaryOperation {
            scalar,
            vector,
            operator,
            scalar_is_lhs,
        } => LogicalPlan::ScalarVectorBinaryOperation {
            scalar: *scalar,
            vector: Box::new(with_grid(vector, start_ms, step_ms, end_ms)),
            operator: *operator,
            scalar_is_lhs: *scalar_is_lhs,
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
            lhs: Box::new(with_grid(lhs, start_ms, step_ms, end_ms)),
            rhs: Box::new(with_grid(rhs, start_ms, step_ms, end_ms)),
            operator: *operator,
            cardinality: *cardinality,
            on: on.clone(),
            ignoring: ignoring.clone(),
            include: include.clone(),
        },
        LogicalPlan::SetOp {
            lhs,
            rhs,
            operator,
            on,
            ignoring,
        } => LogicalPlan::SetOp {
            lhs: Box::new(with_grid(lhs, start_ms, step_ms, end_ms)),
            rhs: Box::new(with_grid(rhs, start_ms, step_ms, end_ms)),
            operator: *operator,
            on: on.clone(),
            ignoring: ignoring.clone(),
        },
        other => other.clone(),
    }
}

/// Integer division rounding toward positive infinity (`i64::div_ceil`,
/// inlined because it is not available on this toolchain).
pub(crate) fn div_ceil_i64(lhs: i64, rhs: i64) -> i64 {
    let d = lhs / rhs;
    let r = lhs % rhs;
    if (r > 0 && rhs > 0) || (r < 0 && rhs < 0) {
        d + 1
    } else {
        d
    }
}

/// First grid point at or after `ts` on the grid anchored at `start` with
/// the given step.
pub(crate) fn align_up(ts: i64, grid_start: i64, step: i64) -> i64 {
    if step <= 0 || ts <= grid_start {
        return grid_start;
    }
    let delta = ts - grid_start;
    grid_start + div_ceil_i64(delta, step) * step
}

/// Last grid point at or before `ts`; `None` when `ts` precedes the grid.
pub(crate) fn align_down(ts: i64, grid_start: i64, step: i64) -> Option<i64> {
    if ts < grid_start {
        return None;
    }
    if step <= 0 {
        return Some(grid_start);
    }
    Some(grid_start + (ts - grid_start) / step * step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::METRIC_COLUMN;

    #[test]
    fn test_shard_key_extraction() {
        let filters = vec![
            ColumnFilter::equals("_ws_", "demo"),
            ColumnFilter::equals("_ns_", "App-0"),
            ColumnFilter::equals(METRIC_COLUMN, "foo"),
        ];
        let columns = vec![
            "_ws_".to_string(),
            "_ns_".to_string(),
            METRIC_COLUMN.to_string(),
        ];
        assert_eq!(
            shard_key_values(&filters, &columns),
            Some(vec!["demo".into(), "App-0".into(), "foo".into()])
        );

        // A regex shard-key filter breaks extraction.
        let filters = vec![
            ColumnFilter::equals("_ws_", "demo"),
            ColumnFilter::new("_ns_", Filter::EqualsRegex(".*Ns".into())),
            ColumnFilter::equals(METRIC_COLUMN, "foo"),
        ];
        assert_eq!(shard_key_values(&filters, &columns), None);
    }

    #[test]
    fn test_grid_alignment() {
        assert_eq!(align_up(95, 0, 10), 100);
        assert_eq!(align_up(100, 0, 10), 100);
        assert_eq!(align_up(-5, 0, 10), 0);
        assert_eq!(align_down(95, 0, 10), Some(90));
        assert_eq!(align_down(100, 0, 10), Some(100));
        assert_eq!(align_down(-5, 0, 10), None);
    }
}
