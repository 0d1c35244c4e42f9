//! Single-cluster planner: compiles a logical plan against one shard map
//! and one retention tier.
//!
//! Responsibilities, in the order they apply:
//! - rename the metric column when the dataset stores it under a
//!   different name
//! - rewrite `X_bucket{le="v"}` selectors to the histogram column plus a
//!   bucket-extraction function
//! - clip the evaluation grid to the tier's retention horizon
//! - select candidate shards from shard-key filters and the spread
//! - split the range at spread-change points and stitch the segments
//! - push aggregation down to the shard leaves, two reduce levels when
//!   the fan-out is wide
//! - align subquery grids to the subquery step

use crate::config::{QueryConfig, RetentionFn, Tier};
use crate::error::QueryError;
use crate::planner::{align_up, grid_of, shard_key_values, with_grid, QueryPlanner};
use crate::query::exec::{ExecNode, ExecPlan, PlanDispatcher};
use crate::query::filter::{ColumnFilter, Filter};
use crate::query::logical::{
    AggParam, AggregationOperator, InstantFunctionId, LogicalPlan, RangeFunctionId,
};
use crate::query::range_vector::RvRange;
use crate::query::session::QueryContext;
use crate::query::transformers::{Grouping, RangeVectorTransformer};
use crate::shard::{shard_key_hash, shards_for_shard_key, ShardMapper, SpreadProvider};
use crate::types::{ChunkScanMethod, Dataset, ShardId, TimeRange, METRIC_COLUMN, PROM_METRIC_LABEL};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Planner for one `(dataset, tier)` pair.
pub struct SingleClusterPlanner {
    dataset: Dataset,
    shard_mapper: Arc<dyn ShardMapper>,
    spread_provider: Arc<dyn SpreadProvider>,
    earliest_retained_fn: RetentionFn,
    tier: Tier,
    query_config: Arc<QueryConfig>,
    dispatcher: Arc<dyn PlanDispatcher>,
}

impl SingleClusterPlanner {
    /// Planner over the injected cluster view.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: Dataset,
        shard_mapper: Arc<dyn ShardMapper>,
        spread_provider: Arc<dyn SpreadProvider>,
        earliest_retained_fn: RetentionFn,
        tier: Tier,
        query_config: Arc<QueryConfig>,
        dispatcher: Arc<dyn PlanDispatcher>,
    ) -> Self {
        Self {
            dataset,
            shard_mapper,
            spread_provider,
            earliest_retained_fn,
            tier,
            query_config,
            dispatcher,
        }
    }

    /// The tier this planner serves.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    fn node(&self, node: ExecNode) -> ExecPlan {
        ExecPlan::new(node, Arc::clone(&self.dispatcher))
    }

    /// Rename `__name__` (and the internal metric column) to the
    /// dataset's configured metric column.
    fn rewrite_metric_column(&self, plan: &LogicalPlan) -> LogicalPlan {
        let metric_column = &self.dataset.options.metric_column;
        if metric_column == METRIC_COLUMN {
            return plan.clone();
        }
        let mut mapping = HashMap::new();
        mapping.insert(PROM_METRIC_LABEL.to_string(), metric_column.clone());
        mapping.insert(METRIC_COLUMN.to_string(), metric_column.clone());
        plan.rewrite_labels(&mapping)
    }

    /// `{metric="X_bucket", le="v"}` becomes `{metric="X"}` plus a bucket
    /// extraction step.
    fn rewrite_histogram_bucket(
        &self,
        filters: &[ColumnFilter],
    ) -> (Vec<ColumnFilter>, Option<f64>) {
        let metric_column = &self.dataset.options.metric_column;
        let metric = filters.iter().find_map(|cf| {
            if &cf.column == metric_column {
                match &cf.filter {
                    Filter::Equals(name) => Some(name.clone()),
                    _ => None,
                }
            } else {
                None
            }
        });
        let le = filters.iter().find_map(|cf| {
            if cf.column == "le" {
                match &cf.filter {
                    Filter::Equals(v) => v.parse::<f64>().ok(),
                    _ => None,
                }
            } else {
                None
            }
        });
        match (metric, le) {
            (Some(metric), Some(le)) if metric.ends_with("_bucket") => {
                let base = metric.trim_end_matches("_bucket").to_string();
                let rewritten = filters
                    .iter()
                    .filter(|cf| cf.column != "le")
                    .map(|cf| {
                        if &cf.column == metric_column {
                            ColumnFilter::equals(metric_column.clone(), base.clone())
                        } else {
                            cf.clone()
                        }
                    })
                    .collect();
                (rewritten, Some(le))
            }
            _ => (filters.to_vec(), None),
        }
    }

    /// Candidate shards for the filters, with availability applied.
    /// Returns the shards plus a partial reason when unavailable shards
    /// were dropped under `allowPartialResults`.
    fn shards_for_filters(
        &self,
        filters: &[ColumnFilter],
        qctx: &QueryContext,
        spread_at_ms: i64,
    ) -> Result<(Vec<ShardId>, Option<String>), QueryError> {
        let num_shards = self.shard_mapper.num_shards();
        let candidates = match shard_key_values(filters, &self.dataset.options.shard_key_columns) {
            Some(values) => {
                let hash = shard_key_hash(&values);
                let spread = qctx
                    .planner_params
                    .spread_override
                    .unwrap_or_else(|| self.spread_provider.spread_at(spread_at_ms));
                shards_for_shard_key(hash, spread, num_shards)
            }
            None => (0..num_shards).collect(),
        };

        let shard_limit = qctx
            .planner_params
            .enforced_limits
            .max_shards_per_query
            .map_or(self.query_config.max_shards_per_query, |enforced| {
                enforced.min(self.query_config.max_shards_per_query)
            });
        if candidates.len() > shard_limit {
            return Err(QueryError::TooManyShardsQueried {
                actual: candidates.len(),
                limit: shard_limit,
            });
        }

        let (available, unavailable): (Vec<ShardId>, Vec<ShardId>) = candidates
            .into_iter()
            .partition(|s| self.shard_mapper.status_for_shard(*s).queryable());

        if unavailable.is_empty() {
            return Ok((available, None));
        }
        if qctx.planner_params.allow_partial_results {
            let reason = format!(
                "shards {:?} excluded, statuses {:?}",
                unavailable,
                unavailable
                    .iter()
                    .map(|s| self.shard_mapper.status_for_shard(*s))
                    .collect::<Vec<_>>()
            );
            debug!(tier = self.tier.name(), %reason, "partial shard selection");
            Ok((available, Some(reason)))
        } else {
            let shard = unavailable[0];
            Err(QueryError::ShardNotAvailable {
                shard,
                status: self.shard_mapper.status_for_shard(shard),
            })
        }
    }

    /// Retention clip for a grid: the first usable grid point, or `None`
    /// when the whole range precedes retention. The window, offset and
    /// lookback are added so every raw sample the evaluator touches is
    /// still retained.
    fn clip_to_retention(
        &self,
        grid: RvRange,
        window_ms: i64,
        offset_ms: i64,
        lookback_ms: i64,
    ) -> Option<RvRange> {
        let earliest = (self.earliest_retained_fn)();
        if earliest == i64::MIN {
            return Some(grid);
        }
        let min_start = earliest + grid.step_ms + window_ms + offset_ms + lookback_ms;
        if min_start <= grid.start_ms {
            return Some(grid);
        }
        let clipped_start = align_up(min_start, grid.start_ms, grid.step_ms);
        if clipped_start > grid.end_ms {
            None
        } else {
            Some(RvRange {
                start_ms: clipped_start,
                ..grid
            })
        }
    }

    /// Per-shard scan leaves with the periodic mapper attached, wrapped
    /// in a concat node.
    #[allow(clippy::too_many_arguments)]
    fn shard_scan_concat(
        &self,
        shards: &[ShardId],
        filters: &[ColumnFilter],
        grid: RvRange,
        window_ms: Option<i64>,
        function: Option<RangeFunctionId>,
        function_args: &[f64],
        offset_ms: i64,
        bucket_le: Option<f64>,
    ) -> ExecPlan {
        let lookback = if window_ms.is_none() {
            self.query_config.stale_lookback_ms()
        } else {
            0
        };
        let scan_range = TimeRange::new(
            grid.start_ms - offset_ms - window_ms.unwrap_or(0) - lookback,
            grid.end_ms - offset_ms,
        );
        let children = shards
            .iter()
            .map(|shard| {
                let mut leaf = self.node(ExecNode::MultiSchemaPartitionsScan {
                    dataset: self.dataset.dataset_ref.clone(),
                    shard: *shard,
                    chunk_method: ChunkScanMethod::TimeRange(scan_range),
                    filters: filters.to_vec(),
                });
                leaf.transformers
                    .push(RangeVectorTransformer::PeriodicSamplesMapper {
                        start_ms: grid.start_ms,
                        step_ms: grid.step_ms,
                        end_ms: grid.end_ms,
                        window_ms,
                        function,
                        function_args: function_args.to_vec(),
                        offset_ms,
                    });
                if let Some(le) = bucket_le {
                    leaf.transformers
                        .push(RangeVectorTransformer::InstantVectorFunctionMapper {
                            function: InstantFunctionId::HistogramBucket,
                            args: vec![le],
                        });
                }
                leaf
            })
            .collect();
        self.node(ExecNode::LocalPartitionDistConcat { children })
    }

    /// Periodic selector and range-function materialization, including
    /// retention clipping and spread-change stitching.
    #[allow(clippy::too_many_arguments)]
    fn materialize_periodic(
        &self,
        raw: &LogicalPlan,
        grid: RvRange,
        window_ms: Option<i64>,
        function: Option<RangeFunctionId>,
        function_args: &[f64],
        offset_ms: Option<i64>,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        let LogicalPlan::RawSeries { filters, .. } = raw else {
            return Err(QueryError::internal("periodic plan over a non-raw input"));
        };
        let (filters, bucket_le) = self.rewrite_histogram_bucket(filters);
        let offset = offset_ms.unwrap_or(0);
        let lookback = if window_ms.is_none() {
            self.query_config.stale_lookback_ms()
        } else {
            0
        };

        let Some(grid) =
            self.clip_to_retention(grid, window_ms.unwrap_or(0), offset, lookback)
        else {
            debug!(tier = self.tier.name(), "range wholly before retention");
            return Ok(self.node(ExecNode::EmptyResult));
        };

        // Spread changes split the range; each segment queries the shard
        // group of its own spread and the segments stitch back together.
        // An explicit spread override pins one shard group for the whole
        // range.
        let changes = if qctx.planner_params.spread_override.is_none() {
            self.spread_provider.changes_in(grid.start_ms, grid.end_ms)
        } else {
            Vec::new()
        };

        if changes.is_empty() {
            let (shards, partial_reason) =
                self.shards_for_filters(&filters, qctx, grid.end_ms)?;
            let mut concat = self.shard_scan_concat(
                &shards,
                &filters,
                grid,
                window_ms,
                function,
                function_args,
                offset,
                bucket_le,
            );
            if partial_reason.is_some() {
                concat = mark_partial(concat, partial_reason);
            }
            return Ok(concat);
        }

        let mut segments: Vec<RvRange> = Vec::new();
        let mut seg_start = grid.start_ms;
        for change in &changes {
            let boundary = align_up(change.at_ms, grid.start_ms, grid.step_ms);
            if boundary > seg_start {
                segments.push(RvRange {
                    start_ms: seg_start,
                    step_ms: grid.step_ms,
                    end_ms: boundary - grid.step_ms,
                });
                seg_start = boundary;
            }
        }
        segments.push(RvRange {
            start_ms: seg_start,
            step_ms: grid.step_ms,
            end_ms: grid.end_ms,
        });

        let mut partial = None;
        let mut children = Vec::with_capacity(segments.len());
        for segment in segments {
            let (shards, reason) = self.shards_for_filters(&filters, qctx, segment.end_ms)?;
            if partial.is_none() {
                partial = reason;
            }
            children.push(self.shard_scan_concat(
                &shards,
                &filters,
                segment,
                window_ms,
                function,
                function_args,
                offset,
                bucket_le,
            ));
        }
        let mut root = self
            .node(ExecNode::LocalPartitionDistConcat { children })
            .with_transformer(RangeVectorTransformer::StitchRvsMapper);
        if partial.is_some() {
            root = mark_partial(root, partial);
        }
        Ok(root)
    }

    /// Push aggregation down to the children of a concat, inserting a
    /// second reduce level when the fan-out is wide.
    fn materialize_aggregate(
        &self,
        operator: AggregationOperator,
        inner: &LogicalPlan,
        params: &[AggParam],
        by: &[String],
        without: &[String],
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        let child = self.walk(inner, qctx)?;
        if matches!(child.node, ExecNode::EmptyResult) {
            return Ok(child);
        }
        let grouping = Grouping {
            by: by.to_vec(),
            without: without.to_vec(),
        };
        let map_stage = RangeVectorTransformer::AggregateMapReduce {
            operator,
            params: params.to_vec(),
            grouping,
        };
        let presenter = RangeVectorTransformer::AggregatePresenter {
            operator,
            params: params.to_vec(),
        };

        // A bare concat lets the map stage run at the leaves. Anything
        // else (stitched segments, joins) aggregates above the child.
        let reducible = matches!(child.node, ExecNode::LocalPartitionDistConcat { .. })
            && child.transformers.is_empty();
        if !reducible {
            let mapped = child.with_transformer(map_stage);
            return Ok(self
                .node(ExecNode::LocalPartitionReduceAggregate {
                    operator,
                    params: params.to_vec(),
                    children: vec![mapped],
                })
                .with_transformer(presenter));
        }

        let ExecNode::LocalPartitionDistConcat { children } = child.node else {
            unreachable!("checked above");
        };
        let mapped: Vec<ExecPlan> = children
            .into_iter()
            .map(|leaf| leaf.with_transformer(map_stage.clone()))
            .collect();

        let threshold = self.query_config.reduce_shards_per_node;
        let root = if mapped.len() > threshold {
            let groups: Vec<ExecPlan> = mapped
                .chunks(threshold)
                .map(|group| {
                    self.node(ExecNode::LocalPartitionReduceAggregate {
                        operator,
                        params: params.to_vec(),
                        children: group.to_vec(),
                    })
                })
                .collect();
            self.node(ExecNode::LocalPartitionReduceAggregate {
                operator,
                params: params.to_vec(),
                children: groups,
            })
        } else {
            self.node(ExecNode::LocalPartitionReduceAggregate {
                operator,
                params: params.to_vec(),
                children: mapped,
            })
        };
        Ok(root.with_transformer(presenter))
    }

    /// Subquery materialization: the inner plan runs on a grid aligned to
    /// the subquery step, the outer function windows over it.
    fn materialize_subquery(
        &self,
        inner: &LogicalPlan,
        function: RangeFunctionId,
        function_args: &[f64],
        window_ms: i64,
        step_ms: i64,
        offset_ms: Option<i64>,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        if subquery_depth(inner) + 1 > self.query_config.max_subquery_depth {
            return Err(QueryError::bad_query(format!(
                "subquery nesting deeper than {}",
                self.query_config.max_subquery_depth
            )));
        }
        let (outer_start, outer_step, outer_end) = grid_of(inner)
            .ok_or_else(|| QueryError::bad_query("subquery body must be periodic"))?;
        let step = step_ms.max(1);
        // Inner grid points are absolute multiples of the subquery step.
        let first_grid = super::div_ceil_i64(outer_start - window_ms, step) * step;
        let last_grid = outer_end.div_euclid(step) * step;
        let aligned_inner = with_grid(inner, first_grid, step, last_grid);

        let child = self.walk(&aligned_inner, qctx)?;
        Ok(child.with_transformer(RangeVectorTransformer::PeriodicSamplesMapper {
            start_ms: outer_start,
            step_ms: outer_step,
            end_ms: outer_end,
            window_ms: Some(window_ms),
            function: Some(function),
            function_args: function_args.to_vec(),
            offset_ms: offset_ms.unwrap_or(0),
        }))
    }

    /// Metadata fan-out over the shard set for the filters.
    fn materialize_metadata(
        &self,
        plan: &LogicalPlan,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        let filters = plan.leaf_filters();
        let range = plan.query_time_range();
        let (shards, partial_reason) = self.shards_for_filters(&filters, qctx, range.end_ms)?;
        let dataset = self.dataset.dataset_ref.clone();

        let leaves = |node_for: &dyn Fn(ShardId) -> ExecNode| -> Vec<ExecPlan> {
            shards.iter().map(|s| self.node(node_for(*s))).collect()
        };

        let root = match plan {
            LogicalPlan::LabelValues {
                filters,
                label_names,
                start_ms,
                end_ms,
            } => {
                let children = leaves(&|shard| ExecNode::LabelValuesScan {
                    dataset: dataset.clone(),
                    shard,
                    filters: filters.clone(),
                    label_names: label_names.clone(),
                    start_ms: *start_ms,
                    end_ms: *end_ms,
                });
                self.node(ExecNode::LabelValuesDistConcat { children })
            }
            LogicalPlan::LabelNames {
                filters,
                start_ms,
                end_ms,
            } => {
                let children = leaves(&|shard| ExecNode::LabelNamesScan {
                    dataset: dataset.clone(),
                    shard,
                    filters: filters.clone(),
                    start_ms: *start_ms,
                    end_ms: *end_ms,
                });
                self.node(ExecNode::LabelNamesDistConcat { children })
            }
            LogicalPlan::SeriesKeysByFilters {
                filters,
                start_ms,
                end_ms,
            } => {
                let children = leaves(&|shard| ExecNode::PartKeysScan {
                    dataset: dataset.clone(),
                    shard,
                    filters: filters.clone(),
                    start_ms: *start_ms,
                    end_ms: *end_ms,
                });
                self.node(ExecNode::PartKeysDistConcat { children })
            }
            LogicalPlan::LabelCardinality {
                filters,
                start_ms,
                end_ms,
            } => {
                let children = leaves(&|shard| ExecNode::LabelCardinalityScan {
                    dataset: dataset.clone(),
                    shard,
                    filters: filters.clone(),
                    start_ms: *start_ms,
                    end_ms: *end_ms,
                });
                self.node(ExecNode::LabelCardinalityReduce { children })
                    .with_transformer(RangeVectorTransformer::LabelCardinalityPresenter)
            }
            LogicalPlan::TopkCardinality {
                shard_key_prefix,
                k,
                include_inactive,
            } => {
                let children = leaves(&|shard| ExecNode::TopkCardScan {
                    dataset: dataset.clone(),
                    shard,
                    shard_key_prefix: shard_key_prefix.clone(),
                    k: *k,
                    include_inactive: *include_inactive,
                });
                self.node(ExecNode::TopkCardReduce {
                    k: *k,
                    children,
                })
                .with_transformer(RangeVectorTransformer::TopkCardPresenter { k: *k })
            }
            other => {
                return Err(QueryError::internal(format!(
                    "not a metadata plan: {other:?}"
                )))
            }
        };
        Ok(if partial_reason.is_some() {
            mark_partial(root, partial_reason)
        } else {
            root
        })
    }

    fn walk(&self, plan: &LogicalPlan, qctx: &QueryContext) -> Result<ExecPlan, QueryError> {
        match plan {
            LogicalPlan::RawSeries { filters, range, .. } => {
                let (filters, _) = self.rewrite_histogram_bucket(filters);
                let (shards, partial_reason) =
                    self.shards_for_filters(&filters, qctx, range.end_ms)?;
                let children = shards
                    .iter()
                    .map(|shard| {
                        self.node(ExecNode::MultiSchemaPartitionsScan {
                            dataset: self.dataset.dataset_ref.clone(),
                            shard: *shard,
                            chunk_method: ChunkScanMethod::TimeRange(*range),
                            filters: filters.clone(),
                        })
                    })
                    .collect();
                let root = self.node(ExecNode::LocalPartitionDistConcat { children });
                Ok(if partial_reason.is_some() {
                    mark_partial(root, partial_reason)
                } else {
                    root
                })
            }
            LogicalPlan::PeriodicSeries {
                raw,
                start_ms,
                step_ms,
                end_ms,
                offset_ms,
            } => self.materialize_periodic(
                raw,
                RvRange {
                    start_ms: *start_ms,
                    step_ms: *step_ms,
                    end_ms: *end_ms,
                },
                None,
                None,
                &[],
                *offset_ms,
                qctx,
            ),
            LogicalPlan::PeriodicSeriesWithWindowing {
                raw,
                start_ms,
                step_ms,
                end_ms,
                window_ms,
                function,
                function_args,
                offset_ms,
            } => self.materialize_periodic(
                raw,
                RvRange {
                    start_ms: *start_ms,
                    step_ms: *step_ms,
                    end_ms: *end_ms,
                },
                Some(*window_ms),
                Some(*function),
                function_args,
                *offset_ms,
                qctx,
            ),
            LogicalPlan::SubqueryWithWindowing {
                inner,
                function,
                function_args,
                window_ms,
                step_ms,
                offset_ms,
            } => self.materialize_subquery(
                inner,
                *function,
                function_args,
                *window_ms,
                *step_ms,
                *offset_ms,
                qctx,
            ),
            LogicalPlan::Aggregate {
                operator,
                inner,
                params,
                by,
                without,
            } => self.materialize_aggregate(*operator, inner, params, by, without, qctx),
            LogicalPlan::BinaryJoin {
                lhs,
                rhs,
                operator,
                cardinality,
                on,
                ignoring,
                include,
            } => Ok(self.node(ExecNode::BinaryJoin {
                lhs: Box::new(self.walk(lhs, qctx)?),
                rhs: Box::new(self.walk(rhs, qctx)?),
                operator: *operator,
                cardinality: *cardinality,
                on: on.clone(),
                ignoring: ignoring.clone(),
                include: include.clone(),
            })),
            LogicalPlan::SetOp {
                lhs,
                rhs,
                operator,
                on,
                ignoring,
            } => Ok(self.node(ExecNode::SetOperator {
                lhs: Box::new(self.walk(lhs, qctx)?),
                rhs: Box::new(self.walk(rhs, qctx)?),
                operator: *operator,
                on: on.clone(),
                ignoring: ignoring.clone(),
            })),
            LogicalPlan::ScalarVectorBinaryOperation {
                scalar,
                vector,
                operator,
                scalar_is_lhs,
            } => Ok(self.walk(vector, qctx)?.with_transformer(
                RangeVectorTransformer::ScalarOperationMapper {
                    operator: *operator,
                    scalar: *scalar,
                    scalar_is_lhs: *scalar_is_lhs,
                },
            )),
            LogicalPlan::ApplyInstantFunction {
                vectors,
                function,
                args,
            } => Ok(self.walk(vectors, qctx)?.with_transformer(
                RangeVectorTransformer::InstantVectorFunctionMapper {
                    function: *function,
                    args: args.clone(),
                },
            )),
            LogicalPlan::ApplyAbsentFunction {
                vectors,
                filters,
                start_ms,
                step_ms,
                end_ms,
            } => Ok(self.walk(vectors, qctx)?.with_transformer(
                RangeVectorTransformer::AbsentFunctionMapper {
                    filters: filters.clone(),
                    range: RvRange {
                        start_ms: *start_ms,
                        step_ms: *step_ms,
                        end_ms: *end_ms,
                    },
                },
            )),
            metadata => self.materialize_metadata(metadata, qctx),
        }
    }
}

impl QueryPlanner for SingleClusterPlanner {
    fn materialize(
        &self,
        plan: &LogicalPlan,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        let rewritten = self.rewrite_metric_column(plan);
        self.walk(&rewritten, qctx)
    }
}

/// Mark a plan partial by tagging its root; execution copies the reason
/// into the result.
fn mark_partial(mut plan: ExecPlan, reason: Option<String>) -> ExecPlan {
    plan.transformers.insert(
        0,
        RangeVectorTransformer::PartialResultMarker {
            reason: reason.unwrap_or_default(),
        },
    );
    plan
}

/// Maximum subquery nesting below this plan.
fn subquery_depth(plan: &LogicalPlan) -> usize {
    match plan {
        LogicalPlan::SubqueryWithWindowing { inner, .. } => 1 + subquery_depth(inner),
        LogicalPlan::Aggregate { inner, .. } => subquery_depth(inner),
        LogicalPlan::ApplyInstantFunction { vectors, .. }
        | LogicalPlan::ApplyAbsentFunction { vectors, .. } => subquery_depth(vectors),
        LogicalPlan::ScalarVectorBinaryOperation { vector, .. } => subquery_depth(vector),
        LogicalPlan::BinaryJoin { lhs, rhs, .. } | LogicalPlan::SetOp { lhs, rhs, .. } => {
            subquery_depth(lhs).max(subquery_depth(rhs))
        }
        _ => 0,
    }
}
