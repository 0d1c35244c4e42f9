//! Shard-key regex planner: expands regex shard-key filters into a union
//! of concrete key tuples.
//!
//! A query like `sum(foo{_ns_=~".*Ns"})` cannot be routed, because the
//! namespace is not concrete. The injected matcher resolves the regex to
//! the concrete key tuples it covers; the planner builds one subplan per
//! tuple and either lifts an aggregate above the union, pushing
//! per-tuple aggregates inside, or concatenates. Stateless across
//! queries.

use crate::error::QueryError;
use crate::planner::{pushdown_safe, QueryPlanner};
use crate::query::exec::{ExecNode, ExecPlan, PlanDispatcher};
use crate::query::filter::{ColumnFilter, Filter};
use crate::query::logical::LogicalPlan;
use crate::query::session::QueryContext;
use crate::query::transformers::RangeVectorTransformer;
use crate::types::{METRIC_COLUMN, NS_COLUMN, WS_COLUMN};
use std::sync::Arc;
use tracing::debug;

/// Resolves shard-key filters with regexes into concrete filter tuples.
pub type ShardKeyMatcherFn = Arc<dyn Fn(&[ColumnFilter]) -> Vec<Vec<ColumnFilter>> + Send + Sync>;

/// Expands regex shard keys ahead of partition routing.
pub struct ShardKeyRegexPlanner {
    matcher_fn: ShardKeyMatcherFn,
    inner: Arc<dyn QueryPlanner>,
    dispatcher: Arc<dyn PlanDispatcher>,
}

impl ShardKeyRegexPlanner {
    /// Planner over a matcher and the next planner down.
    pub fn new(
        matcher_fn: ShardKeyMatcherFn,
        inner: Arc<dyn QueryPlanner>,
        dispatcher: Arc<dyn PlanDispatcher>,
    ) -> Self {
        Self {
            matcher_fn,
            inner,
            dispatcher,
        }
    }

    fn has_shard_key_regex(filters: &[ColumnFilter]) -> bool {
        filters.iter().any(|cf| {
            (cf.column == WS_COLUMN || cf.column == NS_COLUMN)
                && matches!(
                    cf.filter,
                    Filter::EqualsRegex(_) | Filter::NotEqualsRegex(_) | Filter::In(_)
                )
        })
    }

    /// Merge one expanded shard-key tuple into the original filters,
    /// replacing the regex filters it resolves.
    fn pin_tuple(original: &[ColumnFilter], tuple: &[ColumnFilter]) -> Vec<ColumnFilter> {
        let mut pinned: Vec<ColumnFilter> = original
            .iter()
            .filter(|cf| !tuple.iter().any(|t| t.column == cf.column))
            .cloned()
            .collect();
        pinned.extend(tuple.iter().cloned());
        pinned
    }
}

impl QueryPlanner for ShardKeyRegexPlanner {
    fn materialize(
        &self,
        plan: &LogicalPlan,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        let filters = plan.leaf_filters();
        if !Self::has_shard_key_regex(&filters) {
            return self.inner.materialize(plan, qctx);
        }

        let shard_key_filters: Vec<ColumnFilter> = filters
            .iter()
            .filter(|cf| {
                cf.column == WS_COLUMN || cf.column == NS_COLUMN || cf.column == METRIC_COLUMN
            })
            .cloned()
            .collect();
        let tuples = (self.matcher_fn)(&shard_key_filters);
        debug!(expansions = tuples.len(), "shard-key regex expanded");
        if tuples.is_empty() {
            return Ok(ExecPlan::new(
                ExecNode::EmptyResult,
                Arc::clone(&self.dispatcher),
            ));
        }
        if tuples.len() == 1 {
            let pinned = plan.replace_raw_filters(&Self::pin_tuple(&filters, &tuples[0]));
            return self.inner.materialize(&pinned, qctx);
        }

        // An aggregate on top is lifted above the union; per-tuple
        // aggregates are pushed inside so only partial-sized results
        // cross the union.
        if let LogicalPlan::Aggregate {
            operator, params, ..
        } = plan
        {
            if pushdown_safe(*operator) {
                let mut children = Vec::with_capacity(tuples.len());
                for tuple in &tuples {
                    let pinned = plan.replace_raw_filters(&Self::pin_tuple(&filters, tuple));
                    children.push(self.inner.materialize(&pinned, qctx)?);
                }
                return Ok(ExecPlan::new(
                    ExecNode::MultiPartitionReduceAggregate {
                        operator: *operator,
                        params: params.clone(),
                        children,
                    },
                    Arc::clone(&self.dispatcher),
                )
                .with_transformer(RangeVectorTransformer::AggregatePresenter {
                    operator: *operator,
                    params: params.clone(),
                }));
            }
        }

        let mut children = Vec::with_capacity(tuples.len());
        for tuple in &tuples {
            let pinned = plan.replace_raw_filters(&Self::pin_tuple(&filters, tuple));
            children.push(self.inner.materialize(&pinned, qctx)?);
        }
        Ok(ExecPlan::new(
            ExecNode::MultiPartitionDistConcat { children },
            Arc::clone(&self.dispatcher),
        ))
    }
}
