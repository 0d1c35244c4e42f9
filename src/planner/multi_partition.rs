//! Multi-partition planner: routes subqueries between the local partition
//! and remote partitions reachable over PromQL/HTTP.
//!
//! Routing is by shard-key values (the routing key) and by time: a
//! partition assignment covers a time range, so a series that moved
//! between partitions is answered by one fragment per assignment, united
//! by a stitcher, or by a partial-aggregate reduce when the operator on
//! top is an associative aggregate with unchanged grouping.

use crate::error::QueryError;
use crate::planner::{
    align_down, align_up, grid_of, pushdown_safe, shard_key_values, with_grid, QueryPlanner,
};
use crate::query::exec::remote::{RemoteExecClient, RemoteQueryRequest};
use crate::query::exec::{ExecNode, ExecPlan, PlanDispatcher, RemoteExecDispatcher};
use crate::query::logical::LogicalPlan;
use crate::query::session::QueryContext;
use crate::query::transformers::RangeVectorTransformer;
use crate::types::{TimeRange, NS_COLUMN, WS_COLUMN};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One partition owning a routing key over a time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    /// Partition name.
    pub name: String,
    /// PromQL endpoint of the partition.
    pub endpoint_url: String,
    /// Time range the partition owns.
    pub time_range: TimeRange,
}

/// Source of partition assignments, injected at construction.
pub trait PartitionLocationProvider: Send + Sync {
    /// Partitions owning `routing_key` within the time range, ordered by
    /// time.
    fn get_partitions(
        &self,
        routing_key: &HashMap<String, String>,
        time_range: TimeRange,
    ) -> Vec<PartitionAssignment>;

    /// Every partition the caller may query in the time range.
    fn get_authorized_partitions(&self, time_range: TimeRange) -> Vec<PartitionAssignment>;
}

/// Routes plan fragments to the local planner or remote partitions.
pub struct MultiPartitionPlanner {
    provider: Arc<dyn PartitionLocationProvider>,
    local_partition_name: String,
    inner: Arc<dyn QueryPlanner>,
    remote_client: Arc<dyn RemoteExecClient>,
    dispatcher: Arc<dyn PlanDispatcher>,
    remote_timeout_ms: u64,
}

impl MultiPartitionPlanner {
    /// Planner over a location provider and the in-partition planner.
    pub fn new(
        provider: Arc<dyn PartitionLocationProvider>,
        local_partition_name: impl Into<String>,
        inner: Arc<dyn QueryPlanner>,
        remote_client: Arc<dyn RemoteExecClient>,
        dispatcher: Arc<dyn PlanDispatcher>,
    ) -> Self {
        Self {
            provider,
            local_partition_name: local_partition_name.into(),
            inner,
            remote_client,
            dispatcher,
            remote_timeout_ms: 30_000,
        }
    }

    fn routing_key(&self, plan: &LogicalPlan) -> HashMap<String, String> {
        let filters = plan.leaf_filters();
        let mut key = HashMap::new();
        if let Some(values) =
            shard_key_values(&filters, &[WS_COLUMN.to_string(), NS_COLUMN.to_string()])
        {
            key.insert(WS_COLUMN.to_string(), values[0].clone());
            key.insert(NS_COLUMN.to_string(), values[1].clone());
        }
        key
    }

    /// A `PromQlRemoteExec` leaf for a fragment owned by a remote
    /// partition.
    fn remote_exec(
        &self,
        plan: &LogicalPlan,
        assignment: &PartitionAssignment,
    ) -> Result<ExecPlan, QueryError> {
        let (start_ms, step_ms, end_ms) = grid_of(plan).unwrap_or_else(|| {
            let range = plan.query_time_range();
            (range.start_ms, 0, range.end_ms)
        });
        let request = RemoteQueryRequest {
            query: plan.to_promql()?,
            start_secs: start_ms / 1000,
            step_secs: step_ms / 1000,
            end_secs: end_ms / 1000,
            url_params: HashMap::new(),
        };
        Ok(ExecPlan::new(
            ExecNode::PromQlRemote {
                endpoint: assignment.endpoint_url.clone(),
                timeout_ms: self.remote_timeout_ms,
                request,
            },
            Arc::new(RemoteExecDispatcher::new(
                Arc::clone(&self.remote_client),
                assignment.name.clone(),
            )),
        ))
    }

    /// Clip the plan's grid to one assignment's time window.
    fn clip_to_assignment(
        &self,
        plan: &LogicalPlan,
        assignment: &PartitionAssignment,
    ) -> Option<LogicalPlan> {
        let (start_ms, step_ms, end_ms) = grid_of(plan)?;
        let clipped_start = align_up(assignment.time_range.start_ms.max(start_ms), start_ms, step_ms);
        let clipped_end = align_down(assignment.time_range.end_ms.min(end_ms), start_ms, step_ms)?;
        if clipped_start > clipped_end {
            return None;
        }
        Some(with_grid(plan, clipped_start, step_ms, clipped_end))
    }

    fn materialize_fragment(
        &self,
        plan: &LogicalPlan,
        assignment: &PartitionAssignment,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        if assignment.name == self.local_partition_name {
            self.inner.materialize(plan, qctx)
        } else {
            self.remote_exec(plan, assignment)
        }
    }
}

impl QueryPlanner for MultiPartitionPlanner {
    fn materialize(
        &self,
        plan: &LogicalPlan,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        if !qctx.planner_params.process_multi_partition {
            return self.inner.materialize(plan, qctx);
        }

        // Joins route each side independently; the join itself runs in
        // process above the routed sides.
        match plan {
            LogicalPlan::BinaryJoin {
                lhs,
                rhs,
                operator,
                cardinality,
                on,
                ignoring,
                include,
            } => {
                return Ok(ExecPlan::new(
                    ExecNode::BinaryJoin {
                        lhs: Box::new(self.materialize(lhs, qctx)?),
                        rhs: Box::new(self.materialize(rhs, qctx)?),
                        operator: *operator,
                        cardinality: *cardinality,
                        on: on.clone(),
                        ignoring: ignoring.clone(),
                        include: include.clone(),
                    },
                    Arc::clone(&self.dispatcher),
                ))
            }
            LogicalPlan::SetOp {
                lhs,
                rhs,
                operator,
                on,
                ignoring,
            } => {
                return Ok(ExecPlan::new(
                    ExecNode::SetOperator {
                        lhs: Box::new(self.materialize(lhs, qctx)?),
                        rhs: Box::new(self.materialize(rhs, qctx)?),
                        operator: *operator,
                        on: on.clone(),
                        ignoring: ignoring.clone(),
                    },
                    Arc::clone(&self.dispatcher),
                ))
            }
            _ => {}
        }

        let routing_key = self.routing_key(plan);
        let time_range = plan.query_time_range();
        let assignments = if routing_key.is_empty() {
            self.provider.get_authorized_partitions(time_range)
        } else {
            self.provider.get_partitions(&routing_key, time_range)
        };
        debug!(?routing_key, partitions = assignments.len(), "partition routing");

        match assignments.len() {
            0 => self.inner.materialize(plan, qctx),
            1 => self.materialize_fragment(plan, &assignments[0], qctx),
            _ => {
                let mut children = Vec::with_capacity(assignments.len());
                for assignment in &assignments {
                    let fragment = self
                        .clip_to_assignment(plan, assignment)
                        .unwrap_or_else(|| plan.clone());
                    children.push(self.materialize_fragment(&fragment, assignment, qctx)?);
                }

                if let LogicalPlan::Aggregate {
                    operator, params, ..
                } = plan
                {
                    if pushdown_safe(*operator) {
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

                // Time-split fragments of the same series need stitching.
                Ok(ExecPlan::new(
                    ExecNode::MultiPartitionDistConcat { children },
                    Arc::clone(&self.dispatcher),
                )
                .with_transformer(RangeVectorTransformer::StitchRvsMapper))
            }
        }
    }
}
