//! Executor runtime: the entry point that turns a materialized plan into
//! a streaming response.
//!
//! The executor owns the store handle and the runtime configuration,
//! creates one [`QuerySession`] per query, and enforces the end-to-end
//! wall-clock budget. On timeout the response is replaced by
//! `QueryError(QueryTimeout)` and the plan's streams are dropped, which
//! closes them.

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::memstore::TimeSeriesMemStore;
use crate::query::exec::ExecPlan;
use crate::query::result::QueryResponse;
use crate::query::session::{QueryContext, QuerySession};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Dispatches materialized plans and threads the per-query session.
pub struct QueryExecutor {
    store: Arc<TimeSeriesMemStore>,
    config: Arc<QueryConfig>,
}

impl QueryExecutor {
    /// Executor over a store handle.
    pub fn new(store: Arc<TimeSeriesMemStore>, config: Arc<QueryConfig>) -> Self {
        Self { store, config }
    }

    /// The runtime configuration used for sessions.
    pub fn config(&self) -> &Arc<QueryConfig> {
        &self.config
    }

    /// Execute a plan to completion or deadline.
    pub async fn execute(&self, plan: &ExecPlan, query_ctx: QueryContext) -> QueryResponse {
        let timeout_ms = query_ctx.planner_params.query_timeout_millis;
        let session = QuerySession::new(query_ctx, Arc::clone(&self.config));
        debug!(query_id = %session.query_ctx.query_id, timeout_ms, "executing plan");

        let fut = plan.execute(&self.store, &session);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(response) => response,
            Err(_) => {
                warn!(query_id = %session.query_ctx.query_id, timeout_ms, "query timed out");
                QueryResponse::error(
                    session.query_ctx.query_id.clone(),
                    session.stats.snapshot(),
                    QueryError::QueryTimeout {
                        elapsed_ms: session.elapsed_ms(),
                        timeout_ms,
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::exec::{ExecNode, InProcessPlanDispatcher};
    use crate::query::session::PlannerParams;

    fn executor() -> QueryExecutor {
        QueryExecutor::new(
            Arc::new(TimeSeriesMemStore::new()),
            Arc::new(QueryConfig::default()),
        )
    }

    fn empty_plan(store: Arc<TimeSeriesMemStore>) -> ExecPlan {
        ExecPlan::new(
            ExecNode::EmptyResult,
            Arc::new(InProcessPlanDispatcher::new(store, "local")),
        )
    }

    #[tokio::test]
    async fn test_empty_plan_yields_empty_result() {
        let exec = executor();
        let plan = empty_plan(Arc::new(TimeSeriesMemStore::new()));
        let response = exec.execute(&plan, QueryContext::new("q1")).await;
        let result = response.into_result().expect("should succeed");
        assert!(result.range_vectors.is_empty());
        assert_eq!(result.id, "q1");
    }

    #[tokio::test]
    async fn test_zero_timeout_reports_query_timeout() {
        let exec = executor();
        let plan = empty_plan(Arc::new(TimeSeriesMemStore::new()));
        let ctx = QueryContext::new("q2").with_planner_params(PlannerParams {
            query_timeout_millis: 0,
            ..PlannerParams::default()
        });
        let response = exec.execute(&plan, ctx).await;
        let failure = response.into_result().expect_err("should time out");
        assert!(matches!(failure.error, QueryError::QueryTimeout { .. }));
    }
}
