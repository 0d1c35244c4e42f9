//! Per-query context and execution session.
//!
//! [`QueryContext`] is immutable and travels with the plan: origin
//! parameters plus the planner knobs a caller may override per query.
//! [`QuerySession`] is created once per execution and owns the mutable
//! side: the stats accumulator, the deadline, and the scheduler permit
//! pool bounding concurrent child dispatches.

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::query::result::QueryStats;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// Per-tenant limits a gateway may enforce on top of the server config.
/// `None` fields fall back to the runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnforcedLimits {
    /// Tighter bound on shards one leaf fan-out may touch.
    pub max_shards_per_query: Option<usize>,
    /// Tighter bound on the per-leaf sample cap.
    pub max_samples: Option<usize>,
}

/// Caller-supplied planning knobs, carried on the wire with the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerParams {
    /// Overrides the spread provider when set.
    pub spread_override: Option<u8>,
    /// End-to-end wall-clock budget.
    pub query_timeout_millis: u64,
    /// Cap on samples a single leaf may materialize.
    pub sample_limit: usize,
    /// Whether the multi-partition planner may fan out to remote
    /// partitions.
    pub process_multi_partition: bool,
    /// Downgrade missing shards to a partial result instead of failing.
    pub allow_partial_results: bool,
    /// Tenant-level limit overrides.
    pub enforced_limits: EnforcedLimits,
}

impl Default for PlannerParams {
    fn default() -> Self {
        Self {
            spread_override: None,
            query_timeout_millis: 30_000,
            sample_limit: 1_000_000,
            process_multi_partition: false,
            allow_partial_results: false,
            enforced_limits: EnforcedLimits::default(),
        }
    }
}

/// Immutable context of one query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Unique id assigned at the boundary.
    pub query_id: String,
    /// The original query text, for logs and remote fragments.
    pub origin_query: String,
    /// Planner knobs.
    pub planner_params: PlannerParams,
    /// Submission wall time, epoch ms.
    pub submit_time_ms: i64,
}

impl QueryContext {
    /// Context with default params.
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            origin_query: String::new(),
            planner_params: PlannerParams::default(),
            submit_time_ms: 0,
        }
    }

    /// Replace the planner params.
    pub fn with_planner_params(mut self, params: PlannerParams) -> Self {
        self.planner_params = params;
        self
    }

    /// Attach the original query text.
    pub fn with_origin(mut self, query: impl Into<String>) -> Self {
        self.origin_query = query.into();
        self
    }
}

/// Mutable execution state for one query.
pub struct QuerySession {
    /// The immutable context.
    pub query_ctx: QueryContext,
    /// Runtime configuration.
    pub query_config: Arc<QueryConfig>,
    /// Stats accumulator shared by every operator of this query.
    pub stats: Arc<QueryStats>,
    started: Instant,
    /// Bounds concurrent child dispatches per the scheduler config.
    dispatch_permits: Arc<Semaphore>,
}

impl QuerySession {
    /// Fresh session for one execution.
    pub fn new(query_ctx: QueryContext, query_config: Arc<QueryConfig>) -> Self {
        let permits = query_config.scheduler.max_pool_size.max(1);
        Self {
            query_ctx,
            query_config,
            stats: QueryStats::new(),
            started: Instant::now(),
            dispatch_permits: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Session for a child dispatch: same context, config and stats, same
    /// deadline clock.
    pub fn child(&self) -> Self {
        Self {
            query_ctx: self.query_ctx.clone(),
            query_config: Arc::clone(&self.query_config),
            stats: Arc::clone(&self.stats),
            started: self.started,
            dispatch_permits: Arc::clone(&self.dispatch_permits),
        }
    }

    /// Milliseconds spent so far.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Remaining wall-clock budget, an error when exhausted.
    pub fn ensure_time_remaining(&self) -> Result<(), QueryError> {
        let timeout = self.query_ctx.planner_params.query_timeout_millis;
        let elapsed = self.elapsed_ms();
        if elapsed >= timeout {
            Err(QueryError::QueryTimeout {
                elapsed_ms: elapsed,
                timeout_ms: timeout,
            })
        } else {
            Ok(())
        }
    }

    /// Acquire a scheduler permit before dispatching a child plan.
    pub async fn acquire_dispatch_permit(&self) -> tokio::sync::OwnedSemaphorePermit {
        Arc::clone(&self.dispatch_permits)
            .acquire_owned()
            .await
            .expect("dispatch semaphore never closes")
    }

    /// The effective sample cap: the request's, tightened by any
    /// enforced tenant limit.
    pub fn sample_limit(&self) -> usize {
        let params = &self.query_ctx.planner_params;
        match params.enforced_limits.max_samples {
            Some(enforced) => params.sample_limit.min(enforced),
            None => params.sample_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_shares_stats() {
        let session = QuerySession::new(QueryContext::new("q1"), Arc::new(QueryConfig::default()));
        let child = session.child();
        child.stats.add_samples(5);
        assert_eq!(session.stats.snapshot().samples_scanned, 5);
    }

    #[test]
    fn test_zero_timeout_fails_immediately() {
        let ctx = QueryContext::new("q1").with_planner_params(PlannerParams {
            query_timeout_millis: 0,
            ..PlannerParams::default()
        });
        let session = QuerySession::new(ctx, Arc::new(QueryConfig::default()));
        assert!(matches!(
            session.ensure_time_remaining(),
            Err(QueryError::QueryTimeout { .. })
        ));
    }

    #[test]
    fn test_planner_params_serde_round_trip() {
        let params = PlannerParams {
            spread_override: Some(2),
            sample_limit: 10,
            ..PlannerParams::default()
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: PlannerParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.spread_override, Some(2));
        assert_eq!(back.sample_limit, 10);
    }
}
