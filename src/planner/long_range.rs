//! Long-time-range planner: splits a query between the raw and
//! downsample tiers at the raw-earliest/downsample-latest boundary and
//! stitches the two halves.

use crate::error::QueryError;
use crate::planner::{align_down, align_up, grid_of, with_grid, QueryPlanner};
use crate::query::exec::{ExecNode, ExecPlan, PlanDispatcher};
use crate::query::logical::LogicalPlan;
use crate::query::session::QueryContext;
use std::sync::Arc;
use tracing::debug;

/// Wall-clock function for a moving tier boundary.
pub type TierBoundaryFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Splits across the raw and downsample planners.
pub struct LongTimeRangePlanner {
    raw_planner: Arc<dyn QueryPlanner>,
    downsample_planner: Arc<dyn QueryPlanner>,
    earliest_raw_timestamp_fn: TierBoundaryFn,
    latest_downsample_timestamp_fn: TierBoundaryFn,
    dispatcher: Arc<dyn PlanDispatcher>,
}

impl LongTimeRangePlanner {
    /// Planner over the two tier planners.
    pub fn new(
        raw_planner: Arc<dyn QueryPlanner>,
        downsample_planner: Arc<dyn QueryPlanner>,
        earliest_raw_timestamp_fn: TierBoundaryFn,
        latest_downsample_timestamp_fn: TierBoundaryFn,
        dispatcher: Arc<dyn PlanDispatcher>,
    ) -> Self {
        Self {
            raw_planner,
            downsample_planner,
            earliest_raw_timestamp_fn,
            latest_downsample_timestamp_fn,
            dispatcher,
        }
    }
}

impl QueryPlanner for LongTimeRangePlanner {
    fn materialize(
        &self,
        plan: &LogicalPlan,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        // Metadata and non-periodic plans always go to raw.
        let Some((start_ms, step_ms, end_ms)) = grid_of(plan) else {
            return self.raw_planner.materialize(plan, qctx);
        };

        let earliest_raw = (self.earliest_raw_timestamp_fn)();
        let latest_downsample = (self.latest_downsample_timestamp_fn)();

        if start_ms >= earliest_raw {
            return self.raw_planner.materialize(plan, qctx);
        }
        if end_ms <= latest_downsample && end_ms < earliest_raw {
            return self.downsample_planner.materialize(plan, qctx);
        }

        // Raw grid starts at the first step at or after the raw horizon;
        // the downsample grid ends at the last step at or before the
        // downsample horizon.
        let raw_start = align_up(earliest_raw, start_ms, step_ms);
        let downsample_end = align_down(latest_downsample, start_ms, step_ms);

        let raw_part = (raw_start <= end_ms)
            .then(|| with_grid(plan, raw_start, step_ms, end_ms));
        let downsample_part = downsample_end
            .filter(|end| *end >= start_ms)
            .map(|end| with_grid(plan, start_ms, step_ms, end));

        debug!(
            start_ms,
            end_ms,
            earliest_raw,
            latest_downsample,
            split = raw_part.is_some() && downsample_part.is_some(),
            "long-range split"
        );

        match (raw_part, downsample_part) {
            (Some(raw), Some(downsample)) => {
                let children = vec![
                    self.downsample_planner.materialize(&downsample, qctx)?,
                    self.raw_planner.materialize(&raw, qctx)?,
                ];
                Ok(ExecPlan::new(
                    ExecNode::StitchRvs { children },
                    Arc::clone(&self.dispatcher),
                ))
            }
            (Some(raw), None) => self.raw_planner.materialize(&raw, qctx),
            (None, Some(downsample)) => self.downsample_planner.materialize(&downsample, qctx),
            (None, None) => self.raw_planner.materialize(plan, qctx),
        }
    }
}
