//! Single-partition planner: routes a query to one of several named
//! planners by metric name.
//!
//! The stock rule sends recording-rule metrics (`foo:1m`, `bar:5m`) to
//! the recording-rules planner, which has its own retention and no
//! downsampling, and everything else to the long-term planner.

use crate::error::QueryError;
use crate::planner::QueryPlanner;
use crate::query::exec::ExecPlan;
use crate::query::filter::Filter;
use crate::query::logical::LogicalPlan;
use crate::query::session::QueryContext;
use crate::types::METRIC_COLUMN;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Picks a planner name from a metric name.
pub type PlannerSelectorFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Conventional planner names.
pub const LONG_TERM_PLANNER: &str = "longTerm";
/// Planner name for recording-rule metrics.
pub const RECORDING_RULES_PLANNER: &str = "recordingRules";

/// The stock selector: interval-suffixed metrics go to recording rules.
pub fn default_planner_selector() -> PlannerSelectorFn {
    let rule_suffix = Regex::new(r":\d+[smhd]").expect("static pattern");
    Arc::new(move |metric: &str| {
        if rule_suffix.is_match(metric) {
            RECORDING_RULES_PLANNER.to_string()
        } else {
            LONG_TERM_PLANNER.to_string()
        }
    })
}

/// Routes by metric name across named planners.
pub struct SinglePartitionPlanner {
    planners: HashMap<String, Arc<dyn QueryPlanner>>,
    plan_selector: PlannerSelectorFn,
    default_planner: String,
}

impl SinglePartitionPlanner {
    /// Planner over the name-to-planner mapping.
    pub fn new(
        planners: HashMap<String, Arc<dyn QueryPlanner>>,
        plan_selector: PlannerSelectorFn,
        default_planner: impl Into<String>,
    ) -> Self {
        Self {
            planners,
            plan_selector,
            default_planner: default_planner.into(),
        }
    }

    fn metric_name(plan: &LogicalPlan) -> Option<String> {
        plan.leaf_filters().iter().find_map(|cf| {
            if cf.column == METRIC_COLUMN {
                match &cf.filter {
                    Filter::Equals(name) => Some(name.clone()),
                    _ => None,
                }
            } else {
                None
            }
        })
    }
}

impl QueryPlanner for SinglePartitionPlanner {
    fn materialize(
        &self,
        plan: &LogicalPlan,
        qctx: &QueryContext,
    ) -> Result<ExecPlan, QueryError> {
        let planner_name = Self::metric_name(plan)
            .map(|metric| (self.plan_selector)(&metric))
            .unwrap_or_else(|| self.default_planner.clone());
        debug!(planner = %planner_name, "planner selected");
        let planner = self
            .planners
            .get(&planner_name)
            .or_else(|| self.planners.get(&self.default_planner))
            .ok_or_else(|| {
                QueryError::internal(format!("no planner registered for '{planner_name}'"))
            })?;
        planner.materialize(plan, qctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_selector_routes_recording_rules() {
        let selector = default_planner_selector();
        assert_eq!(selector("foo:1m"), RECORDING_RULES_PLANNER);
        assert_eq!(selector("latency:5m"), RECORDING_RULES_PLANNER);
        assert_eq!(selector("foo:rule:1h"), RECORDING_RULES_PLANNER);
        assert_eq!(selector("http_requests_total"), LONG_TERM_PLANNER);
        assert_eq!(selector("foo:bar"), LONG_TERM_PLANNER);
    }
}
