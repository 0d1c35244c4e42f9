//! Executable plans.
//!
//! An [`ExecPlan`] is a tree of [`ExecNode`]s, each carrying its operator
//! parameters, an ordered list of stream transformers, and the
//! [`PlanDispatcher`] that decides where the node runs. Non-leaf nodes
//! dispatch their children through each child's dispatcher and merge the
//! returned streams; leaves scan the local store or a remote partition.
//!
//! ```text
//!            E~LocalPartitionReduceAggregateExec   (fold partials)
//!            /                      \
//!   E~MultiSchemaPartitionsExec   E~MultiSchemaPartitionsExec
//!     T~PeriodicSamplesMapper       T~PeriodicSamplesMapper
//!     T~AggregateMapReduce          T~AggregateMapReduce
//! ```
//!
//! Errors fail fast: the first failing child aborts the node, and sibling
//! streams are closed.

pub mod binary_join;
pub mod remote;
pub mod scan;

use crate::error::QueryError;
use crate::memstore::TimeSeriesMemStore;
use crate::query::filter::ColumnFilter;
use crate::query::logical::{
    AggParam, AggregationOperator, BinaryOperator, Cardinality, SetOperator,
};
use crate::query::range_vector::RangeVectorKey;
use crate::query::result::{reduce_schemas, QueryResponse, QueryResult};
use crate::query::session::{QueryContext, QuerySession};
use crate::query::stitch;
use crate::query::transformers::{aggregation, RangeVectorTransformer};
use crate::types::{ChunkScanMethod, DatasetRef, ShardId};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use remote::{RemoteExecClient, RemoteQueryRequest};
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Where and how a plan node executes.
///
/// Planners attach a dispatcher to every node; execution calls
/// [`PlanDispatcher::dispatch`] for each child, which runs the subtree in
/// process, on a coordinator, or not at all for remote leaves that speak
/// PromQL.
#[async_trait]
pub trait PlanDispatcher: Send + Sync {
    /// Execute `plan` wherever this dispatcher points and return the
    /// streaming response.
    async fn dispatch(&self, plan: &ExecPlan, session: &QuerySession) -> QueryResponse;

    /// Cluster this dispatcher targets.
    fn cluster_name(&self) -> &str;

    /// Whether dispatch stays in this process.
    fn is_local_call(&self) -> bool;
}

/// Runs the subtree in process against a store handle, with a fresh child
/// session sharing the parent's stats and deadline.
pub struct InProcessPlanDispatcher {
    store: Arc<TimeSeriesMemStore>,
    cluster: String,
}

impl InProcessPlanDispatcher {
    /// Dispatcher over the given store.
    pub fn new(store: Arc<TimeSeriesMemStore>, cluster: impl Into<String>) -> Self {
        Self {
            store,
            cluster: cluster.into(),
        }
    }
}

#[async_trait]
impl PlanDispatcher for InProcessPlanDispatcher {
    async fn dispatch(&self, plan: &ExecPlan, session: &QuerySession) -> QueryResponse {
        let child_session = session.child();
        plan.execute(&self.store, &child_session).await
    }

    fn cluster_name(&self) -> &str {
        &self.cluster
    }

    fn is_local_call(&self) -> bool {
        true
    }
}

/// External coordinator able to run a plan on the node that owns its
/// shards. The wire format between this process and the coordinator is
/// the coordinator's business.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Run the plan remotely and stream the response back.
    async fn execute_plan(&self, plan: &ExecPlan, query_ctx: &QueryContext) -> QueryResponse;
}

/// Delegates a subtree to an external coordinator.
pub struct CoordinatorPlanDispatcher {
    client: Arc<dyn CoordinatorClient>,
    cluster: String,
}

impl CoordinatorPlanDispatcher {
    /// Dispatcher over a coordinator client.
    pub fn new(client: Arc<dyn CoordinatorClient>, cluster: impl Into<String>) -> Self {
        Self {
            client,
            cluster: cluster.into(),
        }
    }
}

#[async_trait]
impl PlanDispatcher for CoordinatorPlanDispatcher {
    async fn dispatch(&self, plan: &ExecPlan, session: &QuerySession) -> QueryResponse {
        self.client.execute_plan(plan, &session.query_ctx).await
    }

    fn cluster_name(&self) -> &str {
        &self.cluster
    }

    fn is_local_call(&self) -> bool {
        false
    }
}

/// Dispatches `PromQlRemoteExec` leaves over an injected HTTP client.
pub struct RemoteExecDispatcher {
    client: Arc<dyn RemoteExecClient>,
    cluster: String,
}

impl RemoteExecDispatcher {
    /// Dispatcher over an HTTP client.
    pub fn new(client: Arc<dyn RemoteExecClient>, cluster: impl Into<String>) -> Self {
        Self {
            client,
            cluster: cluster.into(),
        }
    }
}

#[async_trait]
impl PlanDispatcher for RemoteExecDispatcher {
    async fn dispatch(&self, plan: &ExecPlan, session: &QuerySession) -> QueryResponse {
        let ExecNode::PromQlRemote {
            endpoint,
            timeout_ms,
            request,
        } = &plan.node
        else {
            return QueryResponse::error(
                session.query_ctx.query_id.clone(),
                session.stats.snapshot(),
                QueryError::internal("remote dispatcher given a non-remote plan"),
            );
        };
        match remote::execute_remote(&*self.client, endpoint, request, *timeout_ms, session).await {
            Ok(result) => QueryResponse::Result(result),
            Err(err) => QueryResponse::error(
                session.query_ctx.query_id.clone(),
                session.stats.snapshot(),
                QueryError::Remote(err.to_string()),
            ),
        }
    }

    fn cluster_name(&self) -> &str {
        &self.cluster
    }

    fn is_local_call(&self) -> bool {
        false
    }
}

/// One operator of the physical plan.
#[derive(Clone)]
pub enum ExecNode {
    /// Materializes an empty result; the planner emits this when
    /// retention clipping leaves nothing to scan.
    EmptyResult,

    /// Shard-local partition scan.
    MultiSchemaPartitionsScan {
        /// Target dataset.
        dataset: DatasetRef,
        /// Target shard.
        shard: ShardId,
        /// Scan window.
        chunk_method: ChunkScanMethod,
        /// Label filters.
        filters: Vec<ColumnFilter>,
    },

    /// Metadata leaf: label values.
    LabelValuesScan {
        /// Target dataset.
        dataset: DatasetRef,
        /// Target shard.
        shard: ShardId,
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Labels to report.
        label_names: Vec<String>,
        /// Window start.
        start_ms: i64,
        /// Window end.
        end_ms: i64,
    },

    /// Metadata leaf: label names.
    LabelNamesScan {
        /// Target dataset.
        dataset: DatasetRef,
        /// Target shard.
        shard: ShardId,
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Window start.
        start_ms: i64,
        /// Window end.
        end_ms: i64,
    },

    /// Metadata leaf: part keys.
    PartKeysScan {
        /// Target dataset.
        dataset: DatasetRef,
        /// Target shard.
        shard: ShardId,
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Window start.
        start_ms: i64,
        /// Window end.
        end_ms: i64,
    },

    /// Metadata leaf: label cardinality partials.
    LabelCardinalityScan {
        /// Target dataset.
        dataset: DatasetRef,
        /// Target shard.
        shard: ShardId,
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Window start.
        start_ms: i64,
        /// Window end.
        end_ms: i64,
    },

    /// Metadata leaf: per-metric series counts under a shard-key prefix.
    TopkCardScan {
        /// Target dataset.
        dataset: DatasetRef,
        /// Target shard.
        shard: ShardId,
        /// Shard-key prefix values.
        shard_key_prefix: Vec<String>,
        /// How many metrics.
        k: usize,
        /// Count series outside retention too.
        include_inactive: bool,
    },

    /// Remote partition leaf speaking PromQL over HTTP.
    PromQlRemote {
        /// Remote partition endpoint.
        endpoint: String,
        /// Remote call budget.
        timeout_ms: u64,
        /// The serialized fragment and range.
        request: RemoteQueryRequest,
    },

    /// Timestamp-ordered merge of same-key streams across children.
    StitchRvs {
        /// Subplans whose outputs are merged.
        children: Vec<ExecPlan>,
    },

    /// Concatenation of child streams within one partition.
    LocalPartitionDistConcat {
        /// Subplans.
        children: Vec<ExecPlan>,
    },

    /// Concatenation of child streams across partitions.
    MultiPartitionDistConcat {
        /// Subplans.
        children: Vec<ExecPlan>,
    },

    /// Fold of child partial-aggregate streams within one partition.
    LocalPartitionReduceAggregate {
        /// The operator.
        operator: AggregationOperator,
        /// Operator parameters.
        params: Vec<AggParam>,
        /// Subplans emitting partial rows.
        children: Vec<ExecPlan>,
    },

    /// Fold of child partial-aggregate streams across partitions.
    MultiPartitionReduceAggregate {
        /// The operator.
        operator: AggregationOperator,
        /// Operator parameters.
        params: Vec<AggParam>,
        /// Subplans emitting partial rows.
        children: Vec<ExecPlan>,
    },

    /// Concatenation of label-values leaves, deduplicated.
    LabelValuesDistConcat {
        /// Subplans.
        children: Vec<ExecPlan>,
    },

    /// Concatenation of label-names leaves, deduplicated.
    LabelNamesDistConcat {
        /// Subplans.
        children: Vec<ExecPlan>,
    },

    /// Concatenation of part-keys leaves, deduplicated.
    PartKeysDistConcat {
        /// Subplans.
        children: Vec<ExecPlan>,
    },

    /// Union of label-cardinality partials across shards.
    LabelCardinalityReduce {
        /// Subplans.
        children: Vec<ExecPlan>,
    },

    /// Sum of per-shard series counts; the presenter orders and truncates.
    TopkCardReduce {
        /// How many metrics survive presentation.
        k: usize,
        /// Subplans.
        children: Vec<ExecPlan>,
    },

    /// Vector-vector arithmetic or comparison.
    BinaryJoin {
        /// Left subplan.
        lhs: Box<ExecPlan>,
        /// Right subplan.
        rhs: Box<ExecPlan>,
        /// The operator.
        operator: BinaryOperator,
        /// Join cardinality.
        cardinality: Cardinality,
        /// Join on these labels only.
        on: Vec<String>,
        /// Join ignoring these labels.
        ignoring: Vec<String>,
        /// Labels carried from the one side.
        include: Vec<String>,
    },

    /// Vector-vector set operation.
    SetOperator {
        /// Left subplan.
        lhs: Box<ExecPlan>,
        /// Right subplan.
        rhs: Box<ExecPlan>,
        /// The operator.
        operator: SetOperator,
        /// Match on these labels only.
        on: Vec<String>,
        /// Match ignoring these labels.
        ignoring: Vec<String>,
    },
}

impl ExecNode {
    /// Display name matching the operator vocabulary used in plan trees.
    pub fn name(&self) -> &'static str {
        match self {
            ExecNode::EmptyResult => "EmptyResultExec",
            ExecNode::MultiSchemaPartitionsScan { .. } => "MultiSchemaPartitionsExec",
            ExecNode::LabelValuesScan { .. } => "LabelValuesExec",
            ExecNode::LabelNamesScan { .. } => "LabelNamesExec",
            ExecNode::PartKeysScan { .. } => "PartKeysExec",
            ExecNode::LabelCardinalityScan { .. } => "LabelCardinalityExec",
            ExecNode::TopkCardScan { .. } => "TopkCardExec",
            ExecNode::PromQlRemote { .. } => "PromQlRemoteExec",
            ExecNode::StitchRvs { .. } => "StitchRvsExec",
            ExecNode::LocalPartitionDistConcat { .. } => "LocalPartitionDistConcatExec",
            ExecNode::MultiPartitionDistConcat { .. } => "MultiPartitionDistConcatExec",
            ExecNode::LocalPartitionReduceAggregate { .. } => "LocalPartitionReduceAggregateExec",
            ExecNode::MultiPartitionReduceAggregate { .. } => "MultiPartitionReduceAggregateExec",
            ExecNode::LabelValuesDistConcat { .. } => "LabelValuesDistConcatExec",
            ExecNode::LabelNamesDistConcat { .. } => "LabelNamesDistConcatExec",
            ExecNode::PartKeysDistConcat { .. } => "PartKeysDistConcatExec",
            ExecNode::LabelCardinalityReduce { .. } => "LabelCardinalityReduceExec",
            ExecNode::TopkCardReduce { .. } => "TopkCardReduceExec",
            ExecNode::BinaryJoin { .. } => "BinaryJoinExec",
            ExecNode::SetOperator { .. } => "SetOperatorExec",
        }
    }

    /// Child subplans, in dispatch order.
    pub fn children(&self) -> Vec<&ExecPlan> {
        match self {
            ExecNode::StitchRvs { children }
            | ExecNode::LocalPartitionDistConcat { children }
            | ExecNode::MultiPartitionDistConcat { children }
            | ExecNode::LocalPartitionReduceAggregate { children, .. }
            | ExecNode::MultiPartitionReduceAggregate { children, .. }
            | ExecNode::LabelValuesDistConcat { children }
            | ExecNode::LabelNamesDistConcat { children }
            | ExecNode::PartKeysDistConcat { children }
            | ExecNode::LabelCardinalityReduce { children }
            | ExecNode::TopkCardReduce { children, .. } => children.iter().collect(),
            ExecNode::BinaryJoin { lhs, rhs, .. } | ExecNode::SetOperator { lhs, rhs, .. } => {
                vec![lhs.as_ref(), rhs.as_ref()]
            }
            _ => Vec::new(),
        }
    }
}

/// An executable plan node with its transformers and dispatcher.
#[derive(Clone)]
pub struct ExecPlan {
    /// The operator.
    pub node: ExecNode,
    /// Stream transformations applied, in order, to the node's output.
    pub transformers: Vec<RangeVectorTransformer>,
    /// Where this node runs.
    pub dispatcher: Arc<dyn PlanDispatcher>,
}

impl ExecPlan {
    /// Plan with no transformers.
    pub fn new(node: ExecNode, dispatcher: Arc<dyn PlanDispatcher>) -> Self {
        Self {
            node,
            transformers: Vec::new(),
            dispatcher,
        }
    }

    /// Append a transformer.
    pub fn with_transformer(mut self, transformer: RangeVectorTransformer) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Execute this subtree against a store. Children are dispatched via
    /// their own dispatchers; this call only assumes the local store for
    /// leaves that scan it.
    pub fn execute<'a>(
        &'a self,
        store: &'a TimeSeriesMemStore,
        session: &'a QuerySession,
    ) -> BoxFuture<'a, QueryResponse> {
        async move {
            if let Err(err) = session.ensure_time_remaining() {
                return QueryResponse::error(
                    session.query_ctx.query_id.clone(),
                    session.stats.snapshot(),
                    err,
                );
            }
            let base = self.execute_node(store, session).await;
            let mut result = match base {
                Ok(result) => result,
                Err(err) => {
                    return QueryResponse::error(
                        session.query_ctx.query_id.clone(),
                        session.stats.snapshot(),
                        err,
                    )
                }
            };
            for transformer in &self.transformers {
                result = match transformer.apply(result, session) {
                    Ok(result) => result,
                    Err(err) => {
                        return QueryResponse::error(
                            session.query_ctx.query_id.clone(),
                            session.stats.snapshot(),
                            err,
                        )
                    }
                };
            }
            result.stats = session.stats.snapshot();
            QueryResponse::Result(result)
        }
        .boxed()
    }

    async fn execute_node(
        &self,
        store: &TimeSeriesMemStore,
        session: &QuerySession,
    ) -> Result<QueryResult, QueryError> {
        match &self.node {
            ExecNode::EmptyResult => Ok(QueryResult::empty(session.query_ctx.query_id.clone())),
            ExecNode::MultiSchemaPartitionsScan {
                dataset,
                shard,
                chunk_method,
                filters,
            } => scan::partitions_scan(store, dataset, *shard, filters, *chunk_method, session),
            ExecNode::LabelValuesScan {
                dataset,
                shard,
                filters,
                label_names,
                start_ms,
                end_ms,
            } => scan::label_values_scan(
                store, dataset, *shard, filters, label_names, *start_ms, *end_ms, session,
            ),
            ExecNode::LabelNamesScan {
                dataset,
                shard,
                filters,
                start_ms,
                end_ms,
            } => scan::label_names_scan(store, dataset, *shard, filters, *start_ms, *end_ms, session),
            ExecNode::PartKeysScan {
                dataset,
                shard,
                filters,
                start_ms,
                end_ms,
            } => scan::part_keys_scan(store, dataset, *shard, filters, *start_ms, *end_ms, session),
            ExecNode::LabelCardinalityScan {
                dataset,
                shard,
                filters,
                start_ms,
                end_ms,
            } => scan::label_cardinality_scan(
                store, dataset, *shard, filters, *start_ms, *end_ms, session,
            ),
            ExecNode::TopkCardScan {
                dataset,
                shard,
                shard_key_prefix,
                k,
                include_inactive,
            } => scan::topk_cardinality_scan(
                store,
                dataset,
                *shard,
                shard_key_prefix,
                *k,
                *include_inactive,
                session,
            ),
            ExecNode::PromQlRemote { .. } => Err(QueryError::internal(
                "PromQlRemoteExec must be executed through its dispatcher",
            )),
            ExecNode::StitchRvs { children } => {
                let mut merged = concat_children(children, session).await?;
                merged.range_vectors = stitch::stitch(merged.range_vectors);
                Ok(merged)
            }
            ExecNode::LocalPartitionDistConcat { children }
            | ExecNode::MultiPartitionDistConcat { children } => {
                concat_children(children, session).await
            }
            ExecNode::LocalPartitionReduceAggregate {
                operator,
                params,
                children,
            }
            | ExecNode::MultiPartitionReduceAggregate {
                operator,
                params,
                children,
            } => {
                let results = dispatch_children(children, session).await?;
                if results.is_empty() {
                    return Ok(QueryResult::empty(session.query_ctx.query_id.clone()));
                }
                let (results, partial, partial_reason) = collect_partial(results);
                let mut reduced = aggregation::reduce_results(*operator, params, results)?;
                reduced.partial |= partial;
                if reduced.partial_reason.is_none() {
                    reduced.partial_reason = partial_reason;
                }
                Ok(reduced)
            }
            ExecNode::LabelValuesDistConcat { children }
            | ExecNode::LabelNamesDistConcat { children }
            | ExecNode::PartKeysDistConcat { children } => {
                let mut merged = concat_children(children, session).await?;
                merged.range_vectors = dedupe_by_key(merged.range_vectors);
                Ok(merged)
            }
            ExecNode::LabelCardinalityReduce { children } => {
                let results = dispatch_children(children, session).await?;
                if results.is_empty() {
                    return Ok(QueryResult::empty(session.query_ctx.query_id.clone()));
                }
                let (results, partial, reason) = collect_partial(results);
                let mut reduced = aggregation::reduce_results(
                    AggregationOperator::CountValues,
                    &[AggParam::Text("_value_".into())],
                    results,
                )?;
                reduced.partial |= partial;
                if reduced.partial_reason.is_none() {
                    reduced.partial_reason = reason;
                }
                Ok(reduced)
            }
            ExecNode::TopkCardReduce { children, .. } => {
                let results = dispatch_children(children, session).await?;
                if results.is_empty() {
                    return Ok(QueryResult::empty(session.query_ctx.query_id.clone()));
                }
                let (results, partial, reason) = collect_partial(results);
                let mut reduced =
                    aggregation::reduce_results(AggregationOperator::Sum, &[], results)?;
                reduced.partial |= partial;
                if reduced.partial_reason.is_none() {
                    reduced.partial_reason = reason;
                }
                Ok(reduced)
            }
            ExecNode::BinaryJoin {
                lhs,
                rhs,
                operator,
                cardinality,
                on,
                ignoring,
                include,
            } => {
                let sides = dispatch_children(std::slice::from_ref(lhs.as_ref()), session)
                    .await?
                    .pop()
                    .zip(
                        dispatch_children(std::slice::from_ref(rhs.as_ref()), session)
                            .await?
                            .pop(),
                    );
                let (left, right) =
                    sides.ok_or_else(|| QueryError::internal("join side produced no result"))?;
                binary_join::execute_binary_join(
                    *operator,
                    *cardinality,
                    on,
                    ignoring,
                    include,
                    left,
                    right,
                )
            }
            ExecNode::SetOperator {
                lhs,
                rhs,
                operator,
                on,
                ignoring,
            } => {
                let sides = dispatch_children(std::slice::from_ref(lhs.as_ref()), session)
                    .await?
                    .pop()
                    .zip(
                        dispatch_children(std::slice::from_ref(rhs.as_ref()), session)
                            .await?
                            .pop(),
                    );
                let (left, right) =
                    sides.ok_or_else(|| QueryError::internal("set side produced no result"))?;
                binary_join::execute_set_operator(*operator, on, ignoring, left, right)
            }
        }
    }

    /// Indented tree rendering for logs and plan-shape assertions.
    pub fn print_tree(&self) -> String {
        let mut out = String::new();
        self.print_into(&mut out, 0);
        out
    }

    fn print_into(&self, out: &mut String, depth: usize) {
        let prefix = "-".repeat(depth);
        for transformer in self.transformers.iter().rev() {
            let _ = writeln!(out, "{prefix}T~{}", transformer_name(transformer));
        }
        let _ = writeln!(
            out,
            "{prefix}E~{}{} on {}",
            self.node.name(),
            node_params(&self.node),
            self.dispatcher.cluster_name()
        );
        for child in self.node.children() {
            child.print_into(out, depth + 1);
        }
    }
}

impl fmt::Debug for ExecPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.print_tree().trim_end())
    }
}

fn transformer_name(transformer: &RangeVectorTransformer) -> String {
    match transformer {
        RangeVectorTransformer::PeriodicSamplesMapper {
            window_ms,
            function,
            offset_ms,
            ..
        } => format!(
            "PeriodicSamplesMapper(window={window_ms:?}, function={function:?}, offset={offset_ms})"
        ),
        RangeVectorTransformer::InstantVectorFunctionMapper { function, args } => {
            format!("InstantVectorFunctionMapper({function:?}, {args:?})")
        }
        RangeVectorTransformer::AggregateMapReduce { operator, .. } => {
            format!("AggregateMapReduce({operator:?})")
        }
        RangeVectorTransformer::AggregatePresenter { operator, .. } => {
            format!("AggregatePresenter({operator:?})")
        }
        RangeVectorTransformer::StitchRvsMapper => "StitchRvsMapper".to_string(),
        RangeVectorTransformer::AbsentFunctionMapper { .. } => "AbsentFunctionMapper".to_string(),
        RangeVectorTransformer::ScalarOperationMapper { operator, scalar, .. } => {
            format!("ScalarOperationMapper({operator:?}, {scalar})")
        }
        RangeVectorTransformer::LabelCardinalityPresenter => {
            "LabelCardinalityPresenter".to_string()
        }
        RangeVectorTransformer::TopkCardPresenter { k } => format!("TopkCardPresenter(k={k})"),
        RangeVectorTransformer::PartialResultMarker { reason } => {
            format!("PartialResultMarker({reason})")
        }
    }
}

fn node_params(node: &ExecNode) -> String {
    match node {
        ExecNode::MultiSchemaPartitionsScan { shard, chunk_method, .. } => {
            let range = chunk_method.time_range();
            format!("(shard={shard}, range=[{}, {}])", range.start_ms, range.end_ms)
        }
        ExecNode::LocalPartitionReduceAggregate { operator, .. }
        | ExecNode::MultiPartitionReduceAggregate { operator, .. } => {
            format!("({})", operator.promql_name())
        }
        ExecNode::PromQlRemote { endpoint, .. } => format!("(endpoint={endpoint})"),
        ExecNode::BinaryJoin { operator, .. } => format!("({})", operator.promql_name()),
        ExecNode::SetOperator { operator, .. } => format!("({})", operator.promql_name()),
        _ => String::new(),
    }
}

/// Dispatch children concurrently, bounded by the session's scheduler
/// permits, and fail fast on the first error.
pub(crate) async fn dispatch_children(
    children: &[ExecPlan],
    session: &QuerySession,
) -> Result<Vec<QueryResult>, QueryError> {
    let futures = children.iter().map(|child| async move {
        let _permit = session.acquire_dispatch_permit().await;
        child.dispatcher.dispatch(child, session).await
    });
    let responses = join_all(futures).await;

    let mut results = Vec::with_capacity(responses.len());
    let mut first_error = None;
    for response in responses {
        match response {
            QueryResponse::Result(result) => results.push(result),
            QueryResponse::Error(failure) => {
                debug!(error = %failure.error, "child plan failed, aborting siblings");
                if first_error.is_none() {
                    first_error = Some(failure.error);
                }
            }
        }
    }
    if let Some(err) = first_error {
        for result in results {
            result.close();
        }
        return Err(err);
    }
    Ok(results)
}

fn collect_partial(results: Vec<QueryResult>) -> (Vec<QueryResult>, bool, Option<String>) {
    let partial = results.iter().any(|r| r.partial);
    let reason = results.iter().find_map(|r| r.partial_reason.clone());
    (results, partial, reason)
}

async fn concat_children(
    children: &[ExecPlan],
    session: &QuerySession,
) -> Result<QueryResult, QueryError> {
    let results = dispatch_children(children, session).await?;
    let mut schema = crate::query::result::ResultSchema::default();
    let mut range_vectors = Vec::new();
    let mut partial = false;
    let mut partial_reason = None;
    for result in results {
        schema = reduce_schemas(&schema, &result.schema)?;
        partial |= result.partial;
        if partial_reason.is_none() {
            partial_reason = result.partial_reason.clone();
        }
        range_vectors.extend(result.range_vectors);
    }
    Ok(QueryResult {
        id: session.query_ctx.query_id.clone(),
        schema,
        range_vectors,
        stats: session.stats.snapshot(),
        partial,
        partial_reason,
    })
}

fn dedupe_by_key(
    vectors: Vec<crate::query::range_vector::RangeVector>,
) -> Vec<crate::query::range_vector::RangeVector> {
    let mut seen: BTreeSet<RangeVectorKey> = BTreeSet::new();
    vectors
        .into_iter()
        .filter_map(|rv| {
            if seen.insert(rv.key.clone()) {
                Some(rv)
            } else {
                rv.close();
                None
            }
        })
        .collect()
}
