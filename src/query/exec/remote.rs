//! Remote partition execution.
//!
//! `PromQlRemoteExec` ships the PromQL rendering of a plan fragment to
//! another partition and translates the response back into range vectors.
//! The HTTP transport itself is injected: the gateway wires in a real
//! client, tests wire in a canned one. The wire format is the JSON shape
//! of [`RemoteQueryRequest`] and [`RemoteQueryResponse`].

use crate::error::QueryError;
use crate::query::range_vector::SerializableRangeVector;
use crate::query::result::{QueryResult, ResultSchema};
use crate::query::session::QuerySession;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use tracing::debug;

/// Request shipped to a remote partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteQueryRequest {
    /// PromQL fragment.
    pub query: String,
    /// Query range start, epoch seconds.
    pub start_secs: i64,
    /// Grid step, seconds.
    pub step_secs: i64,
    /// Query range end, epoch seconds.
    pub end_secs: i64,
    /// Extra URL parameters forwarded verbatim.
    pub url_params: HashMap<String, String>,
}

/// Response from a remote partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteQueryResponse {
    /// Result series.
    pub series: Vec<SerializableRangeVector>,
    /// Whether the remote marked its result partial.
    pub partial: bool,
    /// Partial reason, when any.
    pub message: Option<String>,
}

/// Injected HTTP transport for remote partition queries.
#[async_trait]
pub trait RemoteExecClient: Send + Sync {
    /// Issue the query against `endpoint`, bounded by `timeout_ms`.
    async fn exec_promql(
        &self,
        endpoint: &str,
        request: &RemoteQueryRequest,
        timeout_ms: u64,
    ) -> Result<RemoteQueryResponse, QueryError>;
}

/// Execute one remote fragment and translate the response.
pub async fn execute_remote(
    client: &dyn RemoteExecClient,
    endpoint: &str,
    request: &RemoteQueryRequest,
    timeout_ms: u64,
    session: &QuerySession,
) -> Result<QueryResult, QueryError> {
    debug!(endpoint, query = %request.query, "dispatching remote fragment");
    let response = client.exec_promql(endpoint, request, timeout_ms).await?;

    let bytes: u64 = response
        .series
        .iter()
        .map(|s| s.rows.len() as u64 * 16)
        .sum();
    session.stats.remote_bytes.fetch_add(bytes, Ordering::Relaxed);

    let range_vectors = response
        .series
        .into_iter()
        .map(SerializableRangeVector::into_range_vector)
        .collect();
    Ok(QueryResult {
        id: session.query_ctx.query_id.clone(),
        schema: ResultSchema::sample_schema(),
        range_vectors,
        stats: session.stats.snapshot(),
        partial: response.partial,
        partial_reason: response.message,
    })
}
