//! Query results, response envelopes and execution statistics.

use crate::error::QueryError;
use crate::query::range_vector::RangeVector;
use crate::types::{ColumnInfo, ColumnType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Column layout of a query result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultSchema {
    /// Result columns, timestamp first.
    pub columns: Vec<ColumnInfo>,
    /// Declared row count per vector when fixed (instant queries).
    pub fixed_vector_len: Option<usize>,
}

impl ResultSchema {
    /// The common `(timestamp, value)` sample schema.
    pub fn sample_schema() -> Self {
        Self {
            columns: vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new("value", ColumnType::Double),
            ],
            fixed_vector_len: None,
        }
    }

    /// Schema for metadata string results.
    pub fn string_schema() -> Self {
        Self {
            columns: vec![ColumnInfo::new("value", ColumnType::String)],
            fixed_vector_len: None,
        }
    }

    /// Whether no result has populated the schema yet.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Merge two result schemas, ignoring fixed vector lengths and column
/// names. Column types must agree.
pub fn reduce_schemas(a: &ResultSchema, b: &ResultSchema) -> Result<ResultSchema, QueryError> {
    if a.is_empty() {
        return Ok(b.clone());
    }
    if b.is_empty() {
        return Ok(a.clone());
    }
    if a.columns.len() != b.columns.len() {
        return Err(QueryError::SchemaConflict(format!(
            "column counts differ: {} vs {}",
            a.columns.len(),
            b.columns.len()
        )));
    }
    for (ca, cb) in a.columns.iter().zip(&b.columns) {
        if ca.col_type != cb.col_type {
            return Err(QueryError::SchemaConflict(format!(
                "column type mismatch: {:?} vs {:?}",
                ca.col_type, cb.col_type
            )));
        }
    }
    Ok(ResultSchema {
        columns: a.columns.clone(),
        fixed_vector_len: None,
    })
}

/// Atomic counter bundle threaded through one query's execution.
///
/// Shared by reference across every operator of the plan; leaves add what
/// they scanned, reducers add what they merged.
#[derive(Debug, Default)]
pub struct QueryStats {
    /// Samples materialized by leaf scans.
    pub samples_scanned: AtomicU64,
    /// Series (range vectors) produced by leaf scans.
    pub series_scanned: AtomicU64,
    /// Result bytes shipped from remote partitions.
    pub remote_bytes: AtomicU64,
}

impl QueryStats {
    /// Fresh zeroed stats.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add scanned samples.
    pub fn add_samples(&self, n: u64) {
        self.samples_scanned.fetch_add(n, Ordering::Relaxed);
    }

    /// Add scanned series.
    pub fn add_series(&self, n: u64) {
        self.series_scanned.fetch_add(n, Ordering::Relaxed);
    }

    /// Plain snapshot for responses.
    pub fn snapshot(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            samples_scanned: self.samples_scanned.load(Ordering::Relaxed),
            series_scanned: self.series_scanned.load(Ordering::Relaxed),
            remote_bytes: self.remote_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`QueryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStatsSnapshot {
    /// Samples materialized by leaf scans.
    pub samples_scanned: u64,
    /// Series produced by leaf scans.
    pub series_scanned: u64,
    /// Result bytes shipped from remote partitions.
    pub remote_bytes: u64,
}

/// A successful query result: schema plus a set of range vectors.
pub struct QueryResult {
    /// Query id this result answers.
    pub id: String,
    /// Column layout of the vectors.
    pub schema: ResultSchema,
    /// The result streams.
    pub range_vectors: Vec<RangeVector>,
    /// Execution statistics.
    pub stats: QueryStatsSnapshot,
    /// Whether some shards or partitions were skipped.
    pub partial: bool,
    /// Names what is missing when `partial` is set.
    pub partial_reason: Option<String>,
}

impl QueryResult {
    /// Empty result for a query id.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            schema: ResultSchema::default(),
            range_vectors: Vec::new(),
            stats: QueryStatsSnapshot::default(),
            partial: false,
            partial_reason: None,
        }
    }

    /// Close every stream without draining.
    pub fn close(self) {
        for rv in self.range_vectors {
            rv.close();
        }
    }
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("id", &self.id)
            .field("num_range_vectors", &self.range_vectors.len())
            .field("partial", &self.partial)
            .finish_non_exhaustive()
    }
}

/// A failed query.
#[derive(Debug)]
pub struct QueryFailure {
    /// Query id.
    pub id: String,
    /// Statistics accumulated before the failure.
    pub stats: QueryStatsSnapshot,
    /// The error.
    pub error: QueryError,
}

/// What an operator dispatch returns: a streaming result or an error.
#[derive(Debug)]
pub enum QueryResponse {
    /// Streams ready to pull.
    Result(QueryResult),
    /// Execution failed.
    Error(QueryFailure),
}

impl QueryResponse {
    /// Build an error response.
    pub fn error(id: impl Into<String>, stats: QueryStatsSnapshot, error: QueryError) -> Self {
        QueryResponse::Error(QueryFailure {
            id: id.into(),
            stats,
            error,
        })
    }

    /// Unwrap into a result, propagating failures.
    pub fn into_result(self) -> Result<QueryResult, QueryFailure> {
        match self {
            QueryResponse::Result(r) => Ok(r),
            QueryResponse::Error(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_schemas_ignores_names_and_lengths() {
        let a = ResultSchema {
            columns: vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new("value", ColumnType::Double),
            ],
            fixed_vector_len: Some(1),
        };
        let b = ResultSchema {
            columns: vec![
                ColumnInfo::new("ts", ColumnType::Timestamp),
                ColumnInfo::new("val", ColumnType::Double),
            ],
            fixed_vector_len: Some(11),
        };
        let merged = reduce_schemas(&a, &b).unwrap();
        assert_eq!(merged.columns, a.columns);
        assert_eq!(merged.fixed_vector_len, None);
    }

    #[test]
    fn test_reduce_schemas_type_conflict() {
        let a = ResultSchema::sample_schema();
        let b = ResultSchema {
            columns: vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new("value", ColumnType::String),
            ],
            fixed_vector_len: None,
        };
        assert!(matches!(
            reduce_schemas(&a, &b),
            Err(QueryError::SchemaConflict(_))
        ));
    }

    #[test]
    fn test_reduce_with_empty_side() {
        let a = ResultSchema::default();
        let b = ResultSchema::sample_schema();
        assert_eq!(reduce_schemas(&a, &b).unwrap(), b);
    }

    #[test]
    fn test_stats_accumulate() {
        let stats = QueryStats::new();
        stats.add_samples(100);
        stats.add_samples(50);
        stats.add_series(2);
        let snap = stats.snapshot();
        assert_eq!(snap.samples_scanned, 150);
        assert_eq!(snap.series_scanned, 2);
    }
}
