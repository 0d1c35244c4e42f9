//! Error types for the store and the query pipeline.

use crate::types::{ShardId, ShardStatus};
use thiserror::Error;

/// Errors raised by the in-memory store during setup and ingest.
#[derive(Error, Debug)]
pub enum StoreError {
    /// `setup` was called twice for the same dataset/shard pair.
    #[error("shard {shard} of dataset {dataset} is already set up")]
    ShardAlreadySetup {
        /// Dataset name.
        dataset: String,
        /// Conflicting shard.
        shard: ShardId,
    },

    /// An operation targeted a shard that was never set up.
    #[error("shard {shard} of dataset {dataset} is not set up")]
    ShardNotSetup {
        /// Dataset name.
        dataset: String,
        /// Missing shard.
        shard: ShardId,
    },

    /// A sample referenced a schema the shard was not set up with.
    #[error("unknown schema '{0}'")]
    UnknownSchema(String),
}

/// Errors surfaced by planning or execution, mirroring the wire-level
/// error kinds a coordinator reports back to clients.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// Wall-clock deadline exceeded.
    #[error("query timed out after {elapsed_ms}ms (limit {timeout_ms}ms)")]
    QueryTimeout {
        /// Time spent before the deadline fired.
        elapsed_ms: u64,
        /// Configured limit.
        timeout_ms: u64,
    },

    /// A leaf would materialize more samples than allowed.
    #[error("query scanned more than {limit} samples")]
    SampleLimitExceeded {
        /// Configured sample cap.
        limit: usize,
    },

    /// The shard set for one leaf fan-out exceeds the configured bound.
    #[error("query would touch {actual} shards, more than the allowed {limit}")]
    TooManyShardsQueried {
        /// Shards the plan needs.
        actual: usize,
        /// Configured bound.
        limit: usize,
    },

    /// Stitched or concatenated streams disagree on column types.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    /// Parse failure, unsupported construct or missing required filter.
    #[error("bad query: {0}")]
    BadQuery(String),

    /// A required shard is unassigned, recovering or failed.
    #[error("shard {shard} is not available (status {status:?})")]
    ShardNotAvailable {
        /// The missing shard.
        shard: ShardId,
        /// Its reported status.
        status: ShardStatus,
    },

    /// A downstream partition returned an error.
    #[error("remote partition error: {0}")]
    Remote(String),

    /// Invariant violation inside the pipeline.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// Shorthand for [`QueryError::BadQuery`].
    pub fn bad_query(msg: impl Into<String>) -> Self {
        QueryError::BadQuery(msg.into())
    }

    /// Shorthand for [`QueryError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        QueryError::Internal(msg.into())
    }
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        QueryError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = QueryError::SampleLimitExceeded { limit: 1000 };
        assert!(err.to_string().contains("1000"));

        let err = QueryError::ShardNotAvailable {
            shard: 3,
            status: ShardStatus::Recovery,
        };
        assert!(err.to_string().contains("3"));
        assert!(err.to_string().contains("Recovery"));
    }

    #[test]
    fn test_store_error_converts_to_internal() {
        let store = StoreError::UnknownSchema("weird".into());
        let q: QueryError = store.into();
        assert!(matches!(q, QueryError::Internal(_)));
    }
}
