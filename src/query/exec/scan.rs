//! Leaf execution against the in-memory store: the shard-local data scan
//! and the metadata leaves mirroring the store's lookup operations.

use crate::error::QueryError;
use crate::memstore::TimeSeriesMemStore;
use crate::query::filter::ColumnFilter;
use crate::query::range_vector::{RangeVector, RangeVectorKey, Row, RowValue};
use crate::query::result::{QueryResult, ResultSchema};
use crate::query::session::QuerySession;
use crate::types::{ChunkScanMethod, ColumnInfo, ColumnType, DatasetRef, ShardId};
use tracing::trace;

/// `MultiSchemaPartitionsExec`: scan matching partitions of one shard and
/// emit one range vector per partition, rows gated to the scan window.
///
/// The sample limit applies here, at materialization.
pub fn partitions_scan(
    store: &TimeSeriesMemStore,
    dataset: &DatasetRef,
    shard: ShardId,
    filters: &[ColumnFilter],
    chunk_method: ChunkScanMethod,
    session: &QuerySession,
) -> Result<QueryResult, QueryError> {
    let clipped = store.clip_to_retention(chunk_method);
    let parts = store.scan_partitions(dataset, shard, filters, clipped)?;
    let range = clipped.time_range();
    let limit = session.sample_limit();

    let mut total_samples = 0usize;
    let mut range_vectors = Vec::with_capacity(parts.len());
    for part in parts {
        let rows = part.read_rows(&range);
        if rows.is_empty() {
            continue;
        }
        total_samples += rows.len();
        if total_samples > limit {
            return Err(QueryError::SampleLimitExceeded { limit });
        }
        session.stats.add_samples(rows.len() as u64);
        range_vectors.push(RangeVector {
            key: RangeVectorKey::new(part.labels().clone()),
            output_range: None,
            cursor: Box::new(crate::query::range_vector::BufferedCursor::from_samples(rows)),
        });
    }
    session.stats.add_series(range_vectors.len() as u64);
    trace!(
        shard,
        series = range_vectors.len(),
        samples = total_samples,
        "partition scan materialized"
    );

    Ok(QueryResult {
        id: session.query_ctx.query_id.clone(),
        schema: ResultSchema::sample_schema(),
        range_vectors,
        stats: session.stats.snapshot(),
        partial: false,
        partial_reason: None,
    })
}

fn metadata_result(session: &QuerySession, range_vectors: Vec<RangeVector>) -> QueryResult {
    QueryResult {
        id: session.query_ctx.query_id.clone(),
        schema: ResultSchema::string_schema(),
        range_vectors,
        stats: session.stats.snapshot(),
        partial: false,
        partial_reason: None,
    }
}

/// `LabelValuesExec`: one keyed, row-less vector per distinct combination
/// of the requested labels.
pub fn label_values_scan(
    store: &TimeSeriesMemStore,
    dataset: &DatasetRef,
    shard: ShardId,
    filters: &[ColumnFilter],
    label_names: &[String],
    start_ms: i64,
    end_ms: i64,
    session: &QuerySession,
) -> Result<QueryResult, QueryError> {
    let rows = store.label_values(dataset, shard, filters, label_names, start_ms, end_ms)?;
    let range_vectors = rows
        .into_iter()
        .map(|labels| RangeVector::empty(RangeVectorKey::new(labels)))
        .collect();
    Ok(metadata_result(session, range_vectors))
}

/// `LabelNamesExec`: one vector per label name.
pub fn label_names_scan(
    store: &TimeSeriesMemStore,
    dataset: &DatasetRef,
    shard: ShardId,
    filters: &[ColumnFilter],
    start_ms: i64,
    end_ms: i64,
    session: &QuerySession,
) -> Result<QueryResult, QueryError> {
    let names = store.label_names(dataset, shard, filters, start_ms, end_ms)?;
    let range_vectors = names
        .into_iter()
        .map(|name| {
            let labels = [("_label_".to_string(), name)].into_iter().collect();
            RangeVector::empty(RangeVectorKey::new(labels))
        })
        .collect();
    Ok(metadata_result(session, range_vectors))
}

/// `PartKeysExec`: one vector per matching series, keyed by its full
/// label set.
pub fn part_keys_scan(
    store: &TimeSeriesMemStore,
    dataset: &DatasetRef,
    shard: ShardId,
    filters: &[ColumnFilter],
    start_ms: i64,
    end_ms: i64,
    session: &QuerySession,
) -> Result<QueryResult, QueryError> {
    let keys = store.part_keys(dataset, shard, filters, start_ms, end_ms)?;
    let range_vectors = keys
        .into_iter()
        .map(|labels| RangeVector::empty(RangeVectorKey::new(labels)))
        .collect();
    Ok(metadata_result(session, range_vectors))
}

/// `LabelCardinalityExec`: per label, the distinct values seen on this
/// shard, carried as a mergeable partial so the cross-shard reduce counts
/// each value once.
pub fn label_cardinality_scan(
    store: &TimeSeriesMemStore,
    dataset: &DatasetRef,
    shard: ShardId,
    filters: &[ColumnFilter],
    start_ms: i64,
    end_ms: i64,
    session: &QuerySession,
) -> Result<QueryResult, QueryError> {
    let keys = store.part_keys(dataset, shard, filters, start_ms, end_ms)?;
    let mut per_label: std::collections::BTreeMap<String, std::collections::BTreeSet<String>> =
        std::collections::BTreeMap::new();
    for labels in keys {
        for (name, value) in labels {
            per_label.entry(name).or_default().insert(value);
        }
    }
    let range_vectors = per_label
        .into_iter()
        .map(|(name, values)| {
            let key_labels = [("_label_".to_string(), name)].into_iter().collect();
            let partial = RowValue::CountValuesPartial(
                values.into_iter().map(|v| (v, 1.0)).collect(),
            );
            RangeVector::buffered(
                RangeVectorKey::new(key_labels),
                vec![Row {
                    timestamp_ms: 0,
                    value: partial,
                }],
                None,
            )
        })
        .collect();
    let mut result = metadata_result(session, range_vectors);
    result.schema = ResultSchema {
        columns: vec![
            ColumnInfo::new("label", ColumnType::String),
            ColumnInfo::new("count", ColumnType::Double),
        ],
        fixed_vector_len: None,
    };
    Ok(result)
}

/// `TopkCardExec`: per metric under the shard-key prefix, this shard's
/// series count.
#[allow(clippy::too_many_arguments)]
pub fn topk_cardinality_scan(
    store: &TimeSeriesMemStore,
    dataset: &DatasetRef,
    shard: ShardId,
    shard_key_prefix: &[String],
    k: usize,
    include_inactive: bool,
    session: &QuerySession,
) -> Result<QueryResult, QueryError> {
    let ranked = store.topk_cardinality(dataset, shard, shard_key_prefix, k, include_inactive)?;
    let range_vectors = ranked
        .into_iter()
        .map(|(metric, count)| {
            let labels = [(crate::types::METRIC_COLUMN.to_string(), metric)]
                .into_iter()
                .collect();
            RangeVector::buffered(
                RangeVectorKey::new(labels),
                vec![Row::double(0, count as f64)],
                None,
            )
        })
        .collect();
    let mut result = metadata_result(session, range_vectors);
    result.schema = ResultSchema {
        columns: vec![
            ColumnInfo::new("metric", ColumnType::String),
            ColumnInfo::new("count", ColumnType::Double),
        ],
        fixed_vector_len: None,
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueryConfig, StoreConfig};
    use crate::query::session::{PlannerParams, QueryContext};
    use crate::types::{LabelSet, SampleRecord, Schema, TimeRange};
    use std::sync::Arc;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn store_with_data() -> (TimeSeriesMemStore, DatasetRef) {
        let store = TimeSeriesMemStore::new();
        let dataset = DatasetRef::new("prometheus");
        store
            .setup(&dataset, &[Schema::gauge()], 0, StoreConfig::default())
            .unwrap();
        let mut batch = Vec::new();
        for host in ["a", "b"] {
            for i in 0..100 {
                batch.push(SampleRecord {
                    labels: labels(&[("__name__", "cpu"), ("host", host)]),
                    timestamp_ms: i * 10,
                    value: i as f64,
                    schema: "gauge".into(),
                });
            }
        }
        store.ingest(&dataset, 0, batch, 0).unwrap();
        (store, dataset)
    }

    fn session_with_limit(limit: usize) -> QuerySession {
        let ctx = QueryContext::new("q").with_planner_params(PlannerParams {
            sample_limit: limit,
            ..PlannerParams::default()
        });
        QuerySession::new(ctx, Arc::new(QueryConfig::default()))
    }

    #[test]
    fn test_scan_emits_one_vector_per_partition() {
        let (store, dataset) = store_with_data();
        let session = session_with_limit(1_000_000);
        let result = partitions_scan(
            &store,
            &dataset,
            0,
            &[ColumnFilter::equals("_metric_", "cpu")],
            ChunkScanMethod::TimeRange(TimeRange::new(0, 1000)),
            &session,
        )
        .unwrap();
        assert_eq!(result.range_vectors.len(), 2);
        assert_eq!(session.stats.snapshot().samples_scanned, 200);
    }

    #[test]
    fn test_sample_limit_enforced() {
        let (store, dataset) = store_with_data();
        let session = session_with_limit(150);
        let err = partitions_scan(
            &store,
            &dataset,
            0,
            &[ColumnFilter::equals("_metric_", "cpu")],
            ChunkScanMethod::TimeRange(TimeRange::new(0, 1000)),
            &session,
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::SampleLimitExceeded { limit: 150 }));
    }

    #[test]
    fn test_rows_gated_to_time_range() {
        let (store, dataset) = store_with_data();
        let session = session_with_limit(1_000_000);
        let result = partitions_scan(
            &store,
            &dataset,
            0,
            &[ColumnFilter::equals("host", "a")],
            ChunkScanMethod::TimeRange(TimeRange::new(100, 200)),
            &session,
        )
        .unwrap();
        let (_, _, rows) = result
            .range_vectors
            .into_iter()
            .next()
            .unwrap()
            .collect_rows();
        assert!(rows.iter().all(|r| (100..=200).contains(&r.timestamp_ms)));
        assert_eq!(rows.len(), 11);
    }

    #[test]
    fn test_label_values_leaf() {
        let (store, dataset) = store_with_data();
        let session = session_with_limit(1_000_000);
        let result = label_values_scan(
            &store,
            &dataset,
            0,
            &[ColumnFilter::equals("_metric_", "cpu")],
            &["host".to_string()],
            0,
            1000,
            &session,
        )
        .unwrap();
        assert_eq!(result.range_vectors.len(), 2);
    }

    #[test]
    fn test_topk_card_leaf() {
        let (store, dataset) = store_with_data();
        let session = session_with_limit(1_000_000);
        let result =
            topk_cardinality_scan(&store, &dataset, 0, &[], 5, true, &session).unwrap();
        assert_eq!(result.range_vectors.len(), 1);
        let (key, _, rows) = result
            .range_vectors
            .into_iter()
            .next()
            .unwrap()
            .collect_rows();
        assert_eq!(key.labels.get("_metric_").map(String::as_str), Some("cpu"));
        assert_eq!(rows[0].value.as_double(), 2.0);
    }
}
