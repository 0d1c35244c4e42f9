//! Instant functions: pointwise and histogram transforms on instant
//! vectors.
//!
//! Scalar functions map each row independently. The histogram family is
//! cross-series: bucket series of one histogram share all labels except
//! `le`, so the mapper groups by the remaining labels and works on the
//! bucket array per timestamp.

use crate::error::QueryError;
use crate::query::logical::InstantFunctionId;
use crate::query::range_vector::{RangeVector, RangeVectorKey, Row};
use crate::query::result::QueryResult;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use std::collections::BTreeMap;

/// Label separating histogram bucket series.
pub const LE_LABEL: &str = "le";

/// Apply an instant function to a whole result.
pub fn apply(
    function: InstantFunctionId,
    args: &[f64],
    result: QueryResult,
) -> Result<QueryResult, QueryError> {
    match function {
        InstantFunctionId::HistogramQuantile => histogram_quantile(args, result, false),
        InstantFunctionId::HistogramMaxQuantile => histogram_quantile(args, result, true),
        InstantFunctionId::HistogramBucket => histogram_bucket(args, result),
        _ => Ok(map_pointwise(function, args, result)),
    }
}

fn map_pointwise(function: InstantFunctionId, args: &[f64], result: QueryResult) -> QueryResult {
    let args = args.to_vec();
    let range_vectors = result
        .range_vectors
        .into_iter()
        .map(|rv| {
            let (key, output_range, rows) = rv.collect_rows();
            let mapped = rows
                .into_iter()
                .map(|row| {
                    let v = scalar_fn(function, row.value.as_double(), &args);
                    Row::double(row.timestamp_ms, v)
                })
                .collect();
            RangeVector::buffered(key, mapped, output_range)
        })
        .collect();
    QueryResult {
        range_vectors,
        ..result
    }
}

/// One scalar function application.
pub fn scalar_fn(function: InstantFunctionId, value: f64, args: &[f64]) -> f64 {
    match function {
        InstantFunctionId::Abs => value.abs(),
        InstantFunctionId::Ceil => value.ceil(),
        InstantFunctionId::Floor => value.floor(),
        InstantFunctionId::Exp => value.exp(),
        InstantFunctionId::Ln => value.ln(),
        InstantFunctionId::Log2 => value.log2(),
        InstantFunctionId::Log10 => value.log10(),
        InstantFunctionId::Sqrt => value.sqrt(),
        InstantFunctionId::Round => {
            let nearest = args.first().copied().unwrap_or(1.0);
            if nearest == 0.0 {
                f64::NAN
            } else {
                (value / nearest).round() * nearest
            }
        }
        InstantFunctionId::Sgn => {
            if value > 0.0 {
                1.0
            } else if value < 0.0 {
                -1.0
            } else {
                value
            }
        }
        InstantFunctionId::ClampMin => value.max(args.first().copied().unwrap_or(f64::NEG_INFINITY)),
        InstantFunctionId::ClampMax => value.min(args.first().copied().unwrap_or(f64::INFINITY)),
        InstantFunctionId::Hour => with_utc(value, |dt| dt.hour() as f64),
        InstantFunctionId::Minute => with_utc(value, |dt| dt.minute() as f64),
        InstantFunctionId::DayOfMonth => with_utc(value, |dt| dt.day() as f64),
        InstantFunctionId::DayOfWeek => {
            with_utc(value, |dt| dt.weekday().num_days_from_sunday() as f64)
        }
        InstantFunctionId::DayOfYear => with_utc(value, |dt| dt.ordinal() as f64),
        InstantFunctionId::Month => with_utc(value, |dt| dt.month() as f64),
        InstantFunctionId::Year => with_utc(value, |dt| dt.year() as f64),
        InstantFunctionId::DaysInMonth => with_utc(value, |dt| {
            let (year, month) = (dt.year(), dt.month());
            let first_next = if month == 12 {
                Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0)
            } else {
                Utc.with_ymd_and_hms(year, month + 1, 1, 0, 0, 0)
            };
            let first = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0);
            match (first.single(), first_next.single()) {
                (Some(a), Some(b)) => ((b - a).num_days()) as f64,
                _ => f64::NAN,
            }
        }),
        // Histogram functions are handled before this dispatch.
        InstantFunctionId::HistogramQuantile
        | InstantFunctionId::HistogramMaxQuantile
        | InstantFunctionId::HistogramBucket => f64::NAN,
    }
}

/// Time functions interpret the value as epoch seconds, UTC.
fn with_utc(value: f64, f: impl Fn(chrono::DateTime<Utc>) -> f64) -> f64 {
    if !value.is_finite() {
        return f64::NAN;
    }
    match Utc.timestamp_opt(value as i64, 0).single() {
        Some(dt) => f(dt),
        None => f64::NAN,
    }
}

/// Per-timestamp cumulative bucket array of one histogram.
struct BucketGroup {
    key: RangeVectorKey,
    /// le boundary -> rows by timestamp
    buckets: BTreeMap<i64, Vec<(f64, f64)>>,
}

fn histogram_groups(result: &mut Vec<RangeVector>) -> Vec<BucketGroup> {
    let mut groups: Vec<BucketGroup> = Vec::new();
    for rv in result.drain(..) {
        let le = rv
            .key
            .labels
            .get(LE_LABEL)
            .and_then(|s| parse_le(s));
        let le = match le {
            Some(le) => le,
            None => {
                rv.close();
                continue;
            }
        };
        let group_key = rv.key.without(&[LE_LABEL.to_string()]);
        let (_, _, rows) = rv.collect_rows();
        let idx = match groups.iter().position(|g| g.key == group_key) {
            Some(idx) => idx,
            None => {
                groups.push(BucketGroup {
                    key: group_key,
                    buckets: BTreeMap::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[idx];
        for row in rows {
            group
                .buckets
                .entry(row.timestamp_ms)
                .or_default()
                .push((le, row.value.as_double()));
        }
    }
    groups
}

fn parse_le(s: &str) -> Option<f64> {
    if s == "+Inf" {
        Some(f64::INFINITY)
    } else {
        s.parse().ok()
    }
}

/// `histogram_quantile(q, buckets)`. With `cap_to_top_bucket`, results in
/// the `+Inf` bucket are clamped to the highest finite boundary instead of
/// reporting that boundary as an open upper bound.
fn histogram_quantile(
    args: &[f64],
    result: QueryResult,
    cap_to_top_bucket: bool,
) -> Result<QueryResult, QueryError> {
    let q = *args
        .first()
        .ok_or_else(|| QueryError::bad_query("histogram_quantile needs a quantile argument"))?;
    let mut vectors = result.range_vectors;
    let groups = histogram_groups(&mut vectors);

    let range_vectors = groups
        .into_iter()
        .map(|group| {
            let mut rows = Vec::with_capacity(group.buckets.len());
            for (ts, mut buckets) in group.buckets {
                buckets.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                rows.push(Row::double(ts, bucket_quantile(q, &buckets, cap_to_top_bucket)));
            }
            RangeVector::buffered(group.key, rows, None)
        })
        .collect();

    Ok(QueryResult {
        range_vectors,
        ..result
    })
}

/// Quantile from cumulative buckets, linear interpolation within the
/// matched bucket. With `cap_to_top_bucket` the result never exceeds the
/// highest finite boundary.
fn bucket_quantile(q: f64, buckets: &[(f64, f64)], cap_to_top_bucket: bool) -> f64 {
    if !(0.0..=1.0).contains(&q) {
        return if q < 0.0 { f64::NEG_INFINITY } else { f64::INFINITY };
    }
    let Some(&(last_le, total)) = buckets.last() else {
        return f64::NAN;
    };
    if !last_le.is_infinite() || buckets.len() < 2 || total == 0.0 {
        return f64::NAN;
    }
    let top_finite = buckets[buckets.len() - 2].0;
    let rank = q * total;
    let mut lower_bound = 0.0;
    let mut lower_count = 0.0;
    let mut result = f64::NAN;
    for (i, &(le, count)) in buckets.iter().enumerate() {
        if count >= rank {
            if le.is_infinite() {
                // Above every finite boundary.
                result = top_finite;
            } else if i == 0 {
                result = le * (rank / count).clamp(0.0, 1.0);
            } else {
                let fraction = if count == lower_count {
                    0.0
                } else {
                    (rank - lower_count) / (count - lower_count)
                };
                result = lower_bound + (le - lower_bound) * fraction;
            }
            break;
        }
        lower_bound = le;
        lower_count = count;
    }
    if cap_to_top_bucket {
        result.min(top_finite)
    } else {
        result
    }
}

/// `histogram_bucket(le, buckets)`: selects the bucket series whose `le`
/// boundary equals the argument.
fn histogram_bucket(args: &[f64], result: QueryResult) -> Result<QueryResult, QueryError> {
    let wanted = *args
        .first()
        .ok_or_else(|| QueryError::bad_query("histogram_bucket needs a boundary argument"))?;
    let range_vectors = result
        .range_vectors
        .into_iter()
        .filter_map(|rv| {
            let le = rv.key.labels.get(LE_LABEL).and_then(|s| parse_le(s));
            match le {
                Some(le) if le == wanted => Some(rv),
                _ => {
                    rv.close();
                    None
                }
            }
        })
        .collect();
    Ok(QueryResult {
        range_vectors,
        ..result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::result::{QueryStatsSnapshot, ResultSchema};
    use crate::types::LabelSet;

    fn key(pairs: &[(&str, &str)]) -> RangeVectorKey {
        RangeVectorKey::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<LabelSet>(),
        )
    }

    fn result_with(rvs: Vec<RangeVector>) -> QueryResult {
        QueryResult {
            id: "q".into(),
            schema: ResultSchema::sample_schema(),
            range_vectors: rvs,
            stats: QueryStatsSnapshot::default(),
            partial: false,
            partial_reason: None,
        }
    }

    #[test]
    fn test_scalar_functions() {
        assert_eq!(scalar_fn(InstantFunctionId::Abs, -2.0, &[]), 2.0);
        assert_eq!(scalar_fn(InstantFunctionId::Ceil, 1.2, &[]), 2.0);
        assert_eq!(scalar_fn(InstantFunctionId::Sqrt, 9.0, &[]), 3.0);
        assert_eq!(scalar_fn(InstantFunctionId::Sgn, -7.0, &[]), -1.0);
        assert_eq!(scalar_fn(InstantFunctionId::ClampMin, 1.0, &[5.0]), 5.0);
        assert_eq!(scalar_fn(InstantFunctionId::ClampMax, 10.0, &[5.0]), 5.0);
        assert_eq!(scalar_fn(InstantFunctionId::Round, 1.25, &[0.5]), 1.5);
    }

    #[test]
    fn test_time_functions_on_known_instant() {
        // 2021-03-14 01:59:26 UTC
        let secs = 1_615_687_166.0;
        assert_eq!(scalar_fn(InstantFunctionId::Hour, secs, &[]), 1.0);
        assert_eq!(scalar_fn(InstantFunctionId::Minute, secs, &[]), 59.0);
        assert_eq!(scalar_fn(InstantFunctionId::DayOfMonth, secs, &[]), 14.0);
        assert_eq!(scalar_fn(InstantFunctionId::Month, secs, &[]), 3.0);
        assert_eq!(scalar_fn(InstantFunctionId::Year, secs, &[]), 2021.0);
        assert_eq!(scalar_fn(InstantFunctionId::DayOfWeek, secs, &[]), 0.0);
        assert_eq!(scalar_fn(InstantFunctionId::DaysInMonth, secs, &[]), 31.0);
    }

    fn bucket_rv(le: &str, counts: &[(i64, f64)]) -> RangeVector {
        RangeVector::buffered(
            key(&[("_metric_", "lat"), ("le", le), ("job", "api")]),
            counts.iter().map(|&(t, v)| Row::double(t, v)).collect(),
            None,
        )
    }

    #[test]
    fn test_histogram_quantile_interpolates() {
        let result = result_with(vec![
            bucket_rv("0.25", &[(0, 0.0)]),
            bucket_rv("0.5", &[(0, 10.0)]),
            bucket_rv("1.0", &[(0, 10.0)]),
            bucket_rv("+Inf", &[(0, 10.0)]),
        ]);
        let out = apply(InstantFunctionId::HistogramQuantile, &[0.5], result).unwrap();
        assert_eq!(out.range_vectors.len(), 1);
        // The le label is folded away.
        assert!(!out.range_vectors[0].key.labels.contains_key("le"));
        let (_, _, rows) = out.range_vectors.into_iter().next().unwrap().collect_rows();
        // Median sits halfway into the (0.25, 0.5] bucket.
        assert!((rows[0].value.as_double() - 0.375).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_quantile_requires_inf_bucket() {
        let result = result_with(vec![
            bucket_rv("0.5", &[(0, 5.0)]),
            bucket_rv("1.0", &[(0, 10.0)]),
        ]);
        let out = apply(InstantFunctionId::HistogramQuantile, &[0.5], result).unwrap();
        let (_, _, rows) = out.range_vectors.into_iter().next().unwrap().collect_rows();
        assert!(rows[0].value.as_double().is_nan());
    }

    #[test]
    fn test_histogram_bucket_selects_boundary() {
        let result = result_with(vec![
            bucket_rv("0.5", &[(0, 5.0)]),
            bucket_rv("1.0", &[(0, 10.0)]),
        ]);
        let out = apply(InstantFunctionId::HistogramBucket, &[0.5], result).unwrap();
        assert_eq!(out.range_vectors.len(), 1);
        assert_eq!(
            out.range_vectors[0].key.labels.get("le").map(String::as_str),
            Some("0.5")
        );
    }
}
