//! Range functions: windowed computations over raw samples.
//!
//! Each function sees the samples inside one window `(window_start,
//! window_end]` and produces at most one value for the grid point at the
//! window end. Counter semantics (`rate`, `increase`, `resets`) correct
//! for counter resets; the rate family extrapolates to the window bounds
//! the way Prometheus does, so short scrape gaps at the edges do not bias
//! the slope.

use crate::query::logical::RangeFunctionId;

/// Evaluate `function` over `samples` gathered from `(window_start_ms,
/// window_end_ms]`. Returns `None` when the window cannot produce a value
/// (too few samples, or empty for everything except `absent_over_time`).
pub fn evaluate(
    function: RangeFunctionId,
    samples: &[(i64, f64)],
    window_start_ms: i64,
    window_end_ms: i64,
    args: &[f64],
) -> Option<f64> {
    if samples.is_empty() {
        return match function {
            RangeFunctionId::AbsentOverTime => Some(1.0),
            _ => None,
        };
    }
    match function {
        RangeFunctionId::Rate => {
            extrapolated_delta(samples, window_start_ms, window_end_ms, true).map(|delta| {
                delta / ((window_end_ms - window_start_ms) as f64 / 1000.0)
            })
        }
        RangeFunctionId::Increase => {
            extrapolated_delta(samples, window_start_ms, window_end_ms, true)
        }
        RangeFunctionId::Delta => {
            extrapolated_delta(samples, window_start_ms, window_end_ms, false)
        }
        RangeFunctionId::AvgOverTime => {
            Some(samples.iter().map(|(_, v)| v).sum::<f64>() / samples.len() as f64)
        }
        RangeFunctionId::MinOverTime => samples
            .iter()
            .map(|(_, v)| *v)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v)))),
        RangeFunctionId::MaxOverTime => samples
            .iter()
            .map(|(_, v)| *v)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v)))),
        RangeFunctionId::SumOverTime => Some(samples.iter().map(|(_, v)| v).sum()),
        RangeFunctionId::CountOverTime => Some(samples.len() as f64),
        RangeFunctionId::StddevOverTime => {
            let mean = samples.iter().map(|(_, v)| v).sum::<f64>() / samples.len() as f64;
            let var = samples
                .iter()
                .map(|(_, v)| (v - mean) * (v - mean))
                .sum::<f64>()
                / samples.len() as f64;
            Some(var.sqrt())
        }
        RangeFunctionId::LastOverTime => samples.last().map(|(_, v)| *v),
        RangeFunctionId::QuantileOverTime => {
            let q = *args.first()?;
            let mut values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            Some(quantile_sorted(&values, q))
        }
        RangeFunctionId::HoltWinters => holt_winters(samples, args),
        RangeFunctionId::PredictLinear => {
            let horizon_secs = *args.first()?;
            let (slope, intercept) = linear_regression(samples, window_end_ms)?;
            Some(intercept + slope * horizon_secs)
        }
        RangeFunctionId::Deriv => linear_regression(samples, window_end_ms).map(|(slope, _)| slope),
        RangeFunctionId::Changes => {
            let mut changes = 0usize;
            for pair in samples.windows(2) {
                let (prev, cur) = (pair[0].1, pair[1].1);
                if prev != cur && !(prev.is_nan() && cur.is_nan()) {
                    changes += 1;
                }
            }
            Some(changes as f64)
        }
        RangeFunctionId::Resets => {
            let resets = samples
                .windows(2)
                .filter(|pair| pair[1].1 < pair[0].1)
                .count();
            Some(resets as f64)
        }
        RangeFunctionId::AbsentOverTime => None,
    }
}

/// Raw delta across the window, reset-corrected for counters and
/// extrapolated to the window bounds. Needs at least two samples.
fn extrapolated_delta(
    samples: &[(i64, f64)],
    window_start_ms: i64,
    window_end_ms: i64,
    is_counter: bool,
) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let (first_ts, first_v) = samples[0];
    let (last_ts, _) = samples[samples.len() - 1];

    let mut delta = samples[samples.len() - 1].1 - first_v;
    if is_counter {
        let mut prev = first_v;
        for &(_, v) in &samples[1..] {
            if v < prev {
                delta += prev;
            }
            prev = v;
        }
    }

    let sampled_interval = (last_ts - first_ts) as f64;
    if sampled_interval <= 0.0 {
        return None;
    }
    let avg_between = sampled_interval / (samples.len() - 1) as f64;
    let extrapolation_threshold = avg_between * 1.1;

    let mut duration_to_start = (first_ts - window_start_ms) as f64;
    let duration_to_end = (window_end_ms - last_ts) as f64;

    // A counter cannot extrapolate below its zero point.
    if is_counter && delta > 0.0 && first_v >= 0.0 {
        let zero_point = sampled_interval * (first_v / delta);
        duration_to_start = duration_to_start.min(zero_point);
    }

    let start_extension = if duration_to_start < extrapolation_threshold {
        duration_to_start
    } else {
        avg_between / 2.0
    };
    let end_extension = if duration_to_end < extrapolation_threshold {
        duration_to_end
    } else {
        avg_between / 2.0
    };

    let factor = (sampled_interval + start_extension + end_extension) / sampled_interval;
    Some(delta * factor)
}

/// Least-squares regression of value on time. Slope is per second;
/// intercept is the value at `reference_ms`.
fn linear_regression(samples: &[(i64, f64)], reference_ms: i64) -> Option<(f64, f64)> {
    if samples.len() < 2 {
        return None;
    }
    let n = samples.len() as f64;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_x2 = 0.0;
    for &(ts, v) in samples {
        let x = (ts - reference_ms) as f64 / 1000.0;
        sum_x += x;
        sum_y += v;
        sum_xy += x * v;
        sum_x2 += x * x;
    }
    let denom = n * sum_x2 - sum_x * sum_x;
    if denom == 0.0 {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

/// Double exponential smoothing with smoothing factor `sf` and trend
/// factor `tf`. Needs at least two samples and factors in `(0, 1)`.
fn holt_winters(samples: &[(i64, f64)], args: &[f64]) -> Option<f64> {
    let sf = *args.first()?;
    let tf = *args.get(1)?;
    if !(0.0..=1.0).contains(&sf) || !(0.0..=1.0).contains(&tf) || samples.len() < 2 {
        return None;
    }
    let mut level = samples[0].1;
    let mut trend = samples[1].1 - samples[0].1;
    for &(_, v) in &samples[1..] {
        let prev_level = level;
        level = sf * v + (1.0 - sf) * (level + trend);
        trend = tf * (level - prev_level) + (1.0 - tf) * trend;
    }
    Some(level)
}

/// Quantile over an ascending slice, Prometheus interpolation.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() || q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Samples every 10s filling the whole window, value climbing by 10.
    fn steady_counter() -> Vec<(i64, f64)> {
        (0..=6).map(|i| (i * 10_000, (i * 10) as f64)).collect()
    }

    #[test]
    fn test_rate_steady_counter() {
        let samples = steady_counter();
        let rate = evaluate(RangeFunctionId::Rate, &samples, 0, 60_000, &[]).unwrap();
        // 1 unit per second, exact because samples touch both bounds.
        assert!((rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_increase_with_counter_reset() {
        // Counter climbs to 30, resets, climbs to 20: true increase 50.
        let samples = vec![(0, 0.0), (10_000, 30.0), (20_000, 5.0), (30_000, 20.0)];
        let increase =
            evaluate(RangeFunctionId::Increase, &samples, 0, 30_000, &[]).unwrap();
        assert!((increase - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_delta_ignores_resets() {
        let samples = vec![(0, 30.0), (30_000, 10.0)];
        let delta = evaluate(RangeFunctionId::Delta, &samples, 0, 30_000, &[]).unwrap();
        assert!((delta - (-20.0)).abs() < 1e-9);
    }

    #[test]
    fn test_rate_needs_two_samples() {
        assert_eq!(
            evaluate(RangeFunctionId::Rate, &[(5_000, 1.0)], 0, 60_000, &[]),
            None
        );
    }

    #[test]
    fn test_over_time_family() {
        let samples = vec![(0, 2.0), (10, 4.0), (20, 9.0)];
        assert_eq!(
            evaluate(RangeFunctionId::SumOverTime, &samples, 0, 20, &[]),
            Some(15.0)
        );
        assert_eq!(
            evaluate(RangeFunctionId::AvgOverTime, &samples, 0, 20, &[]),
            Some(5.0)
        );
        assert_eq!(
            evaluate(RangeFunctionId::MinOverTime, &samples, 0, 20, &[]),
            Some(2.0)
        );
        assert_eq!(
            evaluate(RangeFunctionId::MaxOverTime, &samples, 0, 20, &[]),
            Some(9.0)
        );
        assert_eq!(
            evaluate(RangeFunctionId::CountOverTime, &samples, 0, 20, &[]),
            Some(3.0)
        );
        assert_eq!(
            evaluate(RangeFunctionId::LastOverTime, &samples, 0, 20, &[]),
            Some(9.0)
        );
    }

    #[test]
    fn test_changes_and_resets() {
        let samples = vec![(0, 1.0), (1, 1.0), (2, 3.0), (3, 2.0), (4, 2.0)];
        assert_eq!(
            evaluate(RangeFunctionId::Changes, &samples, 0, 4, &[]),
            Some(2.0)
        );
        assert_eq!(
            evaluate(RangeFunctionId::Resets, &samples, 0, 4, &[]),
            Some(1.0)
        );
    }

    #[test]
    fn test_deriv_and_predict_linear() {
        // value = 2 * seconds
        let samples: Vec<(i64, f64)> = (0..10).map(|i| (i * 1000, (i * 2) as f64)).collect();
        let slope = evaluate(RangeFunctionId::Deriv, &samples, 0, 9_000, &[]).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);

        // At the window end the value is 18; 5 seconds later it is 28.
        let predicted =
            evaluate(RangeFunctionId::PredictLinear, &samples, 0, 9_000, &[5.0]).unwrap();
        assert!((predicted - 28.0).abs() < 1e-9);
    }

    #[test]
    fn test_quantile_over_time() {
        let samples = vec![(0, 1.0), (1, 2.0), (2, 3.0), (3, 4.0)];
        let median =
            evaluate(RangeFunctionId::QuantileOverTime, &samples, 0, 3, &[0.5]).unwrap();
        assert!((median - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_absent_over_time() {
        assert_eq!(
            evaluate(RangeFunctionId::AbsentOverTime, &[], 0, 100, &[]),
            Some(1.0)
        );
        assert_eq!(
            evaluate(RangeFunctionId::AbsentOverTime, &[(5, 1.0)], 0, 100, &[]),
            None
        );
    }

    #[test]
    fn test_holt_winters_tracks_trend() {
        let samples: Vec<(i64, f64)> = (0..10).map(|i| (i * 1000, i as f64)).collect();
        let smoothed =
            evaluate(RangeFunctionId::HoltWinters, &samples, 0, 9_000, &[0.5, 0.5]).unwrap();
        assert!((smoothed - 9.0).abs() < 1.0);
    }

    #[test]
    fn test_stddev_over_time() {
        let samples = vec![(0, 2.0), (1, 4.0), (2, 4.0), (3, 4.0), (4, 5.0), (5, 5.0), (6, 7.0), (7, 9.0)];
        let sd = evaluate(RangeFunctionId::StddevOverTime, &samples, 0, 7, &[]).unwrap();
        assert!((sd - 2.0).abs() < 1e-9);
    }
}
