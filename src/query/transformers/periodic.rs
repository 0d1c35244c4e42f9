//! Periodic resampling of raw sample streams.
//!
//! [`PeriodicCursor`] pulls lazily from a raw, timestamp-ordered cursor
//! and emits one row per grid point `{start, start+step, .., end}`. With a
//! window it gathers the samples in `(t - offset - window, t - offset]`
//! and applies a range function; without one it behaves as an instant
//! selector, reporting the latest sample within the staleness lookback.
//! Grid points that cannot produce a value are skipped, not emitted as
//! NaN.
//!
//! The offset shifts where samples are read from while the emitted rows
//! keep the query grid's timestamps.

use crate::query::logical::RangeFunctionId;
use crate::query::range_vector::{RangeVector, RangeVectorCursor, Row, RvRange};
use crate::query::transformers::range_functions;
use std::collections::VecDeque;

/// Resampling cursor over one raw stream.
pub struct PeriodicCursor {
    inner: Box<dyn RangeVectorCursor>,
    grid_ts: i64,
    end_ms: i64,
    step_ms: i64,
    window_ms: Option<i64>,
    function: Option<RangeFunctionId>,
    function_args: Vec<f64>,
    offset_ms: i64,
    lookback_ms: i64,
    buffer: VecDeque<(i64, f64)>,
    pending: Option<(i64, f64)>,
    inner_done: bool,
}

impl PeriodicCursor {
    /// Build a resampler over `inner`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inner: Box<dyn RangeVectorCursor>,
        range: RvRange,
        window_ms: Option<i64>,
        function: Option<RangeFunctionId>,
        function_args: Vec<f64>,
        offset_ms: i64,
        lookback_ms: i64,
    ) -> Self {
        Self {
            inner,
            grid_ts: range.start_ms,
            end_ms: range.end_ms,
            step_ms: range.step_ms.max(1),
            window_ms,
            function,
            function_args,
            offset_ms,
            lookback_ms,
            buffer: VecDeque::new(),
            pending: None,
            inner_done: false,
        }
    }

    /// Pull inner rows up to and including `limit_ts` into the buffer.
    fn fill_until(&mut self, limit_ts: i64) {
        if let Some((ts, v)) = self.pending {
            if ts <= limit_ts {
                self.buffer.push_back((ts, v));
                self.pending = None;
            } else {
                return;
            }
        }
        while !self.inner_done {
            match self.inner.next_row() {
                Some(row) => {
                    let sample = (row.timestamp_ms, row.value.as_double());
                    if sample.0 <= limit_ts {
                        self.buffer.push_back(sample);
                    } else {
                        self.pending = Some(sample);
                        break;
                    }
                }
                None => self.inner_done = true,
            }
        }
    }

    fn evaluate_at(&mut self, grid_ts: i64) -> Option<f64> {
        let window_end = grid_ts - self.offset_ms;
        self.fill_until(window_end);

        match self.window_ms {
            Some(window) => {
                let window_start = window_end - window;
                // Window is (window_start, window_end].
                while matches!(self.buffer.front(), Some(&(ts, _)) if ts <= window_start) {
                    self.buffer.pop_front();
                }
                let samples: Vec<(i64, f64)> = self.buffer.iter().copied().collect();
                range_functions::evaluate(
                    self.function.unwrap_or(RangeFunctionId::LastOverTime),
                    &samples,
                    window_start,
                    window_end,
                    &self.function_args,
                )
            }
            None => {
                // Instant selector: latest sample within the lookback.
                let stale_before = window_end - self.lookback_ms;
                while matches!(self.buffer.front(), Some(&(ts, _)) if ts < stale_before) {
                    self.buffer.pop_front();
                }
                self.buffer.back().map(|&(_, v)| v)
            }
        }
    }
}

impl RangeVectorCursor for PeriodicCursor {
    fn next_row(&mut self) -> Option<Row> {
        while self.grid_ts <= self.end_ms {
            let grid_ts = self.grid_ts;
            self.grid_ts += self.step_ms;
            if let Some(value) = self.evaluate_at(grid_ts) {
                return Some(Row::double(grid_ts, value));
            }
        }
        None
    }

    fn close(&mut self) {
        self.buffer.clear();
        self.inner.close();
    }
}

/// Wrap every vector of a result with a [`PeriodicCursor`].
#[allow(clippy::too_many_arguments)]
pub fn resample(
    vectors: Vec<RangeVector>,
    range: RvRange,
    window_ms: Option<i64>,
    function: Option<RangeFunctionId>,
    function_args: &[f64],
    offset_ms: i64,
    lookback_ms: i64,
) -> Vec<RangeVector> {
    vectors
        .into_iter()
        .map(|rv| RangeVector {
            key: rv.key,
            output_range: Some(range),
            cursor: Box::new(PeriodicCursor::new(
                rv.cursor,
                range,
                window_ms,
                function,
                function_args.to_vec(),
                offset_ms,
                lookback_ms,
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::range_vector::BufferedCursor;

    fn cursor(samples: Vec<(i64, f64)>) -> Box<dyn RangeVectorCursor> {
        Box::new(BufferedCursor::from_samples(samples))
    }

    fn drain(mut c: PeriodicCursor) -> Vec<(i64, f64)> {
        let mut out = Vec::new();
        while let Some(row) = c.next_row() {
            out.push((row.timestamp_ms, row.value.as_double()));
        }
        out
    }

    #[test]
    fn test_instant_selector_takes_latest_within_lookback() {
        let samples = vec![(5, 1.0), (15, 2.0), (25, 3.0)];
        let c = PeriodicCursor::new(
            cursor(samples),
            RvRange { start_ms: 10, step_ms: 10, end_ms: 40 },
            None,
            None,
            vec![],
            0,
            20,
        );
        let rows = drain(c);
        assert_eq!(rows, vec![(10, 1.0), (20, 2.0), (30, 3.0), (40, 3.0)]);
    }

    #[test]
    fn test_instant_selector_staleness_cuts_off() {
        let samples = vec![(0, 1.0)];
        let c = PeriodicCursor::new(
            cursor(samples),
            RvRange { start_ms: 0, step_ms: 10, end_ms: 50 },
            None,
            None,
            vec![],
            0,
            20,
        );
        let rows = drain(c);
        // Visible only while within the 20ms lookback.
        assert_eq!(rows, vec![(0, 1.0), (10, 1.0), (20, 1.0)]);
    }

    #[test]
    fn test_windowed_sum_over_time() {
        let samples: Vec<(i64, f64)> = (1..=10).map(|i| (i * 10, 1.0)).collect();
        let c = PeriodicCursor::new(
            cursor(samples),
            RvRange { start_ms: 50, step_ms: 50, end_ms: 100 },
            Some(50),
            Some(RangeFunctionId::SumOverTime),
            vec![],
            0,
            0,
        );
        let rows = drain(c);
        // Window (0,50] holds 5 samples, window (50,100] the other 5.
        assert_eq!(rows, vec![(50, 5.0), (100, 5.0)]);
    }

    #[test]
    fn test_offset_shifts_reads_not_output() {
        let samples = vec![(10, 1.0), (20, 2.0)];
        let c = PeriodicCursor::new(
            cursor(samples),
            RvRange { start_ms: 120, step_ms: 10, end_ms: 120 },
            None,
            None,
            vec![],
            100,
            20,
        );
        let rows = drain(c);
        // Reads at 20, reports at the query grid point 120.
        assert_eq!(rows, vec![(120, 2.0)]);
    }

    #[test]
    fn test_empty_windows_skip_grid_points() {
        let samples = vec![(100, 1.0), (110, 2.0)];
        let c = PeriodicCursor::new(
            cursor(samples),
            RvRange { start_ms: 0, step_ms: 50, end_ms: 150 },
            Some(20),
            Some(RangeFunctionId::SumOverTime),
            vec![],
            0,
            0,
        );
        let rows = drain(c);
        // Only the grid point at 100 has samples in its window.
        assert_eq!(rows, vec![(100, 1.0)]);
    }

    #[test]
    fn test_rate_on_grid() {
        // 1 unit per second counter, sampled every second.
        let samples: Vec<(i64, f64)> = (0..=60).map(|i| (i * 1000, i as f64)).collect();
        let c = PeriodicCursor::new(
            cursor(samples),
            RvRange { start_ms: 30_000, step_ms: 30_000, end_ms: 60_000 },
            Some(30_000),
            Some(RangeFunctionId::Rate),
            vec![],
            0,
            0,
        );
        let rows = drain(c);
        assert_eq!(rows.len(), 2);
        for (_, rate) in rows {
            assert!((rate - 1.0).abs() < 1e-9);
        }
    }
}
