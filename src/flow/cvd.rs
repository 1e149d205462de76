// =============================================================================
// Cumulative Volume Delta — multi-timeframe signed aggressive volume
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

use crate::types::Side;

/// Maximum number of samples kept for the slope regression.
const SLOPE_HISTORY: usize = 60;

/// Ordinary least-squares slope of `ys` against sample index.
///
/// Returns 0 when fewer than two samples or a degenerate denominator.
pub fn ols_slope(ys: &[f64]) -> f64 {
    let n = ys.len();
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / nf;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// One rolling CVD window (e.g. 1m): signed volume events pruned by event
/// time, plus a bounded history of window sums for the slope.
#[derive(Debug)]
struct CvdWindow {
    window_ms: i64,
    events: VecDeque<(i64, f64)>,
    sum: f64,
    history: VecDeque<f64>,
}

impl CvdWindow {
    fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            events: VecDeque::new(),
            sum: 0.0,
            history: VecDeque::new(),
        }
    }

    fn on_print(&mut self, ts_ms: i64, signed_qty: f64) {
        self.events.push_back((ts_ms, signed_qty));
        self.sum += signed_qty;
        self.prune(ts_ms);
    }

    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while let Some(&(ts, q)) = self.events.front() {
            if ts < cutoff {
                self.sum -= q;
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record the current sum into the slope history (call once per tick).
    fn sample(&mut self, now_ms: i64) {
        self.prune(now_ms);
        self.history.push_back(self.sum);
        while self.history.len() > SLOPE_HISTORY {
            self.history.pop_front();
        }
    }

    fn slope(&self) -> f64 {
        let ys: Vec<f64> = self.history.iter().copied().collect();
        ols_slope(&ys)
    }
}

/// Serialisable multi-timeframe CVD snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CvdSnapshot {
    pub cvd_1m: f64,
    pub cvd_5m: f64,
    pub cvd_15m: f64,
    pub slope_1m: f64,
    pub slope_5m: f64,
    pub slope_15m: f64,
}

/// Multi-timeframe CVD aggregator (1m / 5m / 15m).
#[derive(Debug)]
pub struct MultiTimeframeCvd {
    w1m: CvdWindow,
    w5m: CvdWindow,
    w15m: CvdWindow,
}

impl MultiTimeframeCvd {
    pub fn new() -> Self {
        Self {
            w1m: CvdWindow::new(60_000),
            w5m: CvdWindow::new(300_000),
            w15m: CvdWindow::new(900_000),
        }
    }

    pub fn on_print(&mut self, ts_ms: i64, qty: f64, side: Side) {
        let signed = qty * side.sign();
        self.w1m.on_print(ts_ms, signed);
        self.w5m.on_print(ts_ms, signed);
        self.w15m.on_print(ts_ms, signed);
    }

    /// Advance the slope histories; call once per aggregate tick.
    pub fn sample(&mut self, now_ms: i64) {
        self.w1m.sample(now_ms);
        self.w5m.sample(now_ms);
        self.w15m.sample(now_ms);
    }

    pub fn snapshot(&self) -> CvdSnapshot {
        CvdSnapshot {
            cvd_1m: self.w1m.sum,
            cvd_5m: self.w5m.sum,
            cvd_15m: self.w15m.sum,
            slope_1m: self.w1m.slope(),
            slope_5m: self.w5m.slope(),
            slope_15m: self.w15m.slope(),
        }
    }
}

impl Default for MultiTimeframeCvd {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ols_slope_of_line_is_exact() {
        let ys: Vec<f64> = (0..10).map(|i| 3.0 + 2.0 * i as f64).collect();
        assert!((ols_slope(&ys) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn ols_slope_degenerate_is_zero() {
        assert_eq!(ols_slope(&[]), 0.0);
        assert_eq!(ols_slope(&[5.0]), 0.0);
        assert_eq!(ols_slope(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn windows_accumulate_signed_volume() {
        let mut cvd = MultiTimeframeCvd::new();
        cvd.on_print(1_000, 5.0, Side::Buy);
        cvd.on_print(2_000, 2.0, Side::Sell);
        let s = cvd.snapshot();
        assert!((s.cvd_1m - 3.0).abs() < 1e-12);
        assert!((s.cvd_5m - 3.0).abs() < 1e-12);
        assert!((s.cvd_15m - 3.0).abs() < 1e-12);
    }

    #[test]
    fn one_minute_window_prunes_but_longer_keeps() {
        let mut cvd = MultiTimeframeCvd::new();
        cvd.on_print(0, 5.0, Side::Buy);
        cvd.on_print(90_000, 1.0, Side::Buy);
        let s = cvd.snapshot();
        assert!((s.cvd_1m - 1.0).abs() < 1e-12);
        assert!((s.cvd_5m - 6.0).abs() < 1e-12);
    }

    #[test]
    fn slope_tracks_rising_cvd() {
        let mut cvd = MultiTimeframeCvd::new();
        for i in 0..20i64 {
            cvd.on_print(i * 1_000, 10.0, Side::Buy);
            cvd.sample(i * 1_000);
        }
        let s = cvd.snapshot();
        assert!(s.slope_1m > 0.0);
    }

    #[test]
    fn slope_history_is_bounded() {
        let mut cvd = MultiTimeframeCvd::new();
        for i in 0..200i64 {
            cvd.sample(i * 1_000);
        }
        assert!(cvd.w1m.history.len() <= SLOPE_HISTORY);
    }
}
