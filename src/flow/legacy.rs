// =============================================================================
// Legacy Metrics — OBI, rolling deltas, delta Z-score, session CVD, VWAP
// =============================================================================
//
// The original per-symbol metric set the downstream consumers still read.
// Windows prune by event time at every insert; the Z-score samples the 1 s
// net delta once per second.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

use crate::market::book::OrderBook;
use crate::types::Side;

/// Levels for the weighted (near-touch) imbalance.
const OBI_WEIGHTED_LEVELS: usize = 10;
/// Levels for the deep imbalance.
const OBI_DEEP_LEVELS: usize = 50;
/// Z-score sample history bound.
const DELTA_Z_SAMPLES: usize = 60;

/// Serialisable legacy metric set.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LegacyMetrics {
    /// Top-10 bid volume minus ask volume.
    pub obi_weighted: f64,
    /// Top-50 bid volume minus ask volume.
    pub obi_deep: f64,
    /// Net signed quantity over the last second.
    pub delta_1s: f64,
    /// Net signed quantity over the last five seconds.
    pub delta_5s: f64,
    /// Z-score of `delta_1s` against its own rolling history.
    pub delta_z: f64,
    /// Signed volume accumulated since session start.
    pub session_cvd: f64,
    /// OLS slope of the session CVD history.
    pub cvd_slope: f64,
    /// Session volume-weighted average price (0 when no volume).
    pub vwap: f64,
    pub mid_price: f64,
    /// |1 s mid return| per unit of 1 s traded quantity (impact proxy).
    pub impact: f64,
}

/// Rolling state behind [`LegacyMetrics`].
#[derive(Debug)]
pub struct LegacyTracker {
    delta_events: VecDeque<(i64, f64)>,
    delta_1s: f64,
    delta_5s: f64,
    delta_samples: VecDeque<f64>,
    session_cvd: f64,
    cvd_history: VecDeque<f64>,
    notional_sum: f64,
    volume_sum: f64,
    last_sample_ms: i64,
    prev_mid: f64,
    vol_1s: f64,
}

impl LegacyTracker {
    pub fn new() -> Self {
        Self {
            delta_events: VecDeque::new(),
            delta_1s: 0.0,
            delta_5s: 0.0,
            delta_samples: VecDeque::new(),
            session_cvd: 0.0,
            cvd_history: VecDeque::new(),
            notional_sum: 0.0,
            volume_sum: 0.0,
            last_sample_ms: 0,
            prev_mid: 0.0,
            vol_1s: 0.0,
        }
    }

    /// Feed one classified print.
    pub fn on_print(&mut self, ts_ms: i64, price: f64, qty: f64, side: Side) {
        let signed = qty * side.sign();
        self.delta_events.push_back((ts_ms, signed));
        self.session_cvd += signed;
        self.notional_sum += price * qty;
        self.volume_sum += qty;
        self.prune(ts_ms);
    }

    fn prune(&mut self, now_ms: i64) {
        let cutoff_5s = now_ms - 5_000;
        while let Some(&(ts, _)) = self.delta_events.front() {
            if ts < cutoff_5s {
                self.delta_events.pop_front();
            } else {
                break;
            }
        }

        let cutoff_1s = now_ms - 1_000;
        self.delta_5s = self.delta_events.iter().map(|&(_, q)| q).sum();
        self.delta_1s = self
            .delta_events
            .iter()
            .filter(|&&(ts, _)| ts >= cutoff_1s)
            .map(|&(_, q)| q)
            .sum();
        self.vol_1s = self
            .delta_events
            .iter()
            .filter(|&&(ts, _)| ts >= cutoff_1s)
            .map(|&(_, q)| q.abs())
            .sum();
    }

    /// Advance the once-per-second sample series (Z history, CVD slope
    /// history). Safe to call every tick; sub-second calls are no-ops.
    pub fn sample(&mut self, now_ms: i64) {
        if now_ms - self.last_sample_ms < 1_000 {
            return;
        }
        self.last_sample_ms = now_ms;
        self.prune(now_ms);

        self.delta_samples.push_back(self.delta_1s);
        while self.delta_samples.len() > DELTA_Z_SAMPLES {
            self.delta_samples.pop_front();
        }

        self.cvd_history.push_back(self.session_cvd);
        while self.cvd_history.len() > DELTA_Z_SAMPLES {
            self.cvd_history.pop_front();
        }
    }

    /// Z-score of the current 1 s delta against the sample history.
    fn delta_z(&self) -> f64 {
        let n = self.delta_samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.delta_samples.iter().sum::<f64>() / n as f64;
        let var = self
            .delta_samples
            .iter()
            .map(|&x| (x - mean) * (x - mean))
            .sum::<f64>()
            / n as f64;
        let std = var.sqrt();
        if std == 0.0 {
            0.0
        } else {
            (self.delta_1s - mean) / std
        }
    }

    pub fn vwap(&self) -> f64 {
        if self.volume_sum > 0.0 {
            self.notional_sum / self.volume_sum
        } else {
            0.0
        }
    }

    pub fn session_cvd(&self) -> f64 {
        self.session_cvd
    }

    /// Build the metric set against the current book.
    pub fn snapshot(&mut self, book: &OrderBook) -> LegacyMetrics {
        let mid = book.mid_price().unwrap_or(0.0);

        // Impact proxy: fractional mid move per traded quantity in 1 s.
        let impact = if self.prev_mid > 0.0 && mid > 0.0 && self.vol_1s > 0.0 {
            ((mid - self.prev_mid).abs() / mid) / self.vol_1s
        } else {
            0.0
        };
        if mid > 0.0 {
            self.prev_mid = mid;
        }

        let ys: Vec<f64> = self.cvd_history.iter().copied().collect();

        LegacyMetrics {
            obi_weighted: book.obi(OBI_WEIGHTED_LEVELS),
            obi_deep: book.obi(OBI_DEEP_LEVELS),
            delta_1s: self.delta_1s,
            delta_5s: self.delta_5s,
            delta_z: self.delta_z(),
            session_cvd: self.session_cvd,
            cvd_slope: crate::flow::cvd::ols_slope(&ys),
            vwap: self.vwap(),
            mid_price: mid,
            impact,
        }
    }
}

impl Default for LegacyTracker {
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
    use crate::market::frames::DepthSnapshot;

    fn book() -> OrderBook {
        let mut b = OrderBook::new("BTCUSDT");
        b.apply_snapshot(
            &DepthSnapshot {
                last_update_id: 1,
                bids: vec![(99.0, 4.0), (98.0, 2.0)],
                asks: vec![(101.0, 1.0), (102.0, 3.0)],
            },
            0,
        );
        b
    }

    #[test]
    fn obi_from_book_levels() {
        let mut t = LegacyTracker::new();
        let m = t.snapshot(&book());
        assert!((m.obi_weighted - 2.0).abs() < 1e-12); // 6 - 4
        assert!((m.obi_deep - 2.0).abs() < 1e-12);
        assert_eq!(m.mid_price, 100.0);
    }

    #[test]
    fn rolling_deltas_split_windows() {
        let mut t = LegacyTracker::new();
        t.on_print(0, 100.0, 5.0, Side::Buy);
        t.on_print(4_500, 100.0, 2.0, Side::Sell);
        t.on_print(4_800, 100.0, 1.0, Side::Sell);
        // As of 4.8 s: 1 s window holds both sells, 5 s window everything.
        assert!((t.delta_1s - (-3.0)).abs() < 1e-12);
        assert!((t.delta_5s - 2.0).abs() < 1e-12);
    }

    #[test]
    fn delta_z_zero_with_constant_history() {
        let mut t = LegacyTracker::new();
        for i in 0..10i64 {
            t.on_print(i * 1_000, 100.0, 1.0, Side::Buy);
            t.sample(i * 1_000 + 1);
        }
        // All samples near-identical → std ~0 → Z defined as 0.
        let m = t.snapshot(&book());
        assert_eq!(m.delta_z, 0.0);
    }

    #[test]
    fn vwap_is_notional_over_volume() {
        let mut t = LegacyTracker::new();
        t.on_print(0, 100.0, 1.0, Side::Buy);
        t.on_print(1, 200.0, 1.0, Side::Sell);
        assert!((t.vwap() - 150.0).abs() < 1e-12);
    }

    #[test]
    fn vwap_zero_without_volume() {
        let t = LegacyTracker::new();
        assert_eq!(t.vwap(), 0.0);
    }

    #[test]
    fn session_cvd_accumulates_forever() {
        let mut t = LegacyTracker::new();
        t.on_print(0, 100.0, 5.0, Side::Buy);
        t.on_print(600_000, 100.0, 2.0, Side::Sell);
        assert!((t.session_cvd() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn sample_is_once_per_second() {
        let mut t = LegacyTracker::new();
        t.sample(1_000);
        t.sample(1_200);
        t.sample(1_900);
        t.sample(2_000);
        assert_eq!(t.delta_samples.len(), 2);
    }
}
