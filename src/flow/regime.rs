// =============================================================================
// Regime Tracker — rolling trendiness / chop / volatility indicators
// =============================================================================
//
// Fed one mid-price sample per second by the symbol engine. Produces the
// continuous inputs the regime and execution classifiers consume, the
// volatility percentile, and a short ATR used by the add ladder.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

/// 1 s mid samples retained.
const MID_SAMPLES: usize = 120;
/// Samples entering the efficiency-ratio / chop computations.
const REGIME_LOOKBACK: usize = 60;
/// Bounds of the volatility-percentile window.
const VOL_PCT_WINDOW_MIN: usize = 5;
const VOL_PCT_WINDOW_MAX: usize = 20;
/// 1m bars retained for the ATR.
const BAR_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy)]
struct MinuteBar {
    open_ms: i64,
    high: f64,
    low: f64,
    close: f64,
}

/// Serialisable regime indicator set.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegimeSnapshot {
    /// Kaufman efficiency ratio over the lookback (0..1).
    pub trendiness: f64,
    /// Fraction of 1 s return sign alternations over the lookback (0..1).
    pub chop: f64,
    /// Realized 1 m volatility (std of 1 s returns, in percent).
    pub realized_vol_1m_pct: f64,
    /// Coefficient of variation of the rolling volatility samples.
    pub vol_of_vol: f64,
    /// Percentile of the current volatility within its window (0..100).
    pub volatility_percentile: f64,
    /// ATR over the last three closed 1 m bars (price units).
    pub atr_3m: f64,
}

/// Rolling state behind [`RegimeSnapshot`].
#[derive(Debug)]
pub struct RegimeTracker {
    mids: VecDeque<f64>,
    vol_samples: VecDeque<f64>,
    bars: VecDeque<MinuteBar>,
    last_sample_ms: i64,
}

impl RegimeTracker {
    pub fn new() -> Self {
        Self {
            mids: VecDeque::new(),
            vol_samples: VecDeque::new(),
            bars: VecDeque::new(),
            last_sample_ms: 0,
        }
    }

    /// Feed the current mid. Sub-second calls are ignored; bars and vol
    /// samples advance on the 1 s cadence.
    pub fn on_mid(&mut self, mid: f64, now_ms: i64) {
        if mid <= 0.0 || now_ms - self.last_sample_ms < 1_000 {
            return;
        }
        self.last_sample_ms = now_ms;

        self.mids.push_back(mid);
        while self.mids.len() > MID_SAMPLES {
            self.mids.pop_front();
        }

        let vol = self.realized_vol_pct();
        if self.mids.len() >= 3 {
            self.vol_samples.push_back(vol);
            while self.vol_samples.len() > VOL_PCT_WINDOW_MAX {
                self.vol_samples.pop_front();
            }
        }

        self.update_bar(mid, now_ms);
    }

    fn update_bar(&mut self, mid: f64, now_ms: i64) {
        let bar_open = now_ms - now_ms.rem_euclid(60_000);
        match self.bars.back_mut() {
            Some(bar) if bar.open_ms == bar_open => {
                bar.high = bar.high.max(mid);
                bar.low = bar.low.min(mid);
                bar.close = mid;
            }
            _ => {
                self.bars.push_back(MinuteBar {
                    open_ms: bar_open,
                    high: mid,
                    low: mid,
                    close: mid,
                });
                while self.bars.len() > BAR_CAPACITY {
                    self.bars.pop_front();
                }
            }
        }
    }

    fn returns(&self) -> Vec<f64> {
        let n = self.mids.len();
        let start = n.saturating_sub(REGIME_LOOKBACK + 1);
        let mids: Vec<f64> = self.mids.iter().skip(start).copied().collect();
        mids.windows(2)
            .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
            .collect()
    }

    fn realized_vol_pct(&self) -> f64 {
        let rets = self.returns();
        let n = rets.len();
        if n < 2 {
            return 0.0;
        }
        let mean = rets.iter().sum::<f64>() / n as f64;
        let var = rets.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n as f64;
        var.sqrt() * 100.0
    }

    fn trendiness(&self) -> f64 {
        let n = self.mids.len();
        if n < 3 {
            return 0.0;
        }
        let start = n.saturating_sub(REGIME_LOOKBACK + 1);
        let mids: Vec<f64> = self.mids.iter().skip(start).copied().collect();
        let net = (mids[mids.len() - 1] - mids[0]).abs();
        let path: f64 = mids.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        if path > 0.0 {
            net / path
        } else {
            0.0
        }
    }

    fn chop(&self) -> f64 {
        let rets = self.returns();
        if rets.len() < 2 {
            return 0.0;
        }
        let mut flips = 0usize;
        let mut pairs = 0usize;
        for w in rets.windows(2) {
            if w[0] != 0.0 && w[1] != 0.0 {
                pairs += 1;
                if (w[0] > 0.0) != (w[1] > 0.0) {
                    flips += 1;
                }
            }
        }
        if pairs > 0 {
            flips as f64 / pairs as f64
        } else {
            0.0
        }
    }

    fn vol_of_vol(&self) -> f64 {
        let n = self.vol_samples.len();
        if n < 3 {
            return 0.0;
        }
        let mean = self.vol_samples.iter().sum::<f64>() / n as f64;
        if mean <= 0.0 {
            return 0.0;
        }
        let var = self
            .vol_samples
            .iter()
            .map(|&v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n as f64;
        var.sqrt() / mean
    }

    /// Percentile of the latest volatility sample within its window. With
    /// fewer than 3 samples the percentile is undefined and reads 50.
    fn volatility_percentile(&self) -> f64 {
        let n = self.vol_samples.len();
        if n < 3 {
            return 50.0;
        }
        let window = n.clamp(VOL_PCT_WINDOW_MIN, VOL_PCT_WINDOW_MAX);
        let samples: Vec<f64> = self
            .vol_samples
            .iter()
            .skip(n - window)
            .copied()
            .collect();
        let current = *samples.last().expect("window is non-empty");
        let below = samples.iter().filter(|&&v| v <= current).count();
        (below as f64 / samples.len() as f64) * 100.0
    }

    fn atr(&self, bars: usize) -> f64 {
        // True range over closed-and-current 1 m bars.
        let n = self.bars.len();
        if n < 2 {
            return 0.0;
        }
        let take = bars.min(n - 1);
        let mut sum = 0.0;
        for i in (n - take)..n {
            let prev_close = self.bars[i - 1].close;
            let bar = self.bars[i];
            let tr = (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs());
            sum += tr;
        }
        sum / take as f64
    }

    pub fn snapshot(&self) -> RegimeSnapshot {
        RegimeSnapshot {
            trendiness: self.trendiness(),
            chop: self.chop(),
            realized_vol_1m_pct: self.realized_vol_pct(),
            vol_of_vol: self.vol_of_vol(),
            volatility_percentile: self.volatility_percentile(),
            atr_3m: self.atr(3),
        }
    }
}

impl Default for RegimeTracker {
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
    fn percentile_defaults_to_fifty_with_few_samples() {
        let mut t = RegimeTracker::new();
        t.on_mid(100.0, 1_000);
        t.on_mid(100.5, 2_000);
        assert_eq!(t.snapshot().volatility_percentile, 50.0);
    }

    #[test]
    fn monotonic_ramp_is_trending_not_choppy() {
        let mut t = RegimeTracker::new();
        for i in 0..80i64 {
            t.on_mid(100.0 + i as f64 * 0.1, i * 1_000);
        }
        let s = t.snapshot();
        assert!(s.trendiness > 0.9, "trendiness = {}", s.trendiness);
        assert!(s.chop < 0.1, "chop = {}", s.chop);
    }

    #[test]
    fn zigzag_is_choppy_not_trending() {
        let mut t = RegimeTracker::new();
        for i in 0..80i64 {
            let mid = if i % 2 == 0 { 100.0 } else { 100.2 };
            t.on_mid(mid, i * 1_000);
        }
        let s = t.snapshot();
        assert!(s.chop > 0.9, "chop = {}", s.chop);
        assert!(s.trendiness < 0.1, "trendiness = {}", s.trendiness);
    }

    #[test]
    fn sub_second_samples_ignored() {
        let mut t = RegimeTracker::new();
        t.on_mid(100.0, 1_000);
        t.on_mid(101.0, 1_100);
        t.on_mid(102.0, 1_900);
        assert_eq!(t.mids.len(), 1);
    }

    #[test]
    fn atr_tracks_bar_ranges() {
        let mut t = RegimeTracker::new();
        // Four minutes of data with a 1.0-wide range each minute.
        for minute in 0..4i64 {
            for sec in 0..60i64 {
                let base = 100.0 + minute as f64;
                let mid = base + if sec % 2 == 0 { 0.0 } else { 1.0 };
                t.on_mid(mid, (minute * 60 + sec) * 1_000);
            }
        }
        let s = t.snapshot();
        assert!(s.atr_3m >= 1.0, "atr = {}", s.atr_3m);
    }

    #[test]
    fn vol_of_vol_zero_for_flat_series() {
        let mut t = RegimeTracker::new();
        for i in 0..30i64 {
            t.on_mid(100.0, i * 1_000);
        }
        assert_eq!(t.snapshot().vol_of_vol, 0.0);
    }
}
