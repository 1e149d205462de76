// =============================================================================
// VPIN — Volume-Synchronized Probability of Informed Trading
// =============================================================================
//
// Volume buckets of fixed size; VPIN is the mean absolute buy/sell imbalance
// across the trailing buckets. Feeds the toxicity classifier.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

use crate::types::Side;

/// Serialisable VPIN reading.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VpinSnapshot {
    pub vpin: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub buckets: usize,
}

/// VPIN calculator for a single symbol.
#[derive(Debug)]
pub struct VpinCalculator {
    bucket_size: f64,
    num_buckets: usize,
    current_buy: f64,
    current_sell: f64,
    current_total: f64,
    buckets: VecDeque<(f64, f64)>,
}

impl VpinCalculator {
    pub fn new(bucket_size: f64, num_buckets: usize) -> Self {
        Self {
            bucket_size,
            num_buckets,
            current_buy: 0.0,
            current_sell: 0.0,
            current_total: 0.0,
            buckets: VecDeque::with_capacity(num_buckets),
        }
    }

    /// Feed one classified print.
    pub fn on_print(&mut self, qty: f64, side: Side) {
        match side {
            Side::Buy => self.current_buy += qty,
            Side::Sell => self.current_sell += qty,
        }
        self.current_total += qty;

        // Roll completed buckets, carrying the overflow forward.
        while self.current_total >= self.bucket_size {
            let overflow = self.current_total - self.bucket_size;
            let ratio = if self.current_total > 0.0 {
                (self.current_total - overflow) / self.current_total
            } else {
                1.0
            };

            self.buckets
                .push_back((self.current_buy * ratio, self.current_sell * ratio));
            if self.buckets.len() > self.num_buckets {
                self.buckets.pop_front();
            }

            self.current_buy *= 1.0 - ratio;
            self.current_sell *= 1.0 - ratio;
            self.current_total = overflow;
        }
    }

    pub fn snapshot(&self) -> VpinSnapshot {
        if self.buckets.is_empty() {
            return VpinSnapshot {
                vpin: 0.0,
                buy_volume: 0.0,
                sell_volume: 0.0,
                buckets: 0,
            };
        }

        let imbalance: f64 = self
            .buckets
            .iter()
            .map(|(buy, sell)| (buy - sell).abs())
            .sum();
        let volume: f64 = self.buckets.iter().map(|(buy, sell)| buy + sell).sum();

        let vpin = if volume > 0.0 { imbalance / volume } else { 0.0 };

        VpinSnapshot {
            vpin,
            buy_volume: self.buckets.iter().map(|(b, _)| b).sum(),
            sell_volume: self.buckets.iter().map(|(_, s)| s).sum(),
            buckets: self.buckets.len(),
        }
    }
}

impl Default for VpinCalculator {
    fn default() -> Self {
        Self::new(1_000.0, 50)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_calculator_is_zero() {
        let v = VpinCalculator::new(10.0, 5);
        assert_eq!(v.snapshot().vpin, 0.0);
    }

    #[test]
    fn one_sided_flow_is_fully_toxic() {
        let mut v = VpinCalculator::new(10.0, 5);
        for _ in 0..5 {
            v.on_print(10.0, Side::Buy);
        }
        let s = v.snapshot();
        assert!((s.vpin - 1.0).abs() < 1e-9);
        assert_eq!(s.buckets, 5);
    }

    #[test]
    fn balanced_flow_is_clean() {
        let mut v = VpinCalculator::new(10.0, 5);
        for _ in 0..10 {
            v.on_print(1.0, Side::Buy);
            v.on_print(1.0, Side::Sell);
        }
        let s = v.snapshot();
        assert!(s.vpin < 0.1);
    }

    #[test]
    fn bucket_count_is_bounded() {
        let mut v = VpinCalculator::new(1.0, 3);
        for _ in 0..50 {
            v.on_print(1.0, Side::Buy);
        }
        assert_eq!(v.snapshot().buckets, 3);
    }
}
