// =============================================================================
// Time & Sales — rolling window over classified trade prints
// =============================================================================
//
// Only prints with a classified taker side are admitted. The window prunes on
// event time at every insert; wall clock never enters.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

use crate::types::Side;

/// Default rolling window.
const DEFAULT_WINDOW_MS: i64 = 10_000;
/// Sub-window used by the burst detector.
const BURST_WINDOW_MS: i64 = 1_000;
/// Prints inside the burst window at which the burst score saturates.
const BURST_SATURATION: usize = 12;
/// Minimum same-side share for a directional burst.
const BURST_SIDE_SHARE: f64 = 0.8;

#[derive(Debug, Clone, Copy)]
struct WindowPrint {
    ts_ms: i64,
    qty: f64,
    side: Side,
    latency_ms: i64,
}

/// Serialisable snapshot of the current window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TasSnapshot {
    pub buy_count: u32,
    pub sell_count: u32,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub prints_per_second: f64,
    /// 0..1 intensity of the most recent 1 s burst.
    pub burst_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst_side: Option<Side>,
    pub burst_count: u32,
    /// Mean (event − trade) latency across the window, clamped at 0.
    pub avg_latency_ms: f64,
}

/// Rolling time-and-sales aggregator for one symbol.
#[derive(Debug)]
pub struct TimeAndSales {
    window_ms: i64,
    prints: VecDeque<WindowPrint>,
}

impl TimeAndSales {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW_MS)
    }

    pub fn with_window(window_ms: i64) -> Self {
        Self {
            window_ms,
            prints: VecDeque::new(),
        }
    }

    /// Admit a classified print. `recv_ms` is the exchange event time, which
    /// may lag (or, with clock skew, lead) the trade time.
    pub fn on_print(&mut self, ts_ms: i64, recv_ms: i64, qty: f64, side: Side) {
        // Future-dated trade timestamps produce negative latency; clamp per
        // print so the mean stays meaningful.
        let latency_ms = (recv_ms - ts_ms).max(0);
        self.prints.push_back(WindowPrint {
            ts_ms,
            qty,
            side,
            latency_ms,
        });
        self.prune(ts_ms);
    }

    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while let Some(front) = self.prints.front() {
            if front.ts_ms < cutoff {
                self.prints.pop_front();
            } else {
                break;
            }
        }
    }

    /// Build the current snapshot; prunes against `now_ms` first.
    pub fn snapshot(&mut self, now_ms: i64) -> TasSnapshot {
        self.prune(now_ms);

        let mut buy_count = 0u32;
        let mut sell_count = 0u32;
        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        let mut latency_sum = 0i64;

        for p in &self.prints {
            match p.side {
                Side::Buy => {
                    buy_count += 1;
                    buy_volume += p.qty;
                }
                Side::Sell => {
                    sell_count += 1;
                    sell_volume += p.qty;
                }
            }
            latency_sum += p.latency_ms;
        }

        let total = self.prints.len();
        let prints_per_second = total as f64 / (self.window_ms as f64 / 1_000.0);
        let avg_latency_ms = if total > 0 {
            (latency_sum as f64 / total as f64).max(0.0)
        } else {
            0.0
        };

        let (burst_score, burst_side, burst_count) = self.burst(now_ms);

        TasSnapshot {
            buy_count,
            sell_count,
            buy_volume,
            sell_volume,
            prints_per_second,
            burst_score,
            burst_side,
            burst_count,
            avg_latency_ms,
        }
    }

    /// Burst detector over the trailing 1 s: print count plus dominant side.
    fn burst(&self, now_ms: i64) -> (f64, Option<Side>, u32) {
        let cutoff = now_ms - BURST_WINDOW_MS;
        let mut buys = 0u32;
        let mut sells = 0u32;
        for p in self.prints.iter().rev() {
            if p.ts_ms < cutoff {
                break;
            }
            match p.side {
                Side::Buy => buys += 1,
                Side::Sell => sells += 1,
            }
        }

        let count = buys + sells;
        if count == 0 {
            return (0.0, None, 0);
        }

        let score = (count as f64 / BURST_SATURATION as f64).min(1.0);
        let share_buy = buys as f64 / count as f64;
        let side = if share_buy >= BURST_SIDE_SHARE {
            Some(Side::Buy)
        } else if share_buy <= 1.0 - BURST_SIDE_SHARE {
            Some(Side::Sell)
        } else {
            None
        };

        (score, side, count)
    }
}

impl Default for TimeAndSales {
    fn default() -> Self {
        Self::new()
    }
}
