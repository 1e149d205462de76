// =============================================================================
// Absorption Detector — repeated same-level aggression into a refreshing wall
// =============================================================================
//
// An absorption pattern: aggressive flow keeps hitting the same price level on
// the same side while the resting size there does not shrink — an iceberg or
// a refreshing passive player soaking up the flow.
//
// Fires (value 1) only when, within a 10 s window of event time:
//   1. at least 3 prints landed at the same level,
//   2. every print was on the same side,
//   3. price drift across the run is <= 0.01 % of the first price,
//   4. the resting size at the level never decreased between prints.
//
// Any violation resets the run to the violating print. Event time drives both
// the window and eviction; wall clock never enters the detector.
// =============================================================================

use serde::Serialize;

use crate::types::Side;

/// Window within which a run must complete.
const WINDOW_MS: i64 = 10_000;
/// Price drift tolerance as a fraction of the first price (0.01 %).
const DRIFT_THRESHOLD: f64 = 0.0001;
/// Prints required for a detection.
const MIN_REPEATS: u32 = 3;

/// Serialisable detector output.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AbsorptionSnapshot {
    /// 1.0 when all conditions hold, else 0.0.
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    pub price: f64,
    pub repeats: u32,
}

#[derive(Debug, Clone)]
struct Run {
    side: Side,
    repeats: u32,
    first_price: f64,
    last_price: f64,
    sizes: Vec<f64>,
    last_ts_ms: i64,
}

/// Per-symbol running absorption state.
#[derive(Debug, Default)]
pub struct AbsorptionDetector {
    run: Option<Run>,
}

impl AbsorptionDetector {
    pub fn new() -> Self {
        Self { run: None }
    }

    /// Feed one classified print together with the resting size currently at
    /// its level. Returns 1.0 on detection, 0.0 otherwise.
    pub fn on_print(&mut self, price: f64, side: Side, level_size: f64, ts_ms: i64) -> f64 {
        let run = match &mut self.run {
            Some(run) => run,
            None => {
                self.reset_to(price, side, level_size, ts_ms);
                return 0.0;
            }
        };

        let expired = ts_ms - run.last_ts_ms > WINDOW_MS;
        let side_broke = side != run.side;
        let drift = (price - run.first_price).abs();
        let drifted = drift > DRIFT_THRESHOLD * run.first_price;
        let wall_shrank = run
            .sizes
            .last()
            .map(|&prev| level_size < prev)
            .unwrap_or(false);

        if expired || side_broke || drifted || wall_shrank {
            self.reset_to(price, side, level_size, ts_ms);
            return 0.0;
        }

        run.repeats += 1;
        run.last_price = price;
        run.sizes.push(level_size);
        run.last_ts_ms = ts_ms;

        if run.repeats >= MIN_REPEATS {
            1.0
        } else {
            0.0
        }
    }

    fn reset_to(&mut self, price: f64, side: Side, level_size: f64, ts_ms: i64) {
        self.run = Some(Run {
            side,
            repeats: 1,
            first_price: price,
            last_price: price,
            sizes: vec![level_size],
            last_ts_ms: ts_ms,
        });
    }

    pub fn snapshot(&self) -> AbsorptionSnapshot {
        match &self.run {
            Some(run) if run.repeats >= MIN_REPEATS => AbsorptionSnapshot {
                value: 1.0,
                side: Some(run.side),
                price: run.last_price,
                repeats: run.repeats,
            },
            Some(run) => AbsorptionSnapshot {
                value: 0.0,
                side: None,
                price: run.last_price,
                repeats: run.repeats,
            },
            None => AbsorptionSnapshot {
                value: 0.0,
                side: None,
                price: 0.0,
                repeats: 0,
            },
        }
    }
}
