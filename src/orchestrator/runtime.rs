// =============================================================================
// Orchestrator Runtime — the mutable per-symbol decision state
// =============================================================================
//
// Owned exclusively by the symbol's processing task. The chase start
// timestamp is STICKY: it is written exactly on the IDLE → CHASING edge and
// never by reprices.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

use crate::types::Side;

/// Horizon of the rolling event lists.
const EVENT_WINDOW_MS: i64 = 300_000;

/// Monotonic telemetry counters; never reset while the process lives.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub ticks: u64,
    pub hold_ticks: u64,
    pub entries_emitted: u64,
    pub adds_emitted: u64,
    pub maker_exits_emitted: u64,
    pub taker_exits_emitted: u64,
    pub chase_timed_out_count: u64,
    pub taker_fallbacks: u64,
    pub aborted_chases: u64,
    pub side_flips: u64,
    pub crossmarket_vetoes: u64,
    pub side_mismatch_blocks: u64,
    pub invalid_llm_responses: u64,
    pub max_chase_elapsed_ms: i64,
}

/// Mutable decision state for one symbol.
#[derive(Debug)]
pub struct OrchestratorRuntime {
    // ── Position ────────────────────────────────────────────────────────
    pub side: Option<Side>,
    pub position_qty: f64,
    pub entry_vwap: f64,
    pub base_qty: f64,
    pub adds_used: u32,
    pub last_add_ts: i64,
    pub cooldown_until_ms: i64,

    // ── Chase ───────────────────────────────────────────────────────────
    pub chase_active: bool,
    /// STICKY: set only on the false→true transition of `chase_active`.
    pub chase_start_ts: i64,
    pub chase_last_reprice_ts: i64,
    pub reprices_used: u32,
    pub chase_timed_out: bool,
    pub taker_fallback_used: bool,

    // ── Side hysteresis ─────────────────────────────────────────────────
    pub confirm_count_long: u32,
    pub confirm_count_short: u32,
    pub entry_confirm_count: u32,
    pub last_side_change_ts: i64,
    /// When the last opposite-side confirmation was observed; streaks older
    /// than the confirm TTL restart from zero.
    pub last_confirm_ts: i64,

    // ── Smoothing ───────────────────────────────────────────────────────
    pub smoothed_delta_z: f64,
    pub smoothed_obi_weighted: f64,
    pub smoothed_cvd_slope: f64,
    cvd_slope_window: VecDeque<f64>,
    smoothing_seeded: bool,

    // ── Reversal tracking ───────────────────────────────────────────────
    pub flip_detected_side: Option<Side>,
    pub flip_first_detected_ms: i64,
    pub flip_persistence_count: u32,

    // ── Exit episode ────────────────────────────────────────────────────
    pub exit_risk_active: bool,
    pub exit_maker_attempts: u32,
    pub exit_taker_used: bool,
    /// 0 = no mismatch currently observed.
    pub crossmarket_mismatch_since_ms: i64,

    // ── Rolling event lists (5 minutes) ─────────────────────────────────
    pub side_flip_events_5m: VecDeque<i64>,
    pub gate_true_events_5m: VecDeque<i64>,
    pub entry_intent_events_5m: VecDeque<i64>,

    // ── Quarantine ──────────────────────────────────────────────────────
    pub quarantined: bool,

    // ── Telemetry ───────────────────────────────────────────────────────
    pub telemetry: TelemetrySnapshot,
}

impl OrchestratorRuntime {
    pub fn new(base_qty: f64) -> Self {
        Self {
            side: None,
            position_qty: 0.0,
            entry_vwap: 0.0,
            base_qty,
            adds_used: 0,
            last_add_ts: 0,
            cooldown_until_ms: 0,

            chase_active: false,
            chase_start_ts: 0,
            chase_last_reprice_ts: 0,
            reprices_used: 0,
            chase_timed_out: false,
            taker_fallback_used: false,

            confirm_count_long: 0,
            confirm_count_short: 0,
            entry_confirm_count: 0,
            last_side_change_ts: 0,
            last_confirm_ts: 0,

            smoothed_delta_z: 0.0,
            smoothed_obi_weighted: 0.0,
            smoothed_cvd_slope: 0.0,
            cvd_slope_window: VecDeque::new(),
            smoothing_seeded: false,

            flip_detected_side: None,
            flip_first_detected_ms: 0,
            flip_persistence_count: 0,

            exit_risk_active: false,
            exit_maker_attempts: 0,
            exit_taker_used: false,
            crossmarket_mismatch_since_ms: 0,

            side_flip_events_5m: VecDeque::new(),
            gate_true_events_5m: VecDeque::new(),
            entry_intent_events_5m: VecDeque::new(),

            quarantined: false,

            telemetry: TelemetrySnapshot::default(),
        }
    }

    pub fn position_open(&self) -> bool {
        self.position_qty > 0.0 && self.side.is_some()
    }

    // -------------------------------------------------------------------------
    // Smoothing
    // -------------------------------------------------------------------------

    /// EWMA + median smoothing step for the side-selection inputs.
    pub fn smooth(
        &mut self,
        delta_z: f64,
        obi_weighted: f64,
        cvd_slope: f64,
        alpha_dz: f64,
        alpha_obi: f64,
        median_window: usize,
    ) {
        if !self.smoothing_seeded {
            self.smoothed_delta_z = delta_z;
            self.smoothed_obi_weighted = obi_weighted;
            self.smoothing_seeded = true;
        } else {
            self.smoothed_delta_z = alpha_dz * delta_z + (1.0 - alpha_dz) * self.smoothed_delta_z;
            self.smoothed_obi_weighted =
                alpha_obi * obi_weighted + (1.0 - alpha_obi) * self.smoothed_obi_weighted;
        }

        self.cvd_slope_window.push_back(cvd_slope);
        while self.cvd_slope_window.len() > median_window.max(1) {
            self.cvd_slope_window.pop_front();
        }
        self.smoothed_cvd_slope = median(&self.cvd_slope_window);
    }

    // -------------------------------------------------------------------------
    // Chase lifecycle
    // -------------------------------------------------------------------------

    /// IDLE → CHASING. The only place `chase_start_ts` is written.
    pub fn begin_chase(&mut self, now_ms: i64) {
        debug_assert!(!self.chase_active);
        self.chase_active = true;
        self.chase_start_ts = now_ms;
        self.chase_last_reprice_ts = now_ms;
        self.reprices_used = 0;
        self.chase_timed_out = false;
    }

    /// Leave the chase without touching `chase_start_ts` (sticky).
    pub fn end_chase(&mut self) {
        self.chase_active = false;
    }

    // -------------------------------------------------------------------------
    // Position / episode resets
    // -------------------------------------------------------------------------

    /// Zero position fields (micro side is retained by the caller's
    /// hysteresis state, not here).
    pub fn clear_position(&mut self) {
        self.position_qty = 0.0;
        self.entry_vwap = 0.0;
        self.adds_used = 0;
    }

    /// Reset the exit episode when the position is gone or the trigger
    /// cleared.
    pub fn clear_exit_episode(&mut self) {
        self.exit_risk_active = false;
        self.exit_maker_attempts = 0;
        self.exit_taker_used = false;
    }

    pub fn clear_flip(&mut self) {
        self.flip_detected_side = None;
        self.flip_first_detected_ms = 0;
        self.flip_persistence_count = 0;
    }

    pub fn start_cooldown(&mut self, now_ms: i64, cooldown_ms: i64) {
        self.cooldown_until_ms = now_ms + cooldown_ms;
    }

    // -------------------------------------------------------------------------
    // Rolling event lists
    // -------------------------------------------------------------------------

    pub fn push_side_flip(&mut self, now_ms: i64) {
        self.side_flip_events_5m.push_back(now_ms);
        Self::prune_events(&mut self.side_flip_events_5m, now_ms);
        self.telemetry.side_flips += 1;
    }

    pub fn push_gate_true(&mut self, now_ms: i64) {
        self.gate_true_events_5m.push_back(now_ms);
        Self::prune_events(&mut self.gate_true_events_5m, now_ms);
    }

    pub fn push_entry_intent(&mut self, now_ms: i64) {
        self.entry_intent_events_5m.push_back(now_ms);
        Self::prune_events(&mut self.entry_intent_events_5m, now_ms);
    }

    fn prune_events(events: &mut VecDeque<i64>, now_ms: i64) {
        let cutoff = now_ms - EVENT_WINDOW_MS;
        while let Some(&front) = events.front() {
            if front < cutoff {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

fn median(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chase_start_ts_is_sticky_across_reprices() {
        let mut rt = OrchestratorRuntime::new(1.0);
        rt.begin_chase(1_000);
        assert_eq!(rt.chase_start_ts, 1_000);

        // Reprices touch the reprice timestamp only.
        rt.reprices_used += 1;
        rt.chase_last_reprice_ts = 3_000;
        assert_eq!(rt.chase_start_ts, 1_000);

        rt.end_chase();
        assert_eq!(rt.chase_start_ts, 1_000);

        // Only the next IDLE→CHASING edge moves it.
        rt.begin_chase(9_000);
        assert_eq!(rt.chase_start_ts, 9_000);
        assert_eq!(rt.reprices_used, 0);
    }

    #[test]
    fn ewma_smoothing_converges() {
        let mut rt = OrchestratorRuntime::new(1.0);
        rt.smooth(1.0, 10.0, 0.5, 0.4, 0.4, 5);
        // First sample seeds directly.
        assert_eq!(rt.smoothed_delta_z, 1.0);

        rt.smooth(2.0, 20.0, 0.5, 0.4, 0.4, 5);
        assert!((rt.smoothed_delta_z - (0.4 * 2.0 + 0.6 * 1.0)).abs() < 1e-12);
        assert!((rt.smoothed_obi_weighted - (0.4 * 20.0 + 0.6 * 10.0)).abs() < 1e-12);
    }

    #[test]
    fn cvd_slope_median_ignores_outliers() {
        let mut rt = OrchestratorRuntime::new(1.0);
        for x in [1.0, 1.1, 50.0, 0.9, 1.05] {
            rt.smooth(0.0, 0.0, x, 0.4, 0.4, 5);
        }
        assert!((rt.smoothed_cvd_slope - 1.05).abs() < 1e-12);
    }

    #[test]
    fn event_lists_prune_beyond_five_minutes() {
        let mut rt = OrchestratorRuntime::new(1.0);
        rt.push_gate_true(0);
        rt.push_gate_true(100_000);
        rt.push_gate_true(400_000);
        assert_eq!(rt.gate_true_events_5m.len(), 2);
    }

    #[test]
    fn clear_position_zeroes_fields() {
        let mut rt = OrchestratorRuntime::new(1.0);
        rt.side = Some(Side::Buy);
        rt.position_qty = 2.0;
        rt.entry_vwap = 100.0;
        rt.adds_used = 2;
        rt.clear_position();
        assert_eq!(rt.position_qty, 0.0);
        assert_eq!(rt.adds_used, 0);
        // Micro side is hysteresis state, not position state.
        assert_eq!(rt.side, Some(Side::Buy));
    }
}
