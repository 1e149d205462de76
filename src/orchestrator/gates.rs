// =============================================================================
// Gates — readiness, Gate A/B/C, impulse
// =============================================================================
//
// Gate A: regime & venue quality. Gate B: side-aligned flow. Gate C: micro
// placement sanity. `all_raw = readiness ∧ A ∧ B ∧ C`; the effective entry
// additionally needs the confirm count (handled by the engine).
// =============================================================================

use crate::config::EngineConfig;
use crate::orchestrator::htf::HtfVerdict;
use crate::orchestrator::OrchestratorTick;
use crate::types::Side;

/// Readiness preconditions; on failure the decision is a HOLD listing every
/// missing item.
pub fn readiness(tick: &OrchestratorTick, cfg: &EngineConfig) -> (bool, Vec<String>) {
    let mut reasons = Vec::new();

    if !tick.readiness.backfill_done {
        reasons.push("BACKFILL_PENDING".to_string());
    }
    if tick.readiness.bars_loaded_1m < cfg.min_bars_loaded {
        reasons.push(format!(
            "BARS_LOADED {}<{}",
            tick.readiness.bars_loaded_1m, cfg.min_bars_loaded
        ));
    }
    if tick.readiness.session_vwap <= 0.0 {
        reasons.push("SESSION_VWAP_MISSING".to_string());
    }
    if tick.readiness.htf_h1_bar_start.is_none() {
        reasons.push("HTF_H1_MISSING".to_string());
    }
    if tick.readiness.htf_h4_bar_start.is_none() {
        reasons.push("HTF_H4_MISSING".to_string());
    }
    if tick.prints_per_second <= cfg.min_prints_per_second {
        reasons.push(format!(
            "PRINTS_PER_SECOND {:.2}<={:.2}",
            tick.prints_per_second, cfg.min_prints_per_second
        ));
    }

    (reasons.is_empty(), reasons)
}

/// Gate A — regime & venue quality, including the HTF hard veto for the
/// candidate side.
pub fn gate_a(
    tick: &OrchestratorTick,
    cfg: &EngineConfig,
    side: Option<Side>,
    htf: &HtfVerdict,
) -> bool {
    let regime_ok = tick.trendiness >= cfg.gate_a_trendiness_min
        && tick.chop <= cfg.gate_a_chop_max
        && tick.vol_of_vol <= cfg.gate_a_vol_of_vol_max;

    let venue_ok = tick.spread_pct <= cfg.gate_a_spread_pct_max
        && tick.oi_change_pct > cfg.gate_a_oi_drop_pct;

    let htf_ok = match side {
        Some(Side::Buy) => !htf.hard_veto_buy,
        Some(Side::Sell) => !htf.hard_veto_sell,
        None => true,
    };

    regime_ok && venue_ok && htf_ok
}

/// Gate B — side-aligned flow. Fails outright without a side.
pub fn gate_b(tick: &OrchestratorTick, cfg: &EngineConfig, side: Option<Side>) -> bool {
    let side = match side {
        Some(s) => s,
        None => return false,
    };
    let sign = side.sign();

    tick.obi_deep * sign >= cfg.gate_b_obi_deep_min
        && tick.delta_z.abs() >= cfg.gate_b_delta_z_min
        && tick.cvd_slope * sign >= cfg.gate_b_cvd_slope_min
}

/// Gate C — micro placement sanity against the session VWAP and short-term
/// realized volatility.
pub fn gate_c(tick: &OrchestratorTick, cfg: &EngineConfig) -> bool {
    let vwap = tick.readiness.session_vwap;
    if vwap <= 0.0 {
        return false;
    }
    let dist = (tick.price - vwap).abs() / vwap;

    dist <= cfg.gate_c_vwap_dist_max && tick.realized_vol_1m_pct <= cfg.gate_c_vol1m_max_pct
}

/// Impulse — used only for taker-fallback eligibility.
pub fn impulse(tick: &OrchestratorTick, cfg: &EngineConfig) -> bool {
    tick.prints_per_second >= cfg.impulse_pps_min
        && tick.delta_z.abs() >= cfg.impulse_delta_z_min
        && tick.spread_pct <= 1.2 * cfg.gate_a_spread_pct_max
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::orchestrator::ReadinessInput;
    use crate::state::DeterministicState;

    pub(crate) fn ready_tick() -> OrchestratorTick {
        OrchestratorTick {
            now_ms: 1_000_000,
            price: 100.0,
            best_bid: 99.99,
            best_ask: 100.01,
            spread_pct: 0.0002,
            prints_per_second: 5.0,
            delta_z: 1.5,
            obi_weighted: 20.0,
            obi_deep: 50.0,
            cvd_slope: 1.0,
            cvd_5m: 5_000.0,
            trendiness: 0.4,
            chop: 0.2,
            vol_of_vol: 0.05,
            realized_vol_1m_pct: 0.1,
            atr_3m: 0.5,
            oi_change_pct: 0.1,
            book_integrity: 0.0,
            state: DeterministicState::default(),
            readiness: ReadinessInput {
                backfill_done: true,
                bars_loaded_1m: 500,
                session_vwap: 100.0,
                htf_h1_bar_start: Some(1),
                htf_h4_bar_start: Some(1),
            },
            dry_run_position: None,
            btc: Default::default(),
            htf: Default::default(),
        }
    }

    #[test]
    fn readiness_lists_every_missing_precondition() {
        let mut tick = ready_tick();
        tick.readiness.backfill_done = false;
        tick.readiness.bars_loaded_1m = 200;
        tick.readiness.session_vwap = 0.0;
        let (ok, reasons) = readiness(&tick, &EngineConfig::default());
        assert!(!ok);
        assert!(reasons.iter().any(|r| r == "BACKFILL_PENDING"));
        assert!(reasons.iter().any(|r| r.starts_with("BARS_LOADED")));
        assert!(reasons.iter().any(|r| r == "SESSION_VWAP_MISSING"));
    }

    #[test]
    fn readiness_passes_when_all_preconditions_met() {
        let (ok, reasons) = readiness(&ready_tick(), &EngineConfig::default());
        assert!(ok, "{reasons:?}");
    }

    #[test]
    fn gate_a_fails_on_choppy_regime() {
        let cfg = EngineConfig::default();
        let mut tick = ready_tick();
        tick.chop = 0.7;
        assert!(!gate_a(&tick, &cfg, Some(Side::Buy), &HtfVerdict::default()));
    }

    #[test]
    fn gate_a_fails_on_oi_collapse() {
        let cfg = EngineConfig::default();
        let mut tick = ready_tick();
        tick.oi_change_pct = -1.0;
        assert!(!gate_a(&tick, &cfg, Some(Side::Buy), &HtfVerdict::default()));
    }

    #[test]
    fn gate_a_respects_htf_hard_veto() {
        let cfg = EngineConfig::default();
        let tick = ready_tick();
        let htf = HtfVerdict {
            hard_veto_buy: true,
            ..Default::default()
        };
        assert!(!gate_a(&tick, &cfg, Some(Side::Buy), &htf));
        assert!(gate_a(&tick, &cfg, Some(Side::Sell), &htf));
    }

    #[test]
    fn gate_b_requires_side_aligned_flow() {
        let cfg = EngineConfig::default();
        let tick = ready_tick();
        assert!(gate_b(&tick, &cfg, Some(Side::Buy)));
        // Same flow is adverse for a SELL candidate.
        assert!(!gate_b(&tick, &cfg, Some(Side::Sell)));
        assert!(!gate_b(&tick, &cfg, None));
    }

    #[test]
    fn gate_c_bounds_vwap_distance() {
        let cfg = EngineConfig::default();
        let mut tick = ready_tick();
        tick.price = 101.0; // 1% from VWAP, limit is 0.4%
        assert!(!gate_c(&tick, &cfg));
        tick.price = 100.2;
        assert!(gate_c(&tick, &cfg));
    }

    #[test]
    fn impulse_allows_slightly_wider_spread() {
        let cfg = EngineConfig::default();
        let mut tick = ready_tick();
        tick.delta_z = 2.0;
        tick.spread_pct = cfg.gate_a_spread_pct_max * 1.1;
        assert!(impulse(&tick, &cfg));
        tick.spread_pct = cfg.gate_a_spread_pct_max * 1.3;
        assert!(!impulse(&tick, &cfg));
    }
}
