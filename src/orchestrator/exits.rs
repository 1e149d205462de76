// =============================================================================
// Exit Paths — flip, cross-market mismatch, exit-risk, and the exit ladder
// =============================================================================
//
// Priority order per tick:
//   1. EXIT_FLIP            — 2-step reversal against the position
//   2. CROSSMARKET_MISMATCH — position against the BTC anchor for persist_ms
//   3. EXIT_RISK            — integrity / regime / flow-flip conditions
//
// All paths share one ladder: up to N passive exits at the opposing touch,
// then exactly one taker market exit per episode. The taker closes the
// position and starts the re-entry cooldown.
// =============================================================================

use crate::config::EngineConfig;
use crate::orchestrator::runtime::OrchestratorRuntime;
use crate::orchestrator::{ExitReason, ExitReport, OrchestratorTick};
use crate::types::{OrderIntent, OrderKind, Side};

/// Detect the highest-priority exit trigger, if any. Mutates the persistence
/// trackers (flip, cross-market) as a side effect.
fn detect(
    rt: &mut OrchestratorRuntime,
    tick: &OrchestratorTick,
    cfg: &EngineConfig,
    raw_candidate: Option<Side>,
    anchor: Option<Side>,
) -> Option<ExitReason> {
    let side = rt.side?;
    let now = tick.now_ms;

    // ── 1. Two-step reversal ────────────────────────────────────────────
    if raw_candidate == Some(side.flip()) {
        let candidate = side.flip();
        if rt.flip_detected_side != Some(candidate) {
            rt.flip_detected_side = Some(candidate);
            rt.flip_first_detected_ms = now;
            rt.flip_persistence_count = 1;
        } else {
            rt.flip_persistence_count += 1;
        }

        if rt.flip_persistence_count >= cfg.entry_confirmations
            && now - rt.flip_first_detected_ms >= cfg.min_flip_interval_ms
        {
            return Some(ExitReason::ExitFlip);
        }
    } else {
        rt.clear_flip();
    }

    // ── 2. Cross-market mismatch ────────────────────────────────────────
    if anchor == Some(side.flip()) {
        if rt.crossmarket_mismatch_since_ms == 0 {
            rt.crossmarket_mismatch_since_ms = now;
        } else if now - rt.crossmarket_mismatch_since_ms >= cfg.crossmarket_persist_ms {
            return Some(ExitReason::CrossmarketMismatch);
        }
    } else {
        rt.crossmarket_mismatch_since_ms = 0;
    }

    // ── 3. Exit-risk conditions ─────────────────────────────────────────
    if tick.book_integrity > cfg.integrity_exit_threshold {
        return Some(ExitReason::Integrity);
    }

    if tick.trendiness < cfg.exit_trendiness_min || tick.chop > cfg.exit_chop_max {
        return Some(ExitReason::Regime);
    }

    let sign = side.sign();
    let cvd_opposing = tick.cvd_5m * sign < 0.0;
    let obi_adverse = tick.obi_weighted * sign <= -cfg.exit_flow_obi_min;
    let dz_adverse = tick.delta_z * sign <= -cfg.exit_flow_delta_z_min;
    if cvd_opposing && obi_adverse && dz_adverse {
        return Some(ExitReason::FlowFlip);
    }

    None
}

/// Evaluate exits for this tick. Returns the report and the orders to emit
/// (empty when no trigger, or when the ladder is exhausted for the episode).
pub fn step(
    rt: &mut OrchestratorRuntime,
    tick: &OrchestratorTick,
    cfg: &EngineConfig,
    symbol: &str,
    raw_candidate: Option<Side>,
    anchor: Option<Side>,
) -> Option<(ExitReport, Vec<OrderIntent>)> {
    if !rt.position_open() {
        // No position: any stale episode state is cleared.
        rt.clear_exit_episode();
        rt.clear_flip();
        rt.crossmarket_mismatch_since_ms = 0;
        return None;
    }

    let reason = detect(rt, tick, cfg, raw_candidate, anchor)?;
    let side = rt.side?;
    let exit_side = side.flip();
    rt.exit_risk_active = true;

    let mut orders = Vec::new();

    if rt.exit_maker_attempts < cfg.exit_maker_attempts {
        // Passive exit at the opposing touch.
        let price = match exit_side {
            Side::Sell => tick.best_ask,
            Side::Buy => tick.best_bid,
        };
        orders.push(OrderIntent::new(
            symbol,
            exit_side,
            OrderKind::MakerExit,
            Some(price),
            rt.position_qty,
            reason.as_str(),
        ));
        rt.exit_maker_attempts += 1;
        rt.telemetry.maker_exits_emitted += 1;
    } else if !rt.exit_taker_used {
        // Ladder exhausted: a single taker closes the episode.
        orders.push(OrderIntent::new(
            symbol,
            exit_side,
            OrderKind::TakerRiskExit,
            None,
            rt.position_qty,
            format!("{}_TAKER", reason.as_str()),
        ));
        rt.exit_taker_used = true;
        rt.telemetry.taker_exits_emitted += 1;

        let cooldown_ms = cfg.reentry_cooldown_bars as i64 * cfg.bar_interval_ms;
        rt.clear_position();
        rt.start_cooldown(tick.now_ms, cooldown_ms);
    }

    Some((
        ExitReport {
            reason,
            maker_attempts: rt.exit_maker_attempts,
            taker_used: rt.exit_taker_used,
        },
        orders,
    ))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::gates::tests::ready_tick;

    fn long_runtime() -> OrchestratorRuntime {
        let mut rt = OrchestratorRuntime::new(1.0);
        rt.side = Some(Side::Buy);
        rt.position_qty = 1.5;
        rt.entry_vwap = 100.0;
        rt
    }

    #[test]
    fn regime_breakdown_runs_maker_maker_taker_ladder() {
        let cfg = EngineConfig::default();
        let mut rt = long_runtime();
        let mut tick = ready_tick();
        tick.trendiness = 0.50;
        tick.chop = 0.60; // above exit_chop_max

        // Tick 1 and 2: passive exits.
        for expected_attempts in 1..=2u32 {
            let (report, orders) =
                step(&mut rt, &tick, &cfg, "ETHUSDT", None, None).expect("exit trigger");
            assert_eq!(report.reason, ExitReason::Regime);
            assert_eq!(orders.len(), 1);
            assert_eq!(orders[0].kind, OrderKind::MakerExit);
            assert_eq!(orders[0].side, Side::Sell);
            assert_eq!(rt.exit_maker_attempts, expected_attempts);
            tick.now_ms += 1_000;
        }

        // Tick 3: the taker closes it.
        let (report, orders) =
            step(&mut rt, &tick, &cfg, "ETHUSDT", None, None).expect("taker tick");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].kind, OrderKind::TakerRiskExit);
        assert!(report.taker_used);
        assert!(!rt.position_open());
        assert!(rt.cooldown_until_ms > tick.now_ms);
        assert_eq!(rt.telemetry.taker_exits_emitted, 1);
    }

    #[test]
    fn at_most_one_taker_per_episode() {
        let cfg = EngineConfig::default();
        let mut rt = long_runtime();
        let mut tick = ready_tick();
        tick.chop = 0.9;

        for _ in 0..3 {
            step(&mut rt, &tick, &cfg, "ETHUSDT", None, None);
            tick.now_ms += 1_000;
        }
        assert_eq!(rt.telemetry.taker_exits_emitted, 1);

        // Position is closed; further ticks produce nothing.
        assert!(step(&mut rt, &tick, &cfg, "ETHUSDT", None, None).is_none());
        assert_eq!(rt.telemetry.taker_exits_emitted, 1);
    }

    #[test]
    fn two_step_reversal_requires_persistence_and_interval() {
        let cfg = EngineConfig::default();
        let mut rt = long_runtime();
        let mut tick = ready_tick();

        // First opposite candidate: tracked, no exit.
        assert!(step(&mut rt, &tick, &cfg, "ETHUSDT", Some(Side::Sell), None).is_none());
        assert_eq!(rt.flip_persistence_count, 1);

        // Second candidate but too soon: still no exit.
        tick.now_ms += 1_000;
        assert!(step(&mut rt, &tick, &cfg, "ETHUSDT", Some(Side::Sell), None).is_none());

        // Beyond the flip interval: EXIT_FLIP fires.
        tick.now_ms += cfg.min_flip_interval_ms;
        let (report, orders) =
            step(&mut rt, &tick, &cfg, "ETHUSDT", Some(Side::Sell), None).expect("flip");
        assert_eq!(report.reason, ExitReason::ExitFlip);
        // A flip exits first; it never emits an opposite-side ENTRY.
        assert!(orders.iter().all(|o| o.kind == OrderKind::MakerExit));
    }

    #[test]
    fn aligned_candidate_clears_flip_tracking() {
        let cfg = EngineConfig::default();
        let mut rt = long_runtime();
        let tick = ready_tick();

        step(&mut rt, &tick, &cfg, "ETHUSDT", Some(Side::Sell), None);
        assert_eq!(rt.flip_persistence_count, 1);
        step(&mut rt, &tick, &cfg, "ETHUSDT", Some(Side::Buy), None);
        assert_eq!(rt.flip_persistence_count, 0);
    }

    #[test]
    fn crossmarket_mismatch_needs_persistence_window() {
        let cfg = EngineConfig::default(); // persist 30 s
        let mut rt = long_runtime();
        let mut tick = ready_tick();
        let t0 = tick.now_ms;

        // Detection tick: arms the timer only.
        assert!(step(&mut rt, &tick, &cfg, "ETHUSDT", None, Some(Side::Sell)).is_none());
        assert_eq!(rt.crossmarket_mismatch_since_ms, t0);

        // 29 s later: still holding.
        tick.now_ms = t0 + 29_000;
        assert!(step(&mut rt, &tick, &cfg, "ETHUSDT", None, Some(Side::Sell)).is_none());

        // 31 s later: exit fires with the cross-market reason.
        tick.now_ms = t0 + 31_000;
        let (report, _) =
            step(&mut rt, &tick, &cfg, "ETHUSDT", None, Some(Side::Sell)).expect("mismatch");
        assert_eq!(report.reason, ExitReason::CrossmarketMismatch);
    }

    #[test]
    fn anchor_agreement_resets_mismatch_timer() {
        let cfg = EngineConfig::default();
        let mut rt = long_runtime();
        let mut tick = ready_tick();

        step(&mut rt, &tick, &cfg, "ETHUSDT", None, Some(Side::Sell));
        assert!(rt.crossmarket_mismatch_since_ms > 0);

        tick.now_ms += 5_000;
        step(&mut rt, &tick, &cfg, "ETHUSDT", None, Some(Side::Buy));
        assert_eq!(rt.crossmarket_mismatch_since_ms, 0);
    }

    #[test]
    fn integrity_breach_exits_immediately() {
        let cfg = EngineConfig::default();
        let mut rt = long_runtime();
        let mut tick = ready_tick();
        tick.book_integrity = 0.8;

        let (report, _) = step(&mut rt, &tick, &cfg, "ETHUSDT", None, None).expect("integrity");
        assert_eq!(report.reason, ExitReason::Integrity);
    }

    #[test]
    fn flow_flip_requires_all_three_adverse_signals() {
        let cfg = EngineConfig::default();
        let mut rt = long_runtime();
        let mut tick = ready_tick();
        tick.cvd_5m = -1_000.0;
        tick.obi_weighted = -20.0;
        tick.delta_z = -1.5;

        let (report, _) = step(&mut rt, &tick, &cfg, "ETHUSDT", None, None).expect("flow flip");
        assert_eq!(report.reason, ExitReason::FlowFlip);

        // Withdraw one leg: no exit.
        let mut rt2 = long_runtime();
        tick.obi_weighted = 5.0;
        assert!(step(&mut rt2, &tick, &cfg, "ETHUSDT", None, None).is_none());
    }

    #[test]
    fn healthy_position_produces_no_exit() {
        let cfg = EngineConfig::default();
        let mut rt = long_runtime();
        let tick = ready_tick();
        assert!(step(&mut rt, &tick, &cfg, "ETHUSDT", None, None).is_none());
    }
}
