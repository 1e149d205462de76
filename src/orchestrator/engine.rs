// =============================================================================
// Orchestrator Engine — the per-tick evaluation pipeline
// =============================================================================
//
// Per tick, in order: position sync → smoothing → side selection with
// hysteresis → HTF/anchor resolution → gates & confirm counting → exits →
// add ladder → entry chase → decision assembly. Every mutation lands on the
// runtime; identical runtime + input always produces the identical decision.
// =============================================================================

use tracing::debug;

use crate::config::EngineConfig;
use crate::orchestrator::runtime::OrchestratorRuntime;
use crate::orchestrator::{
    adds, anchor, chase, exits, gates, htf, ChaseReport, Decision, GateReport, OrchestratorTick,
    PositionReport,
};
use crate::types::{Intent, Side};

pub struct Orchestrator {
    symbol: String,
    cfg: EngineConfig,
    pub runtime: OrchestratorRuntime,
}

impl Orchestrator {
    pub fn new(symbol: impl Into<String>, cfg: EngineConfig) -> Self {
        Self {
            symbol: symbol.into(),
            cfg,
            runtime: OrchestratorRuntime::new(0.0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Quarantine the symbol: no further orders until an operator clears it.
    pub fn quarantine(&mut self) {
        self.runtime.quarantined = true;
    }

    pub fn clear_quarantine(&mut self) {
        self.runtime.quarantined = false;
    }

    /// Evaluate one aggregate tick.
    pub fn evaluate(&mut self, tick: &OrchestratorTick) -> Decision {
        let cfg = &self.cfg;
        let rt = &mut self.runtime;
        let now = tick.now_ms;
        rt.telemetry.ticks += 1;

        let mut reasons: Vec<String> = Vec::new();

        if rt.quarantined {
            rt.telemetry.hold_ticks += 1;
            return hold_decision(
                &self.symbol,
                rt,
                GateReport::default(),
                vec!["QUARANTINED".to_string()],
            );
        }

        // ── 1. Position sync: the fill sink is authoritative ────────────
        match &tick.dry_run_position {
            Some(p) => {
                rt.side = Some(p.side);
                rt.position_qty = p.qty;
                rt.entry_vwap = p.entry_price;
                rt.adds_used = p.adds_used;
                // An adopted position with no recorded entry implies the sink
                // filled a base-quantity entry we did not witness.
                if rt.base_qty == 0.0 {
                    rt.base_qty = p.qty;
                }
            }
            None => {
                // Flat: zero position fields, retain the micro side.
                rt.clear_position();
                rt.clear_exit_episode();
            }
        }

        // A fill while chasing ends the chase (FILLED).
        if rt.chase_active && rt.position_open() {
            rt.end_chase();
        }

        // Refresh the base quantity against the current price while flat.
        if !rt.position_open() && tick.price > 0.0 {
            rt.base_qty = cfg.base_qty_notional / tick.price;
        }

        // ── 2. Smoothing ────────────────────────────────────────────────
        rt.smooth(
            tick.delta_z,
            tick.obi_weighted,
            tick.cvd_slope,
            cfg.smooth_alpha_delta_z,
            cfg.smooth_alpha_obi,
            cfg.cvd_median_window,
        );

        // ── 3. Raw micro candidate from the smoothed signals ────────────
        let score = cfg.side_w_delta_z * rt.smoothed_delta_z
            + cfg.side_w_cvd_slope * rt.smoothed_cvd_slope
            + cfg.side_w_obi_deep * tick.obi_deep;
        let raw_candidate = if score > 0.0 {
            Some(Side::Buy)
        } else if score < 0.0 {
            Some(Side::Sell)
        } else {
            None
        };

        // ── 4. Side hysteresis (micro side only moves while flat) ───────
        if !rt.position_open() {
            apply_side_hysteresis(rt, cfg, raw_candidate, now);
        }
        let side = rt.side;

        // ── 5. HTF verdict & cross-market anchor ────────────────────────
        let htf_verdict = htf::evaluate(&tick.htf, tick.price);
        let anchor_side = anchor::anchor_side(&tick.btc);
        let crossmarket_vetoed =
            side.map_or(false, |s| anchor::is_vetoed(&self.symbol, s, &tick.btc));
        if crossmarket_vetoed {
            rt.telemetry.crossmarket_vetoes += 1;
            reasons.push("CROSSMARKET_VETO".to_string());
        }

        // ── 6. Gates & entry confirm counting ───────────────────────────
        let (ready, readiness_reasons) = gates::readiness(tick, cfg);
        let gate_a = gates::gate_a(tick, cfg, side, &htf_verdict);
        let gate_b = gates::gate_b(tick, cfg, side);
        let gate_c = gates::gate_c(tick, cfg);
        let all_raw = ready && gate_a && gate_b && gate_c;

        if all_raw && side.is_some() {
            rt.entry_confirm_count += 1;
            rt.push_gate_true(now);
        } else {
            rt.entry_confirm_count = 0;
        }

        let soft_biased = side.map_or(false, |s| htf_verdict.soft_bias_for(s));
        let required_confirmations = cfg.entry_confirmations + u32::from(soft_biased);
        let all_gates_passed = all_raw && rt.entry_confirm_count >= required_confirmations;
        let impulse = gates::impulse(tick, cfg);

        // ── 7. Side-mismatch guard (no hedges, no one-step reversals) ───
        let position_side = if rt.position_open() { rt.side } else { None };
        let side_mismatch_blocked = matches!(
            (position_side, raw_candidate),
            (Some(p), Some(c)) if c == p.flip()
        );
        if side_mismatch_blocked {
            rt.telemetry.side_mismatch_blocks += 1;
        }

        // ── 8. Exits (highest priority while a position is open) ────────
        let exit_result = exits::step(rt, tick, cfg, &self.symbol, raw_candidate, anchor_side);

        // ── 9. Add ladder (suppressed during an exit episode) ───────────
        let add_result = if exit_result.is_none() && !rt.exit_risk_active {
            adds::step(rt, tick, cfg, &self.symbol, &htf_verdict)
        } else {
            None
        };

        // ── 10. Entry chase (flat only) ─────────────────────────────────
        let entry_allowed = all_gates_passed
            && side.is_some()
            && now >= rt.cooldown_until_ms
            && !crossmarket_vetoed
            && !side_mismatch_blocked
            && !rt.position_open();

        let chase_out = if exit_result.is_none() && !rt.position_open() {
            chase::step(
                rt,
                tick,
                cfg,
                &self.symbol,
                side,
                entry_allowed,
                all_gates_passed,
                all_raw,
                impulse,
                crossmarket_vetoed,
            )
        } else {
            chase::ChaseOutcome::default()
        };
        reasons.extend(chase_out.reasons.iter().cloned());

        // ── 11. Assemble the decision ───────────────────────────────────
        let mut orders = Vec::new();
        let mut intent = Intent::Hold;
        let mut exit_report = None;
        let mut add_report = None;

        if let Some((report, exit_orders)) = exit_result {
            intent = Intent::Exit;
            exit_report = Some(report);
            orders.extend(exit_orders);
        } else if let Some((report, add_intent)) = add_result {
            intent = Intent::Add;
            add_report = Some(report);
            orders.push(add_intent);
        } else if chase_out.entered_chase || chase_out.fell_back || !chase_out.orders.is_empty() {
            intent = Intent::Enter;
            orders.extend(chase_out.orders);
        }

        if !ready {
            reasons.extend(readiness_reasons.iter().cloned());
        }
        if intent == Intent::Hold {
            rt.telemetry.hold_ticks += 1;
        }

        debug!(
            symbol = %self.symbol,
            intent = %intent,
            side = ?side,
            all_raw,
            confirm = rt.entry_confirm_count,
            orders = orders.len(),
            "tick evaluated"
        );

        Decision {
            symbol: self.symbol.clone(),
            intent,
            side,
            gates: GateReport {
                ready,
                readiness_reasons,
                gate_a,
                gate_b,
                gate_c,
                all_raw,
                entry_confirm_count: rt.entry_confirm_count,
                required_confirmations,
                impulse,
            },
            add: add_report,
            exit_risk: exit_report,
            position: PositionReport {
                side: position_side,
                qty: rt.position_qty,
                entry_vwap: rt.entry_vwap,
                adds_used: rt.adds_used,
            },
            orders,
            chase: ChaseReport {
                active: rt.chase_active,
                start_ts: rt.chase_start_ts,
                elapsed_ms: if rt.chase_active {
                    now - rt.chase_start_ts
                } else {
                    0
                },
                reprices_used: rt.reprices_used,
                timed_out: rt.chase_timed_out,
                fallback_used: rt.taker_fallback_used,
            },
            reasons,
            telemetry: rt.telemetry.clone(),
        }
    }
}

/// Micro-side hysteresis: an opposite candidate needs N consecutive
/// confirmations plus the hold and flip-interval windows.
fn apply_side_hysteresis(
    rt: &mut OrchestratorRuntime,
    cfg: &EngineConfig,
    candidate: Option<Side>,
    now: i64,
) {
    let candidate = match candidate {
        Some(c) => c,
        None => return,
    };

    match rt.side {
        None => {
            rt.side = Some(candidate);
            rt.last_side_change_ts = now;
        }
        Some(current) if current == candidate => {
            rt.confirm_count_long = 0;
            rt.confirm_count_short = 0;
        }
        Some(_) => {
            // Confirmation streaks decay: a stale streak restarts from zero.
            if rt.last_confirm_ts > 0
                && now - rt.last_confirm_ts > cfg.direction_lock_confirm_ttl_ms
            {
                rt.confirm_count_long = 0;
                rt.confirm_count_short = 0;
            }
            rt.last_confirm_ts = now;

            let count = match candidate {
                Side::Buy => {
                    rt.confirm_count_short = 0;
                    rt.confirm_count_long += 1;
                    rt.confirm_count_long
                }
                Side::Sell => {
                    rt.confirm_count_long = 0;
                    rt.confirm_count_short += 1;
                    rt.confirm_count_short
                }
            };

            let since_change = now - rt.last_side_change_ts;
            let held_long_enough = since_change >= cfg.min_hold_ms
                && since_change >= cfg.min_flip_interval_ms
                && since_change >= cfg.direction_lock_cooldown_ms;

            if count >= cfg.consecutive_confirmations && held_long_enough {
                rt.side = Some(candidate);
                rt.last_side_change_ts = now;
                rt.confirm_count_long = 0;
                rt.confirm_count_short = 0;
                rt.entry_confirm_count = 0;
                rt.push_side_flip(now);
            }
        }
    }
}

// =============================================================================
// Tests — literal end-to-end scenarios
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::fills::SinkPosition;
    use crate::orchestrator::gates::tests::ready_tick;
    use crate::types::OrderKind;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new("ETHUSDT", EngineConfig::default())
    }

    /// A tick whose flow strongly favours BUY and passes every gate.
    fn buy_tick(now_ms: i64) -> OrchestratorTick {
        let mut tick = ready_tick();
        tick.now_ms = now_ms;
        tick
    }

    #[test]
    fn scenario_readiness_hold_then_entry() {
        let mut orch = orchestrator();

        // 10 ticks with backfill pending: all HOLD, zero orders.
        for i in 0..10i64 {
            let mut tick = buy_tick(1_000_000 + i * 1_000);
            tick.readiness.backfill_done = false;
            tick.readiness.bars_loaded_1m = 200;
            let d = orch.evaluate(&tick);
            assert_eq!(d.intent, Intent::Hold);
            assert!(d.orders.is_empty());
            assert!(d.reasons.iter().any(|r| r == "BACKFILL_PENDING"));
        }

        // Readiness restored; BUY candidates for N consecutive ticks.
        let n = EngineConfig::default().entry_confirmations as i64;
        let mut last = None;
        for i in 0..n {
            let tick = buy_tick(1_100_000 + i * 1_000);
            last = Some(orch.evaluate(&tick));
            if i < n - 1 {
                assert_eq!(last.as_ref().unwrap().intent, Intent::Hold);
            }
        }

        // On tick N: ENTRY with exactly two maker post-only layers.
        let d = last.unwrap();
        assert_eq!(d.intent, Intent::Enter);
        assert_eq!(d.orders.len(), 2);
        assert!(d
            .orders
            .iter()
            .all(|o| o.kind == OrderKind::MakerPostOnly));
    }

    #[test]
    fn scenario_chase_timeout_fallback() {
        let mut orch = orchestrator();
        let n = EngineConfig::default().entry_confirmations as i64;

        // Reach ENTRY / CHASING.
        let mut now = 1_000_000;
        for _ in 0..n {
            orch.evaluate(&buy_tick(now));
            now += 1_000;
        }
        assert!(orch.runtime.chase_active);
        let started = orch.runtime.chase_start_ts;

        // t = start + 12.5 s with impulse and raw gates true.
        let mut tick = buy_tick(started + 12_500);
        tick.delta_z = 2.0; // impulse-grade
        let d = orch.evaluate(&tick);

        let fallbacks: Vec<_> = d
            .orders
            .iter()
            .filter(|o| o.kind == OrderKind::TakerEntryFallback)
            .collect();
        assert_eq!(fallbacks.len(), 1);
        assert!((fallbacks[0].notional_pct.unwrap() - 0.25).abs() < 1e-12);
        assert_eq!(d.telemetry.chase_timed_out_count, 1);
        assert!(orch.runtime.cooldown_until_ms > tick.now_ms);

        // Subsequent ticks: the counter stays at 1.
        let d2 = orch.evaluate(&buy_tick(started + 14_000));
        assert_eq!(d2.telemetry.chase_timed_out_count, 1);
        assert!(d2
            .orders
            .iter()
            .all(|o| o.kind != OrderKind::TakerEntryFallback));
    }

    #[test]
    fn scenario_add_ladder_two_steps_max() {
        let mut orch = orchestrator();
        let atr = 10.0;

        // Seed LONG 1 @ 100 via the sink; price drops 0.55 ATR.
        let mut tick = buy_tick(2_000_000);
        tick.atr_3m = atr;
        tick.price = 94.5;
        tick.best_bid = 94.5;
        tick.best_ask = 94.52;
        tick.dry_run_position = Some(SinkPosition {
            side: Side::Buy,
            qty: 1.0,
            entry_price: 100.0,
            adds_used: 0,
            unrealized_pnl_pct: -5.5,
        });
        let d = orch.evaluate(&tick);
        assert_eq!(d.intent, Intent::Add);
        assert_eq!(d.add.as_ref().unwrap().step, 1);
        let vwap1 = orch.runtime.entry_vwap;
        let expected = (100.0 * 1.0 + 94.5 * 0.75) / 1.75;
        assert!((vwap1 - expected).abs() < 1e-9);

        // 91 s later at vwap - 1.10 ATR: ADD_2.
        let mut tick2 = buy_tick(2_000_000 + 91_000);
        tick2.atr_3m = atr;
        tick2.price = vwap1 - 1.10 * atr;
        tick2.best_bid = tick2.price;
        tick2.best_ask = tick2.price + 0.02;
        tick2.dry_run_position = Some(SinkPosition {
            side: Side::Buy,
            qty: 1.75,
            entry_price: vwap1,
            adds_used: 1,
            unrealized_pnl_pct: -10.0,
        });
        let d2 = orch.evaluate(&tick2);
        assert_eq!(d2.intent, Intent::Add);
        assert_eq!(d2.add.as_ref().unwrap().step, 2);
        let vwap2 = orch.runtime.entry_vwap;

        // Further adverse tick: never an ADD_3.
        let mut tick3 = buy_tick(2_000_000 + 200_000);
        tick3.atr_3m = atr;
        tick3.price = vwap2 - 3.0 * atr;
        tick3.best_bid = tick3.price;
        tick3.best_ask = tick3.price + 0.02;
        tick3.dry_run_position = Some(SinkPosition {
            side: Side::Buy,
            qty: 2.25,
            entry_price: vwap2,
            adds_used: 2,
            unrealized_pnl_pct: -20.0,
        });
        let d3 = orch.evaluate(&tick3);
        assert_ne!(d3.intent, Intent::Add);
        assert_eq!(orch.runtime.adds_used, 2);
    }

    #[test]
    fn scenario_exit_ladder_maker_maker_taker() {
        let mut orch = orchestrator();
        let position = SinkPosition {
            side: Side::Buy,
            qty: 1.0,
            entry_price: 100.0,
            adds_used: 0,
            unrealized_pnl_pct: 0.0,
        };

        let mut kinds = Vec::new();
        for i in 0..3i64 {
            let mut tick = buy_tick(3_000_000 + i * 1_000);
            tick.trendiness = 0.50;
            tick.chop = 0.60;
            // The sink still reports the position until the taker fill lands.
            tick.dry_run_position = Some(position.clone());
            let d = orch.evaluate(&tick);
            assert_eq!(d.intent, Intent::Exit);
            kinds.extend(d.orders.iter().map(|o| o.kind));
        }

        assert_eq!(
            kinds,
            vec![
                OrderKind::MakerExit,
                OrderKind::MakerExit,
                OrderKind::TakerRiskExit
            ]
        );
        assert!(!orch.runtime.position_open());
    }

    #[test]
    fn scenario_crossmarket_mismatch_exit() {
        let mut orch = orchestrator();
        let t0 = 4_000_000;

        let mismatch_tick = |now: i64| {
            let mut tick = buy_tick(now);
            tick.dry_run_position = Some(SinkPosition {
                side: Side::Buy,
                qty: 1.0,
                entry_price: 100.0,
                adds_used: 0,
                unrealized_pnl_pct: 0.0,
            });
            // BTC anchor SELL via aligned down-structure.
            tick.btc.h1_dn = true;
            tick.btc.h4_dn = true;
            tick.btc.hard_veto = true;
            tick
        };

        // Detection tick arms the timer.
        let d0 = orch.evaluate(&mismatch_tick(t0));
        assert_ne!(d0.intent, Intent::Exit);

        // +29 s: still holding.
        let d1 = orch.evaluate(&mismatch_tick(t0 + 29_000));
        assert_ne!(d1.intent, Intent::Exit);

        // +31 s: exit with the cross-market reason.
        let d2 = orch.evaluate(&mismatch_tick(t0 + 31_000));
        assert_eq!(d2.intent, Intent::Exit);
        assert_eq!(
            d2.exit_risk.unwrap().reason,
            crate::orchestrator::ExitReason::CrossmarketMismatch
        );
    }

    #[test]
    fn scenario_two_step_reversal_never_direct_short() {
        let mut orch = orchestrator();
        let cfg = EngineConfig::default();

        let sell_tick = |now: i64| {
            let mut tick = buy_tick(now);
            // Strong SELL flow.
            tick.delta_z = -2.0;
            tick.cvd_slope = -1.0;
            tick.obi_deep = -50.0;
            tick.obi_weighted = -20.0;
            tick.cvd_5m = -5_000.0;
            tick.dry_run_position = Some(SinkPosition {
                side: Side::Buy,
                qty: 1.0,
                entry_price: 100.0,
                adds_used: 0,
                unrealized_pnl_pct: 0.0,
            });
            tick
        };

        let t0 = 5_000_000;
        let d0 = orch.evaluate(&sell_tick(t0));
        // Never a direct ENTRY SHORT while LONG.
        assert!(d0.orders.iter().all(|o| o.kind != OrderKind::MakerPostOnly));

        let d1 = orch.evaluate(&sell_tick(t0 + cfg.min_flip_interval_ms));
        assert_eq!(d1.intent, Intent::Exit);
        assert!(d1
            .orders
            .iter()
            .all(|o| o.kind == OrderKind::MakerExit || o.kind == OrderKind::TakerRiskExit));
        assert!(d1.telemetry.side_mismatch_blocks > 0);
    }

    #[test]
    fn identical_input_and_runtime_give_identical_decisions() {
        let tick = buy_tick(1_000_000);

        let mut a = orchestrator();
        let mut b = orchestrator();
        let da = a.evaluate(&tick);
        let db = b.evaluate(&tick);

        assert_eq!(da.intent, db.intent);
        assert_eq!(da.side, db.side);
        assert_eq!(da.orders.len(), db.orders.len());
        assert_eq!(da.gates.all_raw, db.gates.all_raw);
        assert_eq!(da.gates.entry_confirm_count, db.gates.entry_confirm_count);
    }

    #[test]
    fn quarantined_symbol_emits_nothing() {
        let mut orch = orchestrator();
        orch.quarantine();
        let d = orch.evaluate(&buy_tick(1_000_000));
        assert_eq!(d.intent, Intent::Hold);
        assert!(d.orders.is_empty());
        assert!(d.reasons.iter().any(|r| r == "QUARANTINED"));
    }

    #[test]
    fn crossmarket_veto_blocks_entry_and_counts() {
        let mut orch = orchestrator();
        let n = EngineConfig::default().entry_confirmations as i64;

        let mut now = 1_000_000;
        for i in 0..=n {
            let mut tick = buy_tick(now);
            tick.btc.h1_dn = true;
            tick.btc.h4_dn = true;
            tick.btc.hard_veto = true;
            let d = orch.evaluate(&tick);
            assert!(d.orders.is_empty(), "tick {i} emitted orders");
            now += 1_000;
        }
        assert!(orch.runtime.telemetry.crossmarket_vetoes > 0);
    }
}

/// HOLD decision shell used by the quarantine path.
fn hold_decision(
    symbol: &str,
    rt: &OrchestratorRuntime,
    gates: GateReport,
    reasons: Vec<String>,
) -> Decision {
    Decision {
        symbol: symbol.to_string(),
        intent: Intent::Hold,
        side: rt.side,
        gates,
        add: None,
        exit_risk: None,
        position: PositionReport {
            side: if rt.position_open() { rt.side } else { None },
            qty: rt.position_qty,
            entry_vwap: rt.entry_vwap,
            adds_used: rt.adds_used,
        },
        orders: Vec::new(),
        chase: ChaseReport::default(),
        reasons,
        telemetry: rt.telemetry.clone(),
    }
}
