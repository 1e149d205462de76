// =============================================================================
// Entry Chase — bounded-time maker pursuit with taker fallback
// =============================================================================
//
// IDLE → CHASING → (FILLED | TIMED_OUT → FALLBACK | ABORTED)
//
// The chase start timestamp is sticky: written on the IDLE→CHASING edge only,
// never by reprices, so the time budget cannot be extended by activity.
// Timeout fires exactly once per chase; the taker fallback is capped at a
// 0.25 notional fraction and is used at most once per chase.
// =============================================================================

use crate::config::EngineConfig;
use crate::orchestrator::runtime::OrchestratorRuntime;
use crate::orchestrator::OrchestratorTick;
use crate::types::{OrderIntent, OrderKind, Side};

/// What the chase did this tick.
#[derive(Debug, Default)]
pub struct ChaseOutcome {
    pub orders: Vec<OrderIntent>,
    pub entered_chase: bool,
    pub fell_back: bool,
    pub aborted: bool,
    pub reasons: Vec<String>,
}

/// Price of the passive layer at depth `layer` (0 = at touch).
fn maker_price(tick: &OrchestratorTick, side: Side, layer: u32) -> f64 {
    let best = match side {
        Side::Buy => tick.best_bid,
        Side::Sell => tick.best_ask,
    };
    if layer == 0 {
        best
    } else {
        // Second layer sits a quarter-spread behind the touch.
        best * (1.0 - side.sign() * 0.25 * tick.spread_pct)
    }
}

fn maker_layer(
    symbol: &str,
    tick: &OrchestratorTick,
    side: Side,
    layer: u32,
    qty: f64,
    ttl_ms: i64,
    reason: &str,
) -> OrderIntent {
    let mut intent = OrderIntent::new(
        symbol,
        side,
        OrderKind::MakerPostOnly,
        Some(maker_price(tick, side, layer)),
        qty,
        reason,
    );
    intent.ttl_ms = Some(ttl_ms);
    intent
}

/// Advance the chase state machine one tick.
#[allow(clippy::too_many_arguments)]
pub fn step(
    rt: &mut OrchestratorRuntime,
    tick: &OrchestratorTick,
    cfg: &EngineConfig,
    symbol: &str,
    side: Option<Side>,
    entry_allowed: bool,
    all_gates_passed: bool,
    all_gates_raw: bool,
    impulse: bool,
    vetoed: bool,
) -> ChaseOutcome {
    let mut out = ChaseOutcome::default();
    let now = tick.now_ms;
    let cooldown_ms = cfg.reentry_cooldown_bars as i64 * cfg.bar_interval_ms;

    if !rt.chase_active {
        // ── IDLE ────────────────────────────────────────────────────────
        let side = match side {
            Some(s) if entry_allowed => s,
            _ => return out,
        };

        rt.begin_chase(now);
        out.entered_chase = true;

        let layer_qty = rt.base_qty * cfg.chase_layer_notional_pct;
        out.orders.push(maker_layer(
            symbol, tick, side, 0, layer_qty, cfg.chase_ttl_ms, "ENTRY_CHASE_L0",
        ));
        out.orders.push(maker_layer(
            symbol, tick, side, 1, layer_qty, cfg.chase_ttl_ms, "ENTRY_CHASE_L1",
        ));

        rt.push_entry_intent(now);
        rt.telemetry.entries_emitted += 1;
        return out;
    }

    // ── CHASING ─────────────────────────────────────────────────────────
    let elapsed = now - rt.chase_start_ts;
    if elapsed > rt.telemetry.max_chase_elapsed_ms {
        rt.telemetry.max_chase_elapsed_ms = elapsed;
    }

    let budget_spent =
        elapsed >= cfg.chase_max_seconds * 1_000 || rt.reprices_used >= cfg.chase_max_reprices;

    if budget_spent {
        // ── CHASE_TIMED_OUT (fires exactly once) ────────────────────────
        if !rt.chase_timed_out {
            rt.chase_timed_out = true;
            rt.telemetry.chase_timed_out_count += 1;
        }

        let fallback_eligible = impulse && all_gates_raw;
        if fallback_eligible && !rt.taker_fallback_used {
            if let Some(side) = side {
                let notional_pct = cfg.max_fallback_notional_pct.min(0.25);
                let mut intent = OrderIntent::new(
                    symbol,
                    side,
                    OrderKind::TakerEntryFallback,
                    None,
                    rt.base_qty,
                    "CHASE_TIMEOUT_FALLBACK",
                );
                intent.notional_pct = Some(notional_pct);
                out.orders.push(intent);
                out.fell_back = true;

                rt.taker_fallback_used = true;
                rt.telemetry.taker_fallbacks += 1;

                // Seed the position; the fill sink confirms next tick.
                rt.side = Some(side);
                rt.position_qty = rt.base_qty;
                rt.entry_vwap = tick.price;
            }
        } else if !fallback_eligible {
            out.reasons.push(
                if impulse {
                    "FALLBACK_SKIPPED GATES_FALSE"
                } else {
                    "FALLBACK_SKIPPED IMPULSE_FALSE"
                }
                .to_string(),
            );
        }

        rt.end_chase();
        rt.start_cooldown(now, cooldown_ms);
        return out;
    }

    if !all_gates_passed || vetoed {
        // ── ABORTED ─────────────────────────────────────────────────────
        rt.end_chase();
        rt.start_cooldown(now, cooldown_ms);
        rt.telemetry.aborted_chases += 1;
        out.aborted = true;
        out.reasons.push("CHASE_ABORTED".to_string());
        return out;
    }

    if now - rt.chase_last_reprice_ts >= cfg.chase_reprice_ms {
        // ── Reprice: fresh maker layer, start ts untouched ──────────────
        if let Some(side) = side {
            let layer_qty = rt.base_qty * cfg.chase_layer_notional_pct;
            out.orders.push(maker_layer(
                symbol, tick, side, 0, layer_qty, cfg.chase_ttl_ms, "ENTRY_CHASE_REPRICE",
            ));
            rt.reprices_used += 1;
            rt.chase_last_reprice_ts = now;
        }
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::gates::tests::ready_tick;

    fn rt() -> OrchestratorRuntime {
        OrchestratorRuntime::new(1.0)
    }

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn idle_entry_emits_two_maker_layers() {
        let mut rt = rt();
        let tick = ready_tick();
        let out = step(
            &mut rt, &tick, &cfg(), "ETHUSDT",
            Some(Side::Buy), true, true, true, false, false,
        );
        assert!(out.entered_chase);
        assert_eq!(out.orders.len(), 2);
        assert!(out.orders.iter().all(|o| o.kind == OrderKind::MakerPostOnly));
        assert_eq!(out.orders[0].price, Some(tick.best_bid));
        // Second layer sits behind the touch for a BUY.
        assert!(out.orders[1].price.unwrap() < tick.best_bid);
        assert!(rt.chase_active);
        assert_eq!(rt.chase_start_ts, tick.now_ms);
    }

    #[test]
    fn idle_without_permission_stays_idle() {
        let mut rt = rt();
        let out = step(
            &mut rt, &ready_tick(), &cfg(), "ETHUSDT",
            Some(Side::Buy), false, true, true, false, false,
        );
        assert!(out.orders.is_empty());
        assert!(!rt.chase_active);
    }

    #[test]
    fn reprice_does_not_move_start_ts() {
        let mut rt = rt();
        let mut tick = ready_tick();
        step(&mut rt, &tick, &cfg(), "ETHUSDT", Some(Side::Buy), true, true, true, false, false);
        let started = rt.chase_start_ts;

        tick.now_ms += 2_000;
        let out = step(
            &mut rt, &tick, &cfg(), "ETHUSDT",
            Some(Side::Buy), true, true, true, false, false,
        );
        assert_eq!(out.orders.len(), 1);
        assert_eq!(rt.reprices_used, 1);
        assert_eq!(rt.chase_start_ts, started);
    }

    #[test]
    fn timeout_with_impulse_emits_single_capped_fallback() {
        let mut rt = rt();
        let mut tick = ready_tick();
        step(&mut rt, &tick, &cfg(), "ETHUSDT", Some(Side::Buy), true, true, true, false, false);

        tick.now_ms += 12_500;
        let out = step(
            &mut rt, &tick, &cfg(), "ETHUSDT",
            Some(Side::Buy), true, true, true, true, false,
        );
        assert!(out.fell_back);
        assert_eq!(out.orders.len(), 1);
        let fallback = &out.orders[0];
        assert_eq!(fallback.kind, OrderKind::TakerEntryFallback);
        assert!(fallback.notional_pct.unwrap() <= 0.25);
        assert_eq!(rt.telemetry.chase_timed_out_count, 1);
        assert!(!rt.chase_active);
        assert!(rt.cooldown_until_ms > tick.now_ms);
        // Position seeded at base qty.
        assert_eq!(rt.position_qty, rt.base_qty);

        // Subsequent ticks do not re-fire the timeout.
        tick.now_ms += 1_000;
        let out2 = step(
            &mut rt, &tick, &cfg(), "ETHUSDT",
            Some(Side::Buy), false, true, true, true, false,
        );
        assert!(out2.orders.is_empty());
        assert_eq!(rt.telemetry.chase_timed_out_count, 1);
    }

    #[test]
    fn timeout_without_impulse_records_reason_and_cools_down() {
        let mut rt = rt();
        let mut tick = ready_tick();
        step(&mut rt, &tick, &cfg(), "ETHUSDT", Some(Side::Buy), true, true, true, false, false);

        tick.now_ms += 13_000;
        let out = step(
            &mut rt, &tick, &cfg(), "ETHUSDT",
            Some(Side::Buy), true, true, true, false, false,
        );
        assert!(!out.fell_back);
        assert!(out.reasons.iter().any(|r| r.contains("IMPULSE_FALSE")));
        assert!(!rt.chase_active);
        assert!(!rt.taker_fallback_used);
    }

    #[test]
    fn reprice_budget_exhaustion_counts_as_timeout() {
        let mut rt = rt();
        let mut tick = ready_tick();
        let cfg = cfg();
        step(&mut rt, &tick, &cfg, "ETHUSDT", Some(Side::Buy), true, true, true, false, false);

        // Burn through the reprice budget.
        for _ in 0..cfg.chase_max_reprices {
            tick.now_ms += cfg.chase_reprice_ms;
            step(&mut rt, &tick, &cfg, "ETHUSDT", Some(Side::Buy), true, true, true, false, false);
        }
        assert_eq!(rt.reprices_used, cfg.chase_max_reprices);

        tick.now_ms += cfg.chase_reprice_ms;
        step(&mut rt, &tick, &cfg, "ETHUSDT", Some(Side::Buy), true, true, true, false, false);
        assert_eq!(rt.telemetry.chase_timed_out_count, 1);
    }

    #[test]
    fn gates_dropping_aborts_with_cooldown() {
        let mut rt = rt();
        let mut tick = ready_tick();
        step(&mut rt, &tick, &cfg(), "ETHUSDT", Some(Side::Buy), true, true, true, false, false);

        tick.now_ms += 1_000;
        let out = step(
            &mut rt, &tick, &cfg(), "ETHUSDT",
            Some(Side::Buy), false, false, false, false, false,
        );
        assert!(out.aborted);
        assert!(!rt.chase_active);
        assert!(rt.cooldown_until_ms > tick.now_ms);
        assert_eq!(rt.telemetry.aborted_chases, 1);
    }
}
