// =============================================================================
// Add Ladder — ATR-stepped scale-ins while a position is open
// =============================================================================
//
// At most two adds. Step `s` arms at `entry_vwap ∓ step_atr[s] · atr_3m`
// (below for longs, above for shorts) and fires only with the minimum spacing
// elapsed, side-aligned flow, and Gate A intact. The running entry VWAP is
// re-averaged with the add's fill.
// =============================================================================

use crate::config::EngineConfig;
use crate::orchestrator::gates;
use crate::orchestrator::htf::HtfVerdict;
use crate::orchestrator::runtime::OrchestratorRuntime;
use crate::orchestrator::{AddReport, OrchestratorTick};
use crate::types::{OrderIntent, OrderKind, Side};

/// Evaluate the ladder; emits at most one add per tick.
pub fn step(
    rt: &mut OrchestratorRuntime,
    tick: &OrchestratorTick,
    cfg: &EngineConfig,
    symbol: &str,
    htf: &HtfVerdict,
) -> Option<(AddReport, OrderIntent)> {
    if !rt.position_open() {
        return None;
    }
    let side = rt.side?;

    let max_adds = cfg.dca_max_count.min(cfg.pyramid_max_count).min(2);
    if rt.adds_used >= max_adds {
        return None;
    }

    let next_step = rt.adds_used + 1;
    let (atr_multiple, qty_factor) = match next_step {
        1 => (cfg.add1_atr_multiple, cfg.add1_qty_factor),
        _ => (cfg.add2_atr_multiple, cfg.add2_qty_factor),
    };

    if tick.atr_3m <= 0.0 {
        return None;
    }

    let threshold_price = rt.entry_vwap - side.sign() * atr_multiple * tick.atr_3m;
    let crossed = match side {
        Side::Buy => tick.price <= threshold_price,
        Side::Sell => tick.price >= threshold_price,
    };
    if !crossed {
        return None;
    }

    if tick.now_ms - rt.last_add_ts < cfg.add_min_interval_ms {
        return None;
    }

    // Side-aligned flow: the book and tape must still favour the position.
    let sign = side.sign();
    let flow_ok = tick.obi_deep * sign >= cfg.add_obi_min
        && tick.cvd_slope * sign >= cfg.add_cvd_slope_min
        && tick.oi_change_pct >= cfg.add_oi_min_pct;
    if !flow_ok {
        return None;
    }

    if !gates::gate_a(tick, cfg, Some(side), htf) {
        return None;
    }

    // Fire: passive add at the touch.
    let fill_price = match side {
        Side::Buy => tick.best_bid,
        Side::Sell => tick.best_ask,
    };
    let qty = rt.base_qty * qty_factor;

    let intent = OrderIntent::new(
        symbol,
        side,
        OrderKind::MakerPostOnly,
        Some(fill_price),
        qty,
        format!("ADD_{next_step}"),
    );

    // Re-average the running entry VWAP with the assumed fill.
    let prev_qty = rt.position_qty;
    let total = prev_qty + qty;
    rt.entry_vwap = (rt.entry_vwap * prev_qty + fill_price * qty) / total;
    rt.position_qty = total;
    rt.adds_used = next_step;
    rt.last_add_ts = tick.now_ms;
    rt.telemetry.adds_emitted += 1;

    Some((
        AddReport {
            step: next_step,
            threshold_price,
            qty,
        },
        intent,
    ))
}
