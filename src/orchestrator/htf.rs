// =============================================================================
// HTF Filter — higher-timeframe structure veto and soft bias
// =============================================================================
//
// Hard veto: a broken structure against the candidate (break down vetoes
// BUY, break up vetoes SELL) fails Gate A outright.
//
// Soft bias: price at or beyond an intact swing level biases entries in that
// direction but demands one extra entry confirmation.
// =============================================================================

use serde::Serialize;

use crate::orchestrator::HtfInputs;
use crate::types::Side;

/// Resolved HTF verdict for the current tick.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HtfVerdict {
    pub hard_veto_buy: bool,
    pub hard_veto_sell: bool,
    pub soft_bias_buy: bool,
    pub soft_bias_sell: bool,
}

impl HtfVerdict {
    /// Whether the candidate side is under soft bias (needs +1 confirmation).
    pub fn soft_bias_for(&self, side: Side) -> bool {
        match side {
            Side::Buy => self.soft_bias_buy,
            Side::Sell => self.soft_bias_sell,
        }
    }
}

/// Evaluate the HTF inputs against the current price.
pub fn evaluate(htf: &HtfInputs, price: f64) -> HtfVerdict {
    let hard_veto_buy = htf.structure_break_dn;
    let hard_veto_sell = htf.structure_break_up;

    let soft_bias_buy =
        !htf.structure_break_dn && htf.swing_low > 0.0 && price <= htf.swing_low;
    let soft_bias_sell =
        !htf.structure_break_up && htf.swing_high > 0.0 && price >= htf.swing_high;

    HtfVerdict {
        hard_veto_buy,
        hard_veto_sell,
        soft_bias_buy,
        soft_bias_sell,
    }
}
