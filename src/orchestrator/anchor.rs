// =============================================================================
// Cross-Market Anchor — BTC-derived directional bias for altcoin entries
// =============================================================================
//
// BTC bias is LONG only when both H1 and H4 structures point up with no
// opposing break, SHORT symmetrically. When structure is neutral but BTC
// itself holds a position, the position side anchors. The anchor is never
// applied to the BTC symbol itself.
// =============================================================================

use crate::orchestrator::CrossMarketContext;
use crate::types::Side;

/// Resolve the anchor side from the BTC context, if any.
pub fn anchor_side(btc: &CrossMarketContext) -> Option<Side> {
    let long = btc.h1_up && btc.h4_up && !btc.h1_dn && !btc.h4_dn;
    let short = btc.h1_dn && btc.h4_dn && !btc.h1_up && !btc.h4_up;

    if long {
        Some(Side::Buy)
    } else if short {
        Some(Side::Sell)
    } else {
        btc.btc_position_side
    }
}

/// Whether `candidate` on `symbol` is vetoed by the anchor in hard-veto mode.
pub fn is_vetoed(symbol: &str, candidate: Side, btc: &CrossMarketContext) -> bool {
    if !btc.hard_veto || symbol.starts_with("BTC") {
        return false;
    }
    match anchor_side(btc) {
        Some(anchor) => candidate == anchor.flip(),
        None => false,
    }
}
