// =============================================================================
// Risk Governor — post-policy guardrails that rewrite intent
// =============================================================================
//
// Runs after the orchestrator/advisor and before intents become orders. Rules
// apply in a fixed order; every rewrite appends a reason code. The governor
// only ever narrows what would be done — under hard risk the final size
// multiplier never exceeds max(1, policy multiplier).
//
// Units: all unrealized/realized PnL inputs are PERCENT (+1.5 ≡ +1.5 %),
// never fractions.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::config::EngineConfig;
use crate::fills::SinkPosition;
use crate::state::{DeterministicState, ExecutionState, ToxicityState};
use crate::types::{Intent, Side};

/// Policy under review: the advisor's output, or the orchestrator's own
/// intent wrapped with a unit multiplier when the advisor is disabled.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput {
    pub intent: Intent,
    pub side: Option<Side>,
    pub risk_multiplier: f64,
    pub confidence: f64,
}

impl PolicyInput {
    pub fn hold_fallback() -> Self {
        Self {
            intent: Intent::Hold,
            side: None,
            risk_multiplier: 1.0,
            confidence: 0.0,
        }
    }
}

/// Account and market facts the rules read.
#[derive(Debug, Clone, Copy)]
pub struct GovernorSnapshot {
    pub position: Option<SinkPosition>,
    /// |position| in quote units.
    pub current_notional: f64,
    pub equity: f64,
    pub day_start_equity: f64,
    /// Micro trend direction, used by the counter-trend guard.
    pub trend_side: Option<Side>,
    pub trendiness: f64,
    /// Absolute multi-signal score backing the candidate (0..1).
    pub signal_score: f64,
    /// Hard liquidation-risk flag from the derivatives classifier.
    pub hard_liq_risk: bool,
}

/// The governor's verdict.
#[derive(Debug, Clone, Serialize)]
pub struct GovernedDecision {
    pub intent: Intent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    pub risk_multiplier: f64,
    pub reasons: Vec<String>,
}

pub struct RiskGovernor {
    cfg: EngineConfig,
}

impl RiskGovernor {
    pub fn new(cfg: EngineConfig) -> Self {
        Self { cfg }
    }

    /// Apply the guardrails in order.
    pub fn govern(
        &self,
        policy: PolicyInput,
        state: &DeterministicState,
        snap: &GovernorSnapshot,
    ) -> GovernedDecision {
        let cfg = &self.cfg;
        let mut intent = policy.intent;
        let mut side = policy.side;
        let mut multiplier = policy.risk_multiplier;
        let mut reasons: Vec<String> = Vec::new();

        // ── 1. Hard conditions ──────────────────────────────────────────
        let hard_risk = state.expected_slippage_bps >= cfg.slippage_hard_bps
            || state.toxicity == ToxicityState::Toxic
            || state.volatility_percentile >= cfg.vol_hard_limit_pct
            || snap.hard_liq_risk;

        if hard_risk {
            reasons.push("HARD_RISK".to_string());
            match &snap.position {
                Some(pos) => {
                    intent = Intent::Reduce;
                    side = Some(pos.side);
                    multiplier = cfg.reduce_pct;
                }
                None => {
                    intent = Intent::Hold;
                    side = None;
                }
            }
        }

        // ── 2. Daily loss cap ───────────────────────────────────────────
        if snap.day_start_equity > 0.0 {
            let day_pnl_pct =
                (snap.equity - snap.day_start_equity) / snap.day_start_equity * 100.0;
            if day_pnl_pct <= -cfg.max_daily_loss_pct {
                reasons.push(format!("DAILY_LOSS_CAP {day_pnl_pct:.2}%"));
                if snap.position.is_some() {
                    intent = Intent::Reduce;
                    side = snap.position.map(|p| p.side);
                    multiplier = multiplier.min(cfg.reduce_pct);
                } else {
                    intent = Intent::Hold;
                    side = None;
                }
            }
        }

        // ── 3. Unhealthy execution blocks new exposure ──────────────────
        if matches!(intent, Intent::Enter | Intent::Add)
            && state.execution != ExecutionState::Healthy
        {
            reasons.push("EXECUTION_UNHEALTHY".to_string());
            intent = Intent::Hold;
        }

        // ── 4. ENTER preconditions ──────────────────────────────────────
        if intent == Intent::Enter {
            if snap.position.is_some() {
                reasons.push("ENTER_NOT_FLAT".to_string());
                intent = Intent::Hold;
            } else if cfg.max_position_notional <= 0.0 {
                reasons.push("NO_NOTIONAL_LIMIT".to_string());
                intent = Intent::Hold;
            } else if let (Some(candidate), Some(trend)) = (side, snap.trend_side) {
                // Counter-trend guard: fading a firm trend needs a clearly
                // superior signal score.
                let firm_trend = snap.trendiness >= cfg.gate_a_trendiness_min * 1.5;
                let score_gap_ok =
                    snap.signal_score >= cfg.state_confidence_threshold + 0.25;
                if candidate == trend.flip() && firm_trend && !score_gap_ok {
                    reasons.push("COUNTER_TREND".to_string());
                    intent = Intent::Hold;
                }
            }
        }

        // ── 5. ADD exposure ceiling ─────────────────────────────────────
        if intent == Intent::Add {
            let max_exposure = cfg.max_position_notional * cfg.max_exposure_multiplier;
            let same_side =
                matches!((&snap.position, side), (Some(p), Some(s)) if p.side == s);
            if !same_side {
                reasons.push("ADD_WITHOUT_SAME_SIDE_POSITION".to_string());
                intent = Intent::Hold;
            } else if snap.current_notional >= max_exposure {
                reasons.push("EXPOSURE_LIMIT".to_string());
                intent = Intent::Hold;
            }
        }

        // ── 6. Notional floor protect ───────────────────────────────────
        if intent == Intent::Reduce
            && !hard_risk
            && snap.current_notional <= cfg.max_position_notional
        {
            reasons.push("NOTIONAL_FLOOR".to_string());
            intent = Intent::Hold;
        }

        // ── 7. Loser-realize block (optional) ───────────────────────────
        if cfg.block_loser_realize
            && !hard_risk
            && matches!(intent, Intent::Reduce | Intent::Exit)
        {
            if let Some(pos) = &snap.position {
                if pos.unrealized_pnl_pct < 0.0 {
                    reasons.push("LOSER_REALIZE_BLOCKED".to_string());
                    intent = Intent::Hold;
                }
            }
        }

        // ── 8. Adaptive multiplier ──────────────────────────────────────
        if let Some(pos) = &snap.position {
            if pos.unrealized_pnl_pct > 0.0 {
                multiplier *= (1.0 + pos.unrealized_pnl_pct / 100.0).min(2.0);
            } else if pos.unrealized_pnl_pct < 0.0 {
                multiplier *= 0.5;
            }
        }

        // Under hard risk the governor can never scale risk up.
        if hard_risk {
            multiplier = multiplier.min(policy.risk_multiplier.max(1.0));
        }
        multiplier = multiplier.clamp(0.01, 2.0);

        debug!(
            intent = %intent,
            multiplier,
            reasons = ?reasons,
            "governor verdict"
        );

        GovernedDecision {
            intent,
            side,
            risk_multiplier: multiplier,
            reasons,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> RiskGovernor {
        RiskGovernor::new(EngineConfig::default())
    }

    fn clean_state() -> DeterministicState {
        DeterministicState::default()
    }

    fn flat_snap() -> GovernorSnapshot {
        GovernorSnapshot {
            position: None,
            current_notional: 0.0,
            equity: 1_000.0,
            day_start_equity: 1_000.0,
            trend_side: None,
            trendiness: 0.0,
            signal_score: 0.5,
            hard_liq_risk: false,
        }
    }

    fn long_snap(unrealized_pnl_pct: f64) -> GovernorSnapshot {
        GovernorSnapshot {
            position: Some(SinkPosition {
                side: Side::Buy,
                qty: 10.0,
                entry_price: 100.0,
                adds_used: 0,
                unrealized_pnl_pct,
            }),
            current_notional: 1_000.0,
            equity: 1_000.0,
            day_start_equity: 1_000.0,
            trend_side: None,
            trendiness: 0.0,
            signal_score: 0.5,
            hard_liq_risk: false,
        }
    }

    fn enter(side: Side) -> PolicyInput {
        PolicyInput {
            intent: Intent::Enter,
            side: Some(side),
            risk_multiplier: 1.0,
            confidence: 0.8,
        }
    }

    #[test]
    fn clean_enter_passes_through() {
        let d = governor().govern(enter(Side::Buy), &clean_state(), &flat_snap());
        assert_eq!(d.intent, Intent::Enter);
        assert!(d.reasons.is_empty());
        assert_eq!(d.risk_multiplier, 1.0);
    }

    #[test]
    fn hard_toxicity_flat_holds() {
        let mut state = clean_state();
        state.toxicity = ToxicityState::Toxic;
        let d = governor().govern(enter(Side::Buy), &state, &flat_snap());
        assert_eq!(d.intent, Intent::Hold);
        assert!(d.reasons.iter().any(|r| r == "HARD_RISK"));
    }

    #[test]
    fn hard_slippage_with_position_reduces() {
        let mut state = clean_state();
        state.expected_slippage_bps = 25.0;
        let d = governor().govern(enter(Side::Buy), &state, &long_snap(0.0));
        assert_eq!(d.intent, Intent::Reduce);
        assert_eq!(d.side, Some(Side::Buy));
    }

    #[test]
    fn hard_risk_never_scales_risk_up() {
        let mut state = clean_state();
        state.volatility_percentile = 99.0;
        // A winner would otherwise scale the multiplier above 1.
        let d = governor().govern(enter(Side::Buy), &state, &long_snap(50.0));
        assert!(d.risk_multiplier <= 1.0_f64.max(1.0));
    }

    #[test]
    fn daily_loss_cap_holds_when_flat() {
        let mut snap = flat_snap();
        snap.equity = 950.0; // -5% vs 3% cap
        let d = governor().govern(enter(Side::Buy), &clean_state(), &snap);
        assert_eq!(d.intent, Intent::Hold);
        assert!(d.reasons.iter().any(|r| r.starts_with("DAILY_LOSS_CAP")));
    }

    #[test]
    fn unhealthy_execution_blocks_enter_and_add() {
        let mut state = clean_state();
        state.execution = ExecutionState::WideningSpread;
        let d = governor().govern(enter(Side::Buy), &state, &flat_snap());
        assert_eq!(d.intent, Intent::Hold);
        assert!(d.reasons.iter().any(|r| r == "EXECUTION_UNHEALTHY"));
    }

    #[test]
    fn enter_with_open_position_holds() {
        let d = governor().govern(enter(Side::Buy), &clean_state(), &long_snap(0.0));
        assert_eq!(d.intent, Intent::Hold);
        assert!(d.reasons.iter().any(|r| r == "ENTER_NOT_FLAT"));
    }

    #[test]
    fn counter_trend_enter_converts_to_hold() {
        let mut snap = flat_snap();
        snap.trend_side = Some(Side::Buy);
        snap.trendiness = 0.5;
        snap.signal_score = 0.3; // below confidence + 0.25 gap
        let d = governor().govern(enter(Side::Sell), &clean_state(), &snap);
        assert_eq!(d.intent, Intent::Hold);
        assert!(d.reasons.iter().any(|r| r == "COUNTER_TREND"));

        // A decisive score overrides the guard.
        snap.signal_score = 0.9;
        let d = governor().govern(enter(Side::Sell), &clean_state(), &snap);
        assert_eq!(d.intent, Intent::Enter);
    }

    #[test]
    fn add_requires_headroom_below_exposure_ceiling() {
        let policy = PolicyInput {
            intent: Intent::Add,
            side: Some(Side::Buy),
            risk_multiplier: 1.0,
            confidence: 0.8,
        };

        let mut snap = long_snap(1.0);
        snap.current_notional = 4_000.0; // ceiling is 5000 * 1.6 = 8000
        let d = governor().govern(policy, &clean_state(), &snap);
        assert_eq!(d.intent, Intent::Add);

        snap.current_notional = 9_000.0;
        let d = governor().govern(policy, &clean_state(), &snap);
        assert_eq!(d.intent, Intent::Hold);
        assert!(d.reasons.iter().any(|r| r == "EXPOSURE_LIMIT"));
    }

    #[test]
    fn reduce_below_notional_floor_holds() {
        let policy = PolicyInput {
            intent: Intent::Reduce,
            side: Some(Side::Buy),
            risk_multiplier: 1.0,
            confidence: 0.8,
        };
        // 1000 notional <= 5000 floor, no hard risk.
        let d = governor().govern(policy, &clean_state(), &long_snap(1.0));
        assert_eq!(d.intent, Intent::Hold);
        assert!(d.reasons.iter().any(|r| r == "NOTIONAL_FLOOR"));
    }

    #[test]
    fn loser_realize_block_is_opt_in() {
        let policy = PolicyInput {
            intent: Intent::Exit,
            side: Some(Side::Buy),
            risk_multiplier: 1.0,
            confidence: 0.8,
        };

        // Default config: exits of losers pass.
        let d = governor().govern(policy, &clean_state(), &long_snap(-2.0));
        assert_eq!(d.intent, Intent::Exit);

        let mut cfg = EngineConfig::default();
        cfg.block_loser_realize = true;
        let d = RiskGovernor::new(cfg).govern(policy, &clean_state(), &long_snap(-2.0));
        assert_eq!(d.intent, Intent::Hold);
        assert!(d.reasons.iter().any(|r| r == "LOSER_REALIZE_BLOCKED"));
    }

    #[test]
    fn adaptive_multiplier_scales_winners_and_halves_losers() {
        let policy = PolicyInput {
            intent: Intent::Add,
            side: Some(Side::Buy),
            risk_multiplier: 1.0,
            confidence: 0.8,
        };

        let d = governor().govern(policy, &clean_state(), &long_snap(20.0));
        assert!((d.risk_multiplier - 1.2).abs() < 1e-9);

        let d = governor().govern(policy, &clean_state(), &long_snap(-5.0));
        assert!((d.risk_multiplier - 0.5).abs() < 1e-9);
    }

    #[test]
    fn multiplier_always_within_bounds() {
        let policy = PolicyInput {
            intent: Intent::Add,
            side: Some(Side::Buy),
            risk_multiplier: 1.9,
            confidence: 0.8,
        };
        let d = governor().govern(policy, &clean_state(), &long_snap(150.0));
        assert!(d.risk_multiplier <= 2.0);
        assert!(d.risk_multiplier >= 0.01);
    }
}
