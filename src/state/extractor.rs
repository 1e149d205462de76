// =============================================================================
// State Extractor — continuous features to stabilized categorical state
// =============================================================================
//
// Each dimension has a classifier mapping the current feature vector to a
// (candidate, confidence) pair; the stabilizer then requires 2 consecutive
// observations unless the candidate is in the CRITICAL set (VOL_EXPANSION,
// TOXIC, LOW_RESILIENCY), which applies immediately.
//
// State confidence is the mean of the per-dimension confidences.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::state::stabilizer::Stabilized;
use crate::types::{Side, Trend};

// =============================================================================
// Categorical dimensions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Expansion,
    Exhaustion,
    Absorption,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeState {
    Trend,
    Chop,
    Transition,
    VolExpansion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DerivativesState {
    LongBuild,
    ShortBuild,
    Deleveraging,
    SqueezeRisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToxicityState {
    Clean,
    Aggressive,
    Toxic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Healthy,
    WideningSpread,
    LowResiliency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BiasState {
    Long,
    Short,
    Neutral,
}

/// The stabilized categorical state published with every metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeterministicState {
    pub flow: FlowState,
    pub regime: RegimeState,
    pub derivatives: DerivativesState,
    pub toxicity: ToxicityState,
    pub execution: ExecutionState,
    pub directional_bias: BiasState,
    pub cvd_slope_sign: Trend,
    pub oi_direction: Trend,
    pub state_confidence: f64,
    pub volatility_percentile: f64,
    pub spread_bps: f64,
    pub expected_slippage_bps: f64,
}

impl Default for DeterministicState {
    fn default() -> Self {
        Self {
            flow: FlowState::Neutral,
            regime: RegimeState::Transition,
            derivatives: DerivativesState::LongBuild,
            toxicity: ToxicityState::Clean,
            execution: ExecutionState::Healthy,
            directional_bias: BiasState::Neutral,
            cvd_slope_sign: Trend::Flat,
            oi_direction: Trend::Flat,
            state_confidence: 0.0,
            volatility_percentile: 50.0,
            spread_bps: 0.0,
            expected_slippage_bps: 0.0,
        }
    }
}

// =============================================================================
// Feature inputs
// =============================================================================

/// Continuous feature vector assembled by the symbol engine each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureInputs {
    pub delta_z: f64,
    pub delta_1s: f64,
    pub cvd_1m: f64,
    pub cvd_slope: f64,
    pub obi_weighted: f64,
    pub obi_deep: f64,
    /// 1.0 when the absorption detector fired.
    pub absorption_value: f64,
    pub absorption_side: Option<Side>,
    /// Taker buy volume minus taker sell volume over the TAS window.
    pub aggressive_imbalance: f64,
    pub trendiness: f64,
    pub chop: f64,
    pub volatility_percentile: f64,
    pub vol_of_vol: f64,
    /// Percent change of open interest since the previous poll.
    pub oi_change_pct: f64,
    /// Perp basis (mark vs index), fraction.
    pub perp_basis: f64,
    pub vpin: f64,
    pub burst_score: f64,
    pub burst_side: Option<Side>,
    /// |1 s mid return| per traded quantity.
    pub impact: f64,
    pub spread_bps: f64,
    pub expected_slippage_bps: f64,
    /// Total resting volume in the near book (weak-book detection).
    pub near_book_volume: f64,
}

// =============================================================================
// Thresholds
// =============================================================================

const FLOW_ABS_MIN: f64 = 0.55;
const FLOW_DZ_MIN: f64 = 1.2;
const FLOW_CVD_MIN: f64 = 12_000.0;
const WEAK_BOOK_VOLUME: f64 = 1.0;

const REGIME_VOL_PCT: f64 = 96.0;
const REGIME_VOL_OF_VOL: f64 = 0.11;
const REGIME_TREND_MIN: f64 = 0.24;
const REGIME_TREND_MARGIN: f64 = 0.03;
const REGIME_CHOP_MIN: f64 = 0.35;
const REGIME_CHOP_MARGIN: f64 = 0.05;

const DERIV_LIQ_PROXY: f64 = 0.65;
const DERIV_OI_DROP_PCT: f64 = -0.15;

const TOX_VPIN_HARD: f64 = 0.88;
const TOX_BURST_WITH_VPIN: f64 = 0.75;
const TOX_BURST_ALONE: f64 = 0.93;
const TOX_IMPACT_HARD: f64 = 1.2e-4;
const TOX_VPIN_SOFT: f64 = 0.72;
const TOX_BURST_SOFT: f64 = 0.55;
const TOX_IMPACT_SOFT: f64 = 0.7e-4;

const EXEC_SPREAD_HARD_BPS: f64 = 24.0;
const EXEC_SLIP_HARD_BPS: f64 = 14.0;
const EXEC_SPREAD_COMBO_BPS: f64 = 18.0;
const EXEC_SLIP_COMBO_BPS: f64 = 10.0;
const EXEC_SPREAD_SOFT_BPS: f64 = 14.0;
const EXEC_SLIP_SOFT_BPS: f64 = 9.0;

const BIAS_THRESHOLD: f64 = 0.20;
const BIAS_THRESHOLD_CHOP: f64 = 0.28;

// =============================================================================
// Extractor
// =============================================================================

/// Per-symbol extractor holding the stabilizers between ticks.
#[derive(Debug)]
pub struct StateExtractor {
    flow: Stabilized<FlowState>,
    regime: Stabilized<RegimeState>,
    derivatives: Stabilized<DerivativesState>,
    toxicity: Stabilized<ToxicityState>,
    execution: Stabilized<ExecutionState>,
    bias: Stabilized<BiasState>,
}

impl StateExtractor {
    pub fn new() -> Self {
        let d = DeterministicState::default();
        Self {
            flow: Stabilized::new(d.flow),
            regime: Stabilized::new(d.regime),
            derivatives: Stabilized::new(d.derivatives),
            toxicity: Stabilized::new(d.toxicity),
            execution: Stabilized::new(d.execution),
            bias: Stabilized::new(d.directional_bias),
        }
    }

    /// Classify the feature vector and advance the stabilizers.
    pub fn extract(&mut self, f: &FeatureInputs) -> DeterministicState {
        let (flow_c, flow_conf) = classify_flow(f);
        let (regime_c, regime_conf) = classify_regime(f);
        let (deriv_c, deriv_conf) = classify_derivatives(f);
        let (tox_c, tox_conf) = classify_toxicity(f);
        let (exec_c, exec_conf) = classify_execution(f);

        let flow = self.flow.observe(flow_c, false);
        let regime = self
            .regime
            .observe(regime_c, regime_c == RegimeState::VolExpansion);
        let derivatives = self.derivatives.observe(deriv_c, false);
        let toxicity = self
            .toxicity
            .observe(tox_c, tox_c == ToxicityState::Toxic);
        let execution = self
            .execution
            .observe(exec_c, exec_c == ExecutionState::LowResiliency);

        // Bias is classified against the *stabilized* regime/toxicity so the
        // damping context cannot flap independently of what downstream sees.
        let (bias_c, bias_conf) = classify_bias(f, regime, toxicity, execution);
        let directional_bias = self.bias.observe(bias_c, false);

        let state_confidence =
            (flow_conf + regime_conf + deriv_conf + tox_conf + exec_conf + bias_conf) / 6.0;

        DeterministicState {
            flow,
            regime,
            derivatives,
            toxicity,
            execution,
            directional_bias,
            cvd_slope_sign: Trend::from_signed(f.cvd_slope, 1e-9),
            oi_direction: Trend::from_signed(f.oi_change_pct, 1e-6),
            state_confidence,
            volatility_percentile: f.volatility_percentile,
            spread_bps: f.spread_bps,
            expected_slippage_bps: f.expected_slippage_bps,
        }
    }
}

impl Default for StateExtractor {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Classifiers
// =============================================================================

fn classify_flow(f: &FeatureInputs) -> (FlowState, f64) {
    if f.absorption_side.is_some() && f.absorption_value >= FLOW_ABS_MIN {
        return (FlowState::Absorption, f.absorption_value.min(1.0));
    }

    let dz_strong = f.delta_z.abs() >= FLOW_DZ_MIN;
    let cvd_strong = f.cvd_1m.abs() >= FLOW_CVD_MIN;
    let same_sign = f.delta_z * f.cvd_1m > 0.0;

    if dz_strong && cvd_strong && same_sign {
        let conf = ((f.delta_z.abs() / (2.0 * FLOW_DZ_MIN)).min(1.0)
            + (f.cvd_1m.abs() / (2.0 * FLOW_CVD_MIN)).min(1.0))
            / 2.0;
        return (FlowState::Expansion, conf);
    }

    let sign_conflict = dz_strong && cvd_strong && !same_sign;
    let weak_book = f.near_book_volume > 0.0 && f.near_book_volume < WEAK_BOOK_VOLUME;
    if sign_conflict || (dz_strong && weak_book) {
        return (FlowState::Exhaustion, 0.6);
    }

    (FlowState::Neutral, 0.4)
}

fn classify_regime(f: &FeatureInputs) -> (RegimeState, f64) {
    if f.volatility_percentile >= REGIME_VOL_PCT || f.vol_of_vol >= REGIME_VOL_OF_VOL {
        let conf = ((f.volatility_percentile / 100.0).max(f.vol_of_vol / REGIME_VOL_OF_VOL))
            .min(1.0);
        return (RegimeState::VolExpansion, conf);
    }
    if f.trendiness >= REGIME_TREND_MIN && f.trendiness > f.chop + REGIME_TREND_MARGIN {
        return (RegimeState::Trend, (f.trendiness * 2.0).min(1.0));
    }
    if f.chop >= REGIME_CHOP_MIN && f.chop > f.trendiness + REGIME_CHOP_MARGIN {
        return (RegimeState::Chop, f.chop.min(1.0));
    }
    (RegimeState::Transition, 0.4)
}

fn classify_derivatives(f: &FeatureInputs) -> (DerivativesState, f64) {
    let liq = liquidation_proxy(f);
    if liq >= DERIV_LIQ_PROXY {
        return (DerivativesState::SqueezeRisk, liq.min(1.0));
    }
    if f.oi_change_pct <= DERIV_OI_DROP_PCT {
        let conf = (f.oi_change_pct.abs() / (2.0 * DERIV_OI_DROP_PCT.abs())).min(1.0);
        return (DerivativesState::Deleveraging, conf.max(0.5));
    }
    if f.delta_1s >= 0.0 {
        (DerivativesState::LongBuild, 0.5)
    } else {
        (DerivativesState::ShortBuild, 0.5)
    }
}

/// Proxy for cascading-liquidation pressure: elevated volatility plus a
/// one-sided burst plus a stretched basis.
fn liquidation_proxy(f: &FeatureInputs) -> f64 {
    let vol_term = (f.volatility_percentile / 100.0) * 0.45;
    let burst_term = f.burst_score * 0.35;
    let basis_term = (f.perp_basis.abs() / 0.002).min(1.0) * 0.20;
    (vol_term + burst_term + basis_term).clamp(0.0, 1.0)
}

fn classify_toxicity(f: &FeatureInputs) -> (ToxicityState, f64) {
    let toxic = (f.vpin >= TOX_VPIN_HARD && f.burst_score >= TOX_BURST_WITH_VPIN)
        || f.burst_score >= TOX_BURST_ALONE
        || f.impact >= TOX_IMPACT_HARD;
    if toxic {
        return (ToxicityState::Toxic, f.vpin.max(f.burst_score).min(1.0));
    }

    let aggressive = (f.vpin >= TOX_VPIN_SOFT && f.burst_score >= TOX_BURST_SOFT)
        || f.burst_score >= 0.8
        || f.impact >= TOX_IMPACT_SOFT;
    if aggressive {
        return (ToxicityState::Aggressive, 0.6);
    }

    (ToxicityState::Clean, 0.7)
}

fn classify_execution(f: &FeatureInputs) -> (ExecutionState, f64) {
    let low = f.spread_bps >= EXEC_SPREAD_HARD_BPS
        || f.expected_slippage_bps >= EXEC_SLIP_HARD_BPS
        || (f.spread_bps >= EXEC_SPREAD_COMBO_BPS
            && f.expected_slippage_bps >= EXEC_SLIP_COMBO_BPS);
    if low {
        return (ExecutionState::LowResiliency, 0.8);
    }
    if f.spread_bps >= EXEC_SPREAD_SOFT_BPS || f.expected_slippage_bps >= EXEC_SLIP_SOFT_BPS {
        return (ExecutionState::WideningSpread, 0.6);
    }
    (ExecutionState::Healthy, 0.7)
}

fn classify_bias(
    f: &FeatureInputs,
    regime: RegimeState,
    toxicity: ToxicityState,
    execution: ExecutionState,
) -> (BiasState, f64) {
    // Weighted signed score over the flow features. Each term is squashed
    // into roughly [-1, 1] before weighting.
    let mut score = 0.0;
    score += 0.22 * squash(f.delta_1s / 50.0);
    score += 0.18 * squash(f.delta_z / 2.5);
    score += 0.14 * squash(f.cvd_1m / FLOW_CVD_MIN);
    score += 0.12 * squash(f.obi_deep / 100.0);
    score += 0.10 * squash(f.obi_weighted / 40.0);
    score += 0.10 * squash(f.aggressive_imbalance / 50.0);

    // OI only contributes when aligned with the flow direction.
    let flow_sign = if score > 0.0 { 1.0 } else { -1.0 };
    if f.oi_change_pct * flow_sign > 0.0 {
        score += 0.06 * squash(f.oi_change_pct / 0.5).abs() * flow_sign;
    }

    if let Some(side) = f.absorption_side {
        // Absorption of selling (sell prints into a bid wall) is bullish.
        score += 0.04 * -side.sign() * f.absorption_value;
    }

    score += 0.04 * squash(f.perp_basis / 0.001);

    // Contextual damping: adverse regime / toxicity / execution / volatility
    // shrink the score rather than hard-blocking it.
    let mut damp = 1.0;
    if regime == RegimeState::VolExpansion {
        damp *= 0.5;
    }
    if toxicity == ToxicityState::Toxic {
        damp *= 0.4;
    } else if toxicity == ToxicityState::Aggressive {
        damp *= 0.75;
    }
    if execution == ExecutionState::LowResiliency {
        damp *= 0.5;
    }
    if f.volatility_percentile >= 90.0 {
        damp *= 0.8;
    }
    score *= damp;

    let threshold = if regime == RegimeState::Chop {
        BIAS_THRESHOLD_CHOP
    } else {
        BIAS_THRESHOLD
    };

    let state = if score >= threshold {
        BiasState::Long
    } else if score <= -threshold {
        BiasState::Short
    } else {
        BiasState::Neutral
    };

    (state, score.abs().min(1.0))
}

fn squash(x: f64) -> f64 {
    x.clamp(-1.0, 1.0)
}
