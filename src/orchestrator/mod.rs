// =============================================================================
// Orchestrator — per-symbol deterministic trading state machine
// =============================================================================
//
// Evaluated once per aggregate tick. Input is the current metrics snapshot
// plus position and cross-market context; output is a `Decision` carrying the
// intent, gate report, chase state, and the order intents to emit. All
// mutation happens on the per-symbol `OrchestratorRuntime`; given identical
// runtime state and input, `evaluate` is a pure function.
// =============================================================================

pub mod adds;
pub mod anchor;
pub mod chase;
pub mod engine;
pub mod exits;
pub mod gates;
pub mod htf;
pub mod runtime;

use serde::Serialize;

use crate::fills::SinkPosition;
use crate::state::DeterministicState;
use crate::types::{Intent, OrderIntent, Side};

pub use engine::Orchestrator;
pub use runtime::OrchestratorRuntime;

// =============================================================================
// Input
// =============================================================================

/// Readiness preconditions supplied by the backfill/session layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadinessInput {
    pub backfill_done: bool,
    pub bars_loaded_1m: u32,
    /// 0 means "no session VWAP yet".
    pub session_vwap: f64,
    pub htf_h1_bar_start: Option<i64>,
    pub htf_h4_bar_start: Option<i64>,
}

/// HTF 1h swing levels and structure-break flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtfInputs {
    pub swing_high: f64,
    pub swing_low: f64,
    pub structure_break_up: bool,
    pub structure_break_dn: bool,
}

/// Cross-market (BTC) context for the anchor filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossMarketContext {
    pub h1_up: bool,
    pub h4_up: bool,
    pub h1_dn: bool,
    pub h4_dn: bool,
    /// BTC's own open position, if any (used when structure is neutral).
    pub btc_position_side: Option<Side>,
    /// Hard-veto mode: counter-anchor candidates are blocked outright.
    pub hard_veto: bool,
}

/// Everything the orchestrator reads for one evaluation.
#[derive(Debug, Clone)]
pub struct OrchestratorTick {
    pub now_ms: i64,
    /// Current mid price.
    pub price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    /// Spread as a fraction of mid.
    pub spread_pct: f64,
    pub prints_per_second: f64,
    pub delta_z: f64,
    pub obi_weighted: f64,
    pub obi_deep: f64,
    pub cvd_slope: f64,
    pub cvd_5m: f64,
    pub trendiness: f64,
    pub chop: f64,
    pub vol_of_vol: f64,
    pub realized_vol_1m_pct: f64,
    pub atr_3m: f64,
    pub oi_change_pct: f64,
    /// Orderbook integrity defect level, 0 (clean) .. 1 (broken).
    pub book_integrity: f64,
    pub state: DeterministicState,
    pub readiness: ReadinessInput,
    /// Authoritative position view from the fill sink; `None` means flat.
    pub dry_run_position: Option<SinkPosition>,
    pub btc: CrossMarketContext,
    pub htf: HtfInputs,
}

// =============================================================================
// Output
// =============================================================================

/// Gate evaluation detail published with the decision.
#[derive(Debug, Clone, Serialize, Default)]
pub struct GateReport {
    pub ready: bool,
    pub readiness_reasons: Vec<String>,
    pub gate_a: bool,
    pub gate_b: bool,
    pub gate_c: bool,
    pub all_raw: bool,
    pub entry_confirm_count: u32,
    pub required_confirmations: u32,
    pub impulse: bool,
}

/// Chase state detail published with the decision.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ChaseReport {
    pub active: bool,
    pub start_ts: i64,
    pub elapsed_ms: i64,
    pub reprices_used: u32,
    pub timed_out: bool,
    pub fallback_used: bool,
}

/// Why an exit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    ExitFlip,
    CrossmarketMismatch,
    Integrity,
    Regime,
    FlowFlip,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExitFlip => "EXIT_FLIP",
            Self::CrossmarketMismatch => "CROSSMARKET_MISMATCH",
            Self::Integrity => "INTEGRITY",
            Self::Regime => "REGIME",
            Self::FlowFlip => "FLOW_FLIP",
        }
    }
}

/// Exit episode detail published with the decision.
#[derive(Debug, Clone, Serialize)]
pub struct ExitReport {
    pub reason: ExitReason,
    pub maker_attempts: u32,
    pub taker_used: bool,
}

/// Add-ladder detail published with the decision.
#[derive(Debug, Clone, Serialize)]
pub struct AddReport {
    pub step: u32,
    pub threshold_price: f64,
    pub qty: f64,
}

/// Position summary mirrored into the decision.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PositionReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    pub qty: f64,
    pub entry_vwap: f64,
    pub adds_used: u32,
}

/// The orchestrator's verdict for one tick.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub symbol: String,
    pub intent: Intent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    pub gates: GateReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add: Option<AddReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_risk: Option<ExitReport>,
    pub position: PositionReport,
    pub orders: Vec<OrderIntent>,
    pub chase: ChaseReport,
    pub reasons: Vec<String>,
    pub telemetry: runtime::TelemetrySnapshot,
}
