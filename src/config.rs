// =============================================================================
// Engine Configuration — environment-driven threshold registry
// =============================================================================
//
// Every numeric threshold used by the orchestrator, governor, and state
// extractor is read from the environment at startup. Nothing is hardcoded at
// the call sites; modules receive a clone (or a sub-struct) of this registry.
//
// All fields carry serde defaults so the config snapshot serialises cleanly
// into the health payload and older dumps keep loading.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_policy_timeout_ms() -> u64 {
    2_200
}

fn default_vol_hard_limit_pct() -> f64 {
    97.0
}

fn default_slippage_hard_bps() -> f64 {
    18.0
}

fn default_max_exposure_multiplier() -> f64 {
    1.6
}

fn default_reentry_cooldown_bars() -> u32 {
    3
}

fn default_dca_max_count() -> u32 {
    2
}

fn default_pyramid_max_count() -> u32 {
    2
}

fn default_bar_interval_ms() -> i64 {
    60_000
}

fn default_state_confidence_threshold() -> f64 {
    0.35
}

fn default_direction_lock_cooldown_ms() -> i64 {
    45_000
}

fn default_direction_lock_confirm_ttl_ms() -> i64 {
    20_000
}

fn default_chase_reprice_ms() -> i64 {
    1_500
}

fn default_chase_max_reprices() -> u32 {
    4
}

fn default_chase_max_seconds() -> i64 {
    12
}

fn default_chase_ttl_ms() -> i64 {
    2_500
}

fn default_chase_layer_notional_pct() -> f64 {
    0.5
}

fn default_add1_atr_multiple() -> f64 {
    0.55
}

fn default_add2_atr_multiple() -> f64 {
    1.10
}

fn default_add1_qty_factor() -> f64 {
    0.75
}

fn default_add2_qty_factor() -> f64 {
    0.50
}

fn default_add_min_interval_ms() -> i64 {
    90_000
}

fn default_consecutive_confirmations() -> u32 {
    3
}

fn default_entry_confirmations() -> u32 {
    2
}

fn default_min_hold_ms() -> i64 {
    30_000
}

fn default_min_flip_interval_ms() -> i64 {
    25_000
}

fn default_side_w_delta_z() -> f64 {
    0.65
}

fn default_side_w_cvd_slope() -> f64 {
    12.0
}

fn default_side_w_obi_deep() -> f64 {
    0.35
}

fn default_max_fallback_notional_pct() -> f64 {
    0.25
}

fn default_max_position_notional() -> f64 {
    5_000.0
}

fn default_base_qty_notional() -> f64 {
    500.0
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_min_prints_per_second() -> f64 {
    0.5
}

fn default_min_bars_loaded() -> u32 {
    360
}

fn default_crossmarket_persist_ms() -> i64 {
    30_000
}

fn default_exit_maker_attempts() -> u32 {
    2
}

fn default_reduce_pct() -> f64 {
    0.5
}

fn default_oi_poll_secs() -> u64 {
    30
}

fn default_funding_poll_secs() -> u64 {
    60
}

fn default_gate_a_trendiness_min() -> f64 {
    0.18
}

fn default_gate_a_chop_max() -> f64 {
    0.55
}

fn default_gate_a_vol_of_vol_max() -> f64 {
    0.10
}

fn default_gate_a_spread_pct_max() -> f64 {
    0.0012
}

fn default_gate_a_oi_drop_pct() -> f64 {
    -0.40
}

fn default_gate_b_obi_deep_min() -> f64 {
    5.0
}

fn default_gate_b_delta_z_min() -> f64 {
    0.8
}

fn default_gate_b_cvd_slope_min() -> f64 {
    0.5
}

fn default_gate_c_vwap_dist_max() -> f64 {
    0.004
}

fn default_gate_c_vol1m_max_pct() -> f64 {
    0.35
}

fn default_impulse_pps_min() -> f64 {
    3.0
}

fn default_impulse_delta_z_min() -> f64 {
    1.5
}

fn default_exit_trendiness_min() -> f64 {
    0.08
}

fn default_exit_chop_max() -> f64 {
    0.55
}

fn default_integrity_exit_threshold() -> f64 {
    0.5
}

fn default_exit_flow_obi_min() -> f64 {
    8.0
}

fn default_exit_flow_delta_z_min() -> f64 {
    1.0
}

fn default_add_obi_min() -> f64 {
    4.0
}

fn default_add_cvd_slope_min() -> f64 {
    0.3
}

fn default_add_oi_min_pct() -> f64 {
    -0.10
}

fn default_smooth_alpha_delta_z() -> f64 {
    0.4
}

fn default_smooth_alpha_obi() -> f64 {
    0.4
}

fn default_cvd_median_window() -> usize {
    5
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration registry, loaded once from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbols the engine watches and trades (env `MERIDIAN_SYMBOLS`, comma
    /// separated, uppercased).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// API bind address (env `MERIDIAN_BIND_ADDR`).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Advisor -------------------------------------------------------------
    /// Hard deadline for a single advisor call.
    #[serde(default = "default_policy_timeout_ms")]
    pub policy_timeout_ms: u64,

    // --- Governor hard limits ------------------------------------------------
    /// Volatility percentile above which hard risk is active.
    #[serde(default = "default_vol_hard_limit_pct")]
    pub vol_hard_limit_pct: f64,

    /// Expected slippage (bps) above which hard risk is active.
    #[serde(default = "default_slippage_hard_bps")]
    pub slippage_hard_bps: f64,

    /// Max exposure as a multiple of max position notional.
    #[serde(default = "default_max_exposure_multiplier")]
    pub max_exposure_multiplier: f64,

    /// Per-symbol maximum position notional (quote units).
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: f64,

    /// Notional of a base-quantity entry (quote units).
    #[serde(default = "default_base_qty_notional")]
    pub base_qty_notional: f64,

    /// Daily loss cap as a percent of day-start equity.
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    /// When set, REDUCE/EXIT intents are blocked while unrealized PnL is
    /// negative and no hard risk is active.
    #[serde(default)]
    pub block_loser_realize: bool,

    /// Fraction of the position shed on a hard-risk REDUCE.
    #[serde(default = "default_reduce_pct")]
    pub reduce_pct: f64,

    // --- Cadence -------------------------------------------------------------
    #[serde(default = "default_reentry_cooldown_bars")]
    pub reentry_cooldown_bars: u32,

    #[serde(default = "default_dca_max_count")]
    pub dca_max_count: u32,

    #[serde(default = "default_pyramid_max_count")]
    pub pyramid_max_count: u32,

    #[serde(default = "default_bar_interval_ms")]
    pub bar_interval_ms: i64,

    #[serde(default = "default_state_confidence_threshold")]
    pub state_confidence_threshold: f64,

    #[serde(default = "default_direction_lock_cooldown_ms")]
    pub direction_lock_cooldown_ms: i64,

    #[serde(default = "default_direction_lock_confirm_ttl_ms")]
    pub direction_lock_confirm_ttl_ms: i64,

    // --- Entry chase ---------------------------------------------------------
    /// Minimum spacing between maker reprice layers.
    #[serde(default = "default_chase_reprice_ms")]
    pub chase_reprice_ms: i64,

    #[serde(default = "default_chase_max_reprices")]
    pub chase_max_reprices: u32,

    /// Chase budget; past this the chase times out.
    #[serde(default = "default_chase_max_seconds")]
    pub chase_max_seconds: i64,

    /// Per-layer order TTL hint forwarded with maker intents.
    #[serde(default = "default_chase_ttl_ms")]
    pub chase_ttl_ms: i64,

    /// Notional fraction per maker layer.
    #[serde(default = "default_chase_layer_notional_pct")]
    pub chase_layer_notional_pct: f64,

    /// Ceiling on taker fallback notional fraction (never above 0.25).
    #[serde(default = "default_max_fallback_notional_pct")]
    pub max_fallback_notional_pct: f64,

    // --- Add ladder ----------------------------------------------------------
    #[serde(default = "default_add1_atr_multiple")]
    pub add1_atr_multiple: f64,

    #[serde(default = "default_add2_atr_multiple")]
    pub add2_atr_multiple: f64,

    #[serde(default = "default_add1_qty_factor")]
    pub add1_qty_factor: f64,

    #[serde(default = "default_add2_qty_factor")]
    pub add2_qty_factor: f64,

    #[serde(default = "default_add_min_interval_ms")]
    pub add_min_interval_ms: i64,

    // --- Side hysteresis -----------------------------------------------------
    /// Consecutive opposite-side candidates required before the micro side
    /// flips.
    #[serde(default = "default_consecutive_confirmations")]
    pub consecutive_confirmations: u32,

    /// Consecutive all-gates-passed ticks required before an entry fires.
    #[serde(default = "default_entry_confirmations")]
    pub entry_confirmations: u32,

    #[serde(default = "default_min_hold_ms")]
    pub min_hold_ms: i64,

    #[serde(default = "default_min_flip_interval_ms")]
    pub min_flip_interval_ms: i64,

    // --- Micro-side score weights (empirical, not invariants) ---------------
    #[serde(default = "default_side_w_delta_z")]
    pub side_w_delta_z: f64,

    #[serde(default = "default_side_w_cvd_slope")]
    pub side_w_cvd_slope: f64,

    #[serde(default = "default_side_w_obi_deep")]
    pub side_w_obi_deep: f64,

    // --- Readiness -----------------------------------------------------------
    #[serde(default = "default_min_prints_per_second")]
    pub min_prints_per_second: f64,

    #[serde(default = "default_min_bars_loaded")]
    pub min_bars_loaded: u32,

    // --- Exits ---------------------------------------------------------------
    #[serde(default = "default_crossmarket_persist_ms")]
    pub crossmarket_persist_ms: i64,

    #[serde(default = "default_exit_maker_attempts")]
    pub exit_maker_attempts: u32,

    // --- Monitors ------------------------------------------------------------
    #[serde(default = "default_oi_poll_secs")]
    pub oi_poll_secs: u64,

    #[serde(default = "default_funding_poll_secs")]
    pub funding_poll_secs: u64,

    // --- Gate A (regime & venue) --------------------------------------------
    #[serde(default = "default_gate_a_trendiness_min")]
    pub gate_a_trendiness_min: f64,

    #[serde(default = "default_gate_a_chop_max")]
    pub gate_a_chop_max: f64,

    #[serde(default = "default_gate_a_vol_of_vol_max")]
    pub gate_a_vol_of_vol_max: f64,

    /// Spread as a fraction of mid (not bps).
    #[serde(default = "default_gate_a_spread_pct_max")]
    pub gate_a_spread_pct_max: f64,

    /// OI change (percent) must stay above this drop.
    #[serde(default = "default_gate_a_oi_drop_pct")]
    pub gate_a_oi_drop_pct: f64,

    // --- Gate B (side-aligned flow) ------------------------------------------
    #[serde(default = "default_gate_b_obi_deep_min")]
    pub gate_b_obi_deep_min: f64,

    #[serde(default = "default_gate_b_delta_z_min")]
    pub gate_b_delta_z_min: f64,

    #[serde(default = "default_gate_b_cvd_slope_min")]
    pub gate_b_cvd_slope_min: f64,

    // --- Gate C (micro) -------------------------------------------------------
    /// Max |price - session VWAP| / session VWAP.
    #[serde(default = "default_gate_c_vwap_dist_max")]
    pub gate_c_vwap_dist_max: f64,

    #[serde(default = "default_gate_c_vol1m_max_pct")]
    pub gate_c_vol1m_max_pct: f64,

    // --- Impulse --------------------------------------------------------------
    #[serde(default = "default_impulse_pps_min")]
    pub impulse_pps_min: f64,

    #[serde(default = "default_impulse_delta_z_min")]
    pub impulse_delta_z_min: f64,

    // --- Exit risk ------------------------------------------------------------
    #[serde(default = "default_exit_trendiness_min")]
    pub exit_trendiness_min: f64,

    #[serde(default = "default_exit_chop_max")]
    pub exit_chop_max: f64,

    #[serde(default = "default_integrity_exit_threshold")]
    pub integrity_exit_threshold: f64,

    #[serde(default = "default_exit_flow_obi_min")]
    pub exit_flow_obi_min: f64,

    #[serde(default = "default_exit_flow_delta_z_min")]
    pub exit_flow_delta_z_min: f64,

    // --- Add-ladder flow alignment -------------------------------------------
    #[serde(default = "default_add_obi_min")]
    pub add_obi_min: f64,

    #[serde(default = "default_add_cvd_slope_min")]
    pub add_cvd_slope_min: f64,

    #[serde(default = "default_add_oi_min_pct")]
    pub add_oi_min_pct: f64,

    // --- Smoothing ------------------------------------------------------------
    #[serde(default = "default_smooth_alpha_delta_z")]
    pub smooth_alpha_delta_z: f64,

    #[serde(default = "default_smooth_alpha_obi")]
    pub smooth_alpha_obi: f64,

    #[serde(default = "default_cvd_median_window")]
    pub cvd_median_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // serde's field defaults are authoritative; an empty JSON object
        // produces the canonical default config.
        serde_json::from_str("{}").expect("empty config object always deserialises")
    }
}

impl EngineConfig {
    /// Build the registry from the process environment.
    ///
    /// Unknown or malformed values fall back to defaults with a warning; a
    /// bad env var never prevents startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                cfg.symbols = parsed;
            }
        }
        if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
            cfg.bind_addr = addr;
        }

        env_parse("POLICY_TIMEOUT_MS", &mut cfg.policy_timeout_ms);
        env_parse("VOL_HARD_LIMIT_PCT", &mut cfg.vol_hard_limit_pct);
        env_parse("SLIPPAGE_HARD_BPS", &mut cfg.slippage_hard_bps);
        env_parse("MAX_EXPOSURE_MULTIPLIER", &mut cfg.max_exposure_multiplier);
        env_parse("MAX_POSITION_NOTIONAL", &mut cfg.max_position_notional);
        env_parse("BASE_QTY_NOTIONAL", &mut cfg.base_qty_notional);
        env_parse("MAX_DAILY_LOSS_PCT", &mut cfg.max_daily_loss_pct);
        env_parse("BLOCK_LOSER_REALIZE", &mut cfg.block_loser_realize);
        env_parse("REDUCE_PCT", &mut cfg.reduce_pct);
        env_parse("REENTRY_COOLDOWN_BARS", &mut cfg.reentry_cooldown_bars);
        env_parse("DCA_MAX_COUNT", &mut cfg.dca_max_count);
        env_parse("PYRAMID_MAX_COUNT", &mut cfg.pyramid_max_count);
        env_parse("BAR_INTERVAL_MS", &mut cfg.bar_interval_ms);
        env_parse(
            "STATE_CONFIDENCE_THRESHOLD",
            &mut cfg.state_confidence_threshold,
        );
        env_parse(
            "DIRECTION_LOCK_COOLDOWN_MS",
            &mut cfg.direction_lock_cooldown_ms,
        );
        env_parse(
            "DIRECTION_LOCK_CONFIRM_TTL_MS",
            &mut cfg.direction_lock_confirm_ttl_ms,
        );
        env_parse("CHASE_REPRICE_MS", &mut cfg.chase_reprice_ms);
        env_parse("CHASE_MAX_REPRICES", &mut cfg.chase_max_reprices);
        env_parse("CHASE_MAX_SECONDS", &mut cfg.chase_max_seconds);
        env_parse("CHASE_TTL_MS", &mut cfg.chase_ttl_ms);
        env_parse(
            "CHASE_LAYER_NOTIONAL_PCT",
            &mut cfg.chase_layer_notional_pct,
        );
        env_parse(
            "MAX_FALLBACK_NOTIONAL_PCT",
            &mut cfg.max_fallback_notional_pct,
        );
        env_parse("ADD1_ATR_MULTIPLE", &mut cfg.add1_atr_multiple);
        env_parse("ADD2_ATR_MULTIPLE", &mut cfg.add2_atr_multiple);
        env_parse("ADD1_QTY_FACTOR", &mut cfg.add1_qty_factor);
        env_parse("ADD2_QTY_FACTOR", &mut cfg.add2_qty_factor);
        env_parse("ADD_MIN_INTERVAL_MS", &mut cfg.add_min_interval_ms);
        env_parse(
            "CONSECUTIVE_CONFIRMATIONS",
            &mut cfg.consecutive_confirmations,
        );
        env_parse("ENTRY_CONFIRMATIONS", &mut cfg.entry_confirmations);
        env_parse("MIN_HOLD_MS", &mut cfg.min_hold_ms);
        env_parse("MIN_FLIP_INTERVAL_MS", &mut cfg.min_flip_interval_ms);
        env_parse("SIDE_W_DELTA_Z", &mut cfg.side_w_delta_z);
        env_parse("SIDE_W_CVD_SLOPE", &mut cfg.side_w_cvd_slope);
        env_parse("SIDE_W_OBI_DEEP", &mut cfg.side_w_obi_deep);
        env_parse("MIN_PRINTS_PER_SECOND", &mut cfg.min_prints_per_second);
        env_parse("MIN_BARS_LOADED", &mut cfg.min_bars_loaded);
        env_parse("CROSSMARKET_PERSIST_MS", &mut cfg.crossmarket_persist_ms);
        env_parse("EXIT_MAKER_ATTEMPTS", &mut cfg.exit_maker_attempts);
        env_parse("OI_POLL_SECS", &mut cfg.oi_poll_secs);
        env_parse("FUNDING_POLL_SECS", &mut cfg.funding_poll_secs);
        env_parse("GATE_A_TRENDINESS_MIN", &mut cfg.gate_a_trendiness_min);
        env_parse("GATE_A_CHOP_MAX", &mut cfg.gate_a_chop_max);
        env_parse("GATE_A_VOL_OF_VOL_MAX", &mut cfg.gate_a_vol_of_vol_max);
        env_parse("GATE_A_SPREAD_PCT_MAX", &mut cfg.gate_a_spread_pct_max);
        env_parse("GATE_A_OI_DROP_PCT", &mut cfg.gate_a_oi_drop_pct);
        env_parse("GATE_B_OBI_DEEP_MIN", &mut cfg.gate_b_obi_deep_min);
        env_parse("GATE_B_DELTA_Z_MIN", &mut cfg.gate_b_delta_z_min);
        env_parse("GATE_B_CVD_SLOPE_MIN", &mut cfg.gate_b_cvd_slope_min);
        env_parse("GATE_C_VWAP_DIST_MAX", &mut cfg.gate_c_vwap_dist_max);
        env_parse("GATE_C_VOL1M_MAX_PCT", &mut cfg.gate_c_vol1m_max_pct);
        env_parse("IMPULSE_PPS_MIN", &mut cfg.impulse_pps_min);
        env_parse("IMPULSE_DELTA_Z_MIN", &mut cfg.impulse_delta_z_min);
        env_parse("EXIT_TRENDINESS_MIN", &mut cfg.exit_trendiness_min);
        env_parse("EXIT_CHOP_MAX", &mut cfg.exit_chop_max);
        env_parse("INTEGRITY_EXIT_THRESHOLD", &mut cfg.integrity_exit_threshold);
        env_parse("EXIT_FLOW_OBI_MIN", &mut cfg.exit_flow_obi_min);
        env_parse("EXIT_FLOW_DELTA_Z_MIN", &mut cfg.exit_flow_delta_z_min);
        env_parse("ADD_OBI_MIN", &mut cfg.add_obi_min);
        env_parse("ADD_CVD_SLOPE_MIN", &mut cfg.add_cvd_slope_min);
        env_parse("ADD_OI_MIN_PCT", &mut cfg.add_oi_min_pct);
        env_parse("SMOOTH_ALPHA_DELTA_Z", &mut cfg.smooth_alpha_delta_z);
        env_parse("SMOOTH_ALPHA_OBI", &mut cfg.smooth_alpha_obi);
        env_parse("CVD_MEDIAN_WINDOW", &mut cfg.cvd_median_window);

        // The fallback ceiling is a hard invariant, not a tunable escape hatch.
        if cfg.max_fallback_notional_pct > 0.25 {
            warn!(
                requested = cfg.max_fallback_notional_pct,
                "MAX_FALLBACK_NOTIONAL_PCT clamped to 0.25"
            );
            cfg.max_fallback_notional_pct = 0.25;
        }

        cfg
    }
}

/// Parse an env var into `target`, leaving the default on absence or parse
/// failure (with a warning for the latter).
fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => warn!(var = name, value = %raw, "malformed env value ignored"),
        }
    }
}
