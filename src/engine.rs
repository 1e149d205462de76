// =============================================================================
// Symbol Engine — one task per symbol, strict arrival-order pipeline
// =============================================================================
//
// Owns the book, flow aggregators, state extractor, orchestrator runtime, and
// governor for exactly one symbol. Events (decoded frames, snapshot results,
// aggregate ticks) arrive on an mpsc channel and are processed in order; the
// only awaited operations are the resync snapshot fetch (spawned, single
// flight) and the advisor call (bounded deadline).
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::advisor::{advise_with_deadline, PolicyAdvisor};
use crate::app_state::{AppState, CachedDepth};
use crate::config::EngineConfig;
use crate::equity::EquityStore;
use crate::fills::FillSink;
use crate::flow::{
    AbsorptionDetector, LegacyTracker, MultiTimeframeCvd, RegimeTracker, TimeAndSales,
    VpinCalculator,
};
use crate::governor::{GovernorSnapshot, PolicyInput, RiskGovernor};
use crate::market::book::{DiffOutcome, OrderBook};
use crate::market::frames::{AggTrade, DepthSnapshot, VenueFrame};
use crate::market::snapshot::{ResyncDriver, SnapshotFetcher};
use crate::orchestrator::{
    CrossMarketContext, HtfInputs, Orchestrator, OrchestratorTick, ReadinessInput,
};
use crate::state::{DerivativesState, FeatureInputs, StateExtractor};
use crate::types::{BookUiState, Intent, OrderKind, Side};

/// Depth levels requested on resync.
const RESYNC_DEPTH_LIMIT: u32 = 500;
/// Consecutive resync failures after which the symbol is quarantined.
const QUARANTINE_FAILURES: u32 = 10;
/// Book freshness window; beyond this no intents are emitted.
const BOOK_STALE_MS: i64 = 3_000;
/// Ladder depth published to subscribers and the depth cache.
const LADDER_LEVELS: usize = 20;

/// One event in a symbol's strict processing order.
#[derive(Debug)]
pub enum SymbolEvent {
    Frame(VenueFrame),
    /// Result of a resync snapshot fetch (error stringified for transport).
    SnapshotResult(Result<DepthSnapshot, String>),
    /// Result of an advisor call issued on an earlier tick.
    AdvisorResult { policy: PolicyInput, fallback: bool },
    Tick { now_ms: i64 },
}

// ---------------------------------------------------------------------------
// HTF tracker — hourly/4h bars from mid samples
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct HtfBar {
    open_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

#[derive(Debug, Default)]
struct HtfTracker {
    h1: VecDeque<HtfBar>,
    h4: VecDeque<HtfBar>,
}

impl HtfTracker {
    fn on_mid(&mut self, mid: f64, now_ms: i64) {
        Self::roll(&mut self.h1, mid, now_ms, 3_600_000, 48);
        Self::roll(&mut self.h4, mid, now_ms, 14_400_000, 24);
    }

    fn roll(bars: &mut VecDeque<HtfBar>, mid: f64, now_ms: i64, span_ms: i64, cap: usize) {
        let open_ms = now_ms - now_ms.rem_euclid(span_ms);
        match bars.back_mut() {
            Some(bar) if bar.open_ms == open_ms => {
                bar.high = bar.high.max(mid);
                bar.low = bar.low.min(mid);
                bar.close = mid;
            }
            _ => {
                bars.push_back(HtfBar {
                    open_ms,
                    open: mid,
                    high: mid,
                    low: mid,
                    close: mid,
                });
                while bars.len() > cap {
                    bars.pop_front();
                }
            }
        }
    }

    fn bar_start(bars: &VecDeque<HtfBar>) -> Option<i64> {
        bars.back().map(|b| b.open_ms)
    }

    /// Both of the last two completed bars closed in the same direction.
    fn directional(bars: &VecDeque<HtfBar>) -> (bool, bool) {
        let n = bars.len();
        if n < 3 {
            return (false, false);
        }
        let a = &bars[n - 3];
        let b = &bars[n - 2];
        let up = a.close > a.open && b.close > b.open;
        let dn = a.close < a.open && b.close < b.open;
        (up, dn)
    }

    /// Swing levels over completed h1 bars plus break flags for `mid`.
    fn inputs(&self, mid: f64) -> HtfInputs {
        let n = self.h1.len();
        if n < 2 {
            return HtfInputs::default();
        }
        let completed = self.h1.iter().take(n - 1);
        let mut swing_high = f64::MIN;
        let mut swing_low = f64::MAX;
        for bar in completed {
            swing_high = swing_high.max(bar.high);
            swing_low = swing_low.min(bar.low);
        }
        if swing_high == f64::MIN {
            return HtfInputs::default();
        }

        HtfInputs {
            swing_high,
            swing_low,
            structure_break_up: mid > swing_high * 1.002,
            structure_break_dn: mid < swing_low * 0.998,
        }
    }
}

// ---------------------------------------------------------------------------
// Symbol engine
// ---------------------------------------------------------------------------

pub struct SymbolEngine {
    symbol: String,
    cfg: EngineConfig,
    app: Arc<AppState>,

    book: OrderBook,
    resync: ResyncDriver,
    tas: TimeAndSales,
    cvd: MultiTimeframeCvd,
    absorption: AbsorptionDetector,
    legacy: LegacyTracker,
    vpin: VpinCalculator,
    regime: RegimeTracker,
    htf: HtfTracker,
    extractor: StateExtractor,
    orchestrator: Orchestrator,
    governor: RiskGovernor,

    fetcher: Arc<dyn SnapshotFetcher>,
    sink: Arc<dyn FillSink>,
    advisor: Option<Arc<dyn PolicyAdvisor>>,
    equity_store: Arc<EquityStore>,

    tx_self: mpsc::Sender<SymbolEvent>,
    session_start_ms: i64,
    last_now_ms: i64,
    backfill_done: bool,
    /// Single-flight guard for the advisor; frames keep flowing while a call
    /// is pending.
    advisor_pending: bool,
    /// Most recent advisor policy; applied on the tick after it arrives.
    last_policy: Option<PolicyInput>,
}

impl SymbolEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        cfg: EngineConfig,
        app: Arc<AppState>,
        sink: Arc<dyn FillSink>,
        advisor: Option<Arc<dyn PolicyAdvisor>>,
        equity_store: Arc<EquityStore>,
        tx_self: mpsc::Sender<SymbolEvent>,
    ) -> Self {
        let symbol = symbol.into();
        let fetcher: Arc<dyn SnapshotFetcher> = app.rest.clone();
        Self {
            book: OrderBook::new(symbol.clone()),
            resync: ResyncDriver::new(),
            tas: TimeAndSales::new(),
            cvd: MultiTimeframeCvd::new(),
            absorption: AbsorptionDetector::new(),
            legacy: LegacyTracker::new(),
            vpin: VpinCalculator::default(),
            regime: RegimeTracker::new(),
            htf: HtfTracker::default(),
            extractor: StateExtractor::new(),
            orchestrator: Orchestrator::new(symbol.clone(), cfg.clone()),
            governor: RiskGovernor::new(cfg.clone()),
            fetcher,
            sink,
            advisor,
            equity_store,
            tx_self,
            session_start_ms: 0,
            last_now_ms: 0,
            backfill_done: false,
            advisor_pending: false,
            last_policy: None,
            symbol,
            cfg,
            app,
        }
    }

    /// Replace the snapshot fetcher (tests).
    #[cfg(test)]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<SymbolEvent>) {
        info!(symbol = %self.symbol, "symbol engine started");
        // The book starts empty: kick off the initial snapshot immediately.
        self.request_snapshot(0);

        while let Some(ev) = rx.recv().await {
            self.handle_event(ev).await;
        }
        info!(symbol = %self.symbol, "symbol engine stopped");
    }

    pub async fn handle_event(&mut self, ev: SymbolEvent) {
        match ev {
            SymbolEvent::Frame(frame) => self.on_frame(frame),
            SymbolEvent::SnapshotResult(result) => self.on_snapshot_result(result),
            SymbolEvent::AdvisorResult { policy, fallback } => {
                self.advisor_pending = false;
                if fallback {
                    self.orchestrator.runtime.telemetry.invalid_llm_responses += 1;
                }
                self.last_policy = Some(policy);
            }
            SymbolEvent::Tick { now_ms } => self.on_tick(now_ms),
        }
    }

    // -------------------------------------------------------------------------
    // Frames
    // -------------------------------------------------------------------------

    fn on_frame(&mut self, frame: VenueFrame) {
        match frame {
            VenueFrame::Depth { diff, .. } => {
                self.note_time(diff.event_time_ms);
                match self.book.apply_diff(&diff) {
                    DiffOutcome::Applied | DiffOutcome::Stale => {}
                    DiffOutcome::Gap => self.trigger_resync(),
                }
            }
            VenueFrame::Trade(trade) => {
                self.note_time(trade.event_time_ms);
                self.on_trade(trade);
            }
            // Passthrough frames are forwarded by the stream task; nothing
            // here consumes them.
            VenueFrame::Passthrough { .. } | VenueFrame::Unknown(_) => {}
        }
    }

    fn note_time(&mut self, ts_ms: i64) {
        if self.session_start_ms == 0 && ts_ms > 0 {
            self.session_start_ms = ts_ms;
        }
        if ts_ms > self.last_now_ms {
            self.last_now_ms = ts_ms;
        }
    }

    /// Classify the print against the current book and feed the aggregators.
    fn on_trade(&mut self, trade: AggTrade) {
        let best_bid = self.book.best_bid().map(|(p, _)| p);
        let best_ask = self.book.best_ask().map(|(p, _)| p);

        let side = match (best_bid, best_ask) {
            (Some(bb), Some(ba)) => {
                if trade.price >= ba {
                    Some(Side::Buy)
                } else if trade.price <= bb {
                    Some(Side::Sell)
                } else {
                    None
                }
            }
            _ => None,
        };

        // Unclassified prints are forwarded raw upstream but never feed the
        // aggregators.
        let side = match side {
            Some(s) => s,
            None => return,
        };

        let ts = trade.trade_time_ms;
        self.tas.on_print(ts, trade.event_time_ms, trade.qty, side);
        self.cvd.on_print(ts, trade.qty, side);
        self.legacy.on_print(ts, trade.price, trade.qty, side);
        self.vpin.on_print(trade.qty, side);

        let level_size = self.book.level_size(trade.price);
        self.absorption.on_print(trade.price, side, level_size, ts);
    }

    // -------------------------------------------------------------------------
    // Resync
    // -------------------------------------------------------------------------

    fn trigger_resync(&mut self) {
        if self.book.resync_pending {
            // Single flight: one fetch per gap episode.
            return;
        }
        self.book.mark_resyncing();
        self.request_snapshot(0);
    }

    fn request_snapshot(&mut self, delay_ms: u64) {
        self.book.resync_pending = true;
        self.resync.on_attempt();

        let fetcher = self.fetcher.clone();
        let tx = self.tx_self.clone();
        let symbol = self.symbol.clone();
        tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
            let result = fetcher
                .fetch_depth(&symbol, RESYNC_DEPTH_LIMIT)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(SymbolEvent::SnapshotResult(result)).await;
        });
    }

    fn on_snapshot_result(&mut self, result: Result<DepthSnapshot, String>) {
        match result {
            Ok(snap) => {
                if self.book.apply_snapshot(&snap, self.last_now_ms) {
                    self.resync.on_success();
                    self.backfill_done = true;
                    info!(
                        symbol = %self.symbol,
                        last_update_id = snap.last_update_id,
                        "book resynced"
                    );
                } else {
                    // Older than the stream: retry after backoff.
                    self.resync.on_failure();
                    let delay = self.resync.current_backoff_ms();
                    warn!(symbol = %self.symbol, delay_ms = delay, "stale snapshot — retrying");
                    self.request_snapshot(delay);
                }
            }
            Err(e) => {
                self.resync.on_failure();
                let delay = self.resync.current_backoff_ms();
                warn!(symbol = %self.symbol, error = %e, delay_ms = delay, "snapshot fetch failed — retrying");

                // Persistent divergence quarantines the symbol: no new
                // orders, book stays RESYNCING, operator clears it.
                if self.resync.consecutive_failures >= QUARANTINE_FAILURES
                    && !self.orchestrator.runtime.quarantined
                {
                    warn!(
                        symbol = %self.symbol,
                        failures = self.resync.consecutive_failures,
                        "resync diverged — quarantining symbol"
                    );
                    self.orchestrator.quarantine();
                }

                self.request_snapshot(delay);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Aggregate tick
    // -------------------------------------------------------------------------

    fn on_tick(&mut self, now_ms: i64) {
        self.note_time(now_ms);

        // Freshness: a silent depth feed flags the book stale.
        if self.book.ui_state == BookUiState::Live
            && self.book.last_depth_time_ms > 0
            && now_ms - self.book.last_depth_time_ms > BOOK_STALE_MS
        {
            self.book.mark_stale();
        }

        let mid = self.book.mid_price().unwrap_or(0.0);
        if mid > 0.0 {
            self.regime.on_mid(mid, now_ms);
            self.htf.on_mid(mid, now_ms);
            self.sink.on_mark(&self.symbol, mid);
        }
        self.legacy.sample(now_ms);
        self.cvd.sample(now_ms);

        // ── Aggregator snapshots ────────────────────────────────────────
        let tas = self.tas.snapshot(now_ms);
        let cvd = self.cvd.snapshot();
        let absorption = self.absorption.snapshot();
        let legacy = self.legacy.snapshot(&self.book);
        let vpin = self.vpin.snapshot();
        let regime = self.regime.snapshot();
        let oi = self.app.intel.oi(&self.symbol);
        let funding = self.app.intel.funding(&self.symbol);

        let spread_bps = self.book.spread_bps().unwrap_or(0.0);
        let expected_slippage_bps = self.expected_slippage_bps(mid);

        // ── Deterministic state ─────────────────────────────────────────
        let features = FeatureInputs {
            delta_z: legacy.delta_z,
            delta_1s: legacy.delta_1s,
            cvd_1m: cvd.cvd_1m,
            cvd_slope: legacy.cvd_slope,
            obi_weighted: legacy.obi_weighted,
            obi_deep: legacy.obi_deep,
            absorption_value: absorption.value,
            absorption_side: absorption.side,
            aggressive_imbalance: tas.buy_volume - tas.sell_volume,
            trendiness: regime.trendiness,
            chop: regime.chop,
            volatility_percentile: regime.volatility_percentile,
            vol_of_vol: regime.vol_of_vol,
            oi_change_pct: oi.as_ref().map(|o| o.change_pct).unwrap_or(0.0),
            perp_basis: funding.as_ref().map(|f| f.basis).unwrap_or(0.0),
            vpin: vpin.vpin,
            burst_score: tas.burst_score,
            burst_side: tas.burst_side,
            impact: legacy.impact,
            spread_bps,
            expected_slippage_bps,
            near_book_volume: self.book.top_bids(10).last().map(|l| l.cumulative).unwrap_or(0.0)
                + self.book.top_asks(10).last().map(|l| l.cumulative).unwrap_or(0.0),
        };
        let state = self.extractor.extract(&features);

        // ── Orchestrator input ──────────────────────────────────────────
        let position = self.sink.position(&self.symbol);
        let is_btc = self.symbol.starts_with("BTC");
        let btc_ctx = if is_btc {
            CrossMarketContext::default()
        } else {
            *self.app.btc_context.read()
        };

        let htf_inputs = self.htf.inputs(mid);
        let bars_loaded_1m = if self.session_start_ms > 0 {
            ((now_ms - self.session_start_ms) / self.cfg.bar_interval_ms).max(0) as u32
        } else {
            0
        };

        let tick = OrchestratorTick {
            now_ms,
            price: mid,
            best_bid: self.book.best_bid().map(|(p, _)| p).unwrap_or(0.0),
            best_ask: self.book.best_ask().map(|(p, _)| p).unwrap_or(0.0),
            spread_pct: if mid > 0.0 { spread_bps / 10_000.0 } else { 0.0 },
            prints_per_second: tas.prints_per_second,
            delta_z: legacy.delta_z,
            obi_weighted: legacy.obi_weighted,
            obi_deep: legacy.obi_deep,
            cvd_slope: legacy.cvd_slope,
            cvd_5m: cvd.cvd_5m,
            trendiness: regime.trendiness,
            chop: regime.chop,
            vol_of_vol: regime.vol_of_vol,
            realized_vol_1m_pct: regime.realized_vol_1m_pct,
            atr_3m: regime.atr_3m,
            oi_change_pct: oi.as_ref().map(|o| o.change_pct).unwrap_or(0.0),
            book_integrity: if self.book.ui_state == BookUiState::Live {
                0.0
            } else {
                1.0
            },
            state,
            readiness: ReadinessInput {
                backfill_done: self.backfill_done,
                bars_loaded_1m,
                session_vwap: legacy.vwap,
                htf_h1_bar_start: HtfTracker::bar_start(&self.htf.h1),
                htf_h4_bar_start: HtfTracker::bar_start(&self.htf.h4),
            },
            dry_run_position: position,
            btc: btc_ctx,
            htf: htf_inputs,
        };

        let decision = self.orchestrator.evaluate(&tick);

        // ── Advisor (spawned, single flight) + governor ─────────────────
        // The symbol task never blocks on the advisor: the call runs beside
        // the event loop, and its policy is applied from the next tick on.
        if let Some(advisor) = &self.advisor {
            if !self.advisor_pending {
                self.advisor_pending = true;
                let advisor = advisor.clone();
                let tx = self.tx_self.clone();
                let timeout_ms = self.cfg.policy_timeout_ms;
                tokio::spawn(async move {
                    let advised =
                        advise_with_deadline(advisor.as_ref(), &state, position.as_ref(), timeout_ms)
                            .await;
                    let _ = tx
                        .send(SymbolEvent::AdvisorResult {
                            policy: advised.policy,
                            fallback: advised.fallback,
                        })
                        .await;
                });
            }
        }

        // Intent and side always come from the deterministic decision; the
        // advisor contributes sizing hints only, so a failed or hostile
        // advisor can never flip or veto the core path.
        let mut policy = PolicyInput {
            intent: decision.intent,
            side: decision.side,
            risk_multiplier: 1.0,
            confidence: state.state_confidence,
        };
        if let Some(advice) = self.last_policy {
            policy.risk_multiplier = advice.risk_multiplier;
            policy.confidence = policy.confidence.max(advice.confidence);
        }

        let equity = self.sink.equity(&self.symbol);
        let day_start_equity =
            self.equity_store
                .day_start(&EquityStore::today(), &self.symbol, equity);

        let governor_snapshot = GovernorSnapshot {
            position,
            current_notional: position.map(|p| p.qty * mid).unwrap_or(0.0),
            equity,
            day_start_equity,
            trend_side: decision.side,
            trendiness: regime.trendiness,
            signal_score: state.state_confidence,
            hard_liq_risk: state.derivatives == DerivativesState::SqueezeRisk,
        };
        let governed = self.governor.govern(policy, &state, &governor_snapshot);

        // ── Emit orders through the guardrails ──────────────────────────
        let mut orders = decision.orders.clone();

        // No intents off a stale or resyncing book.
        if self.book.ui_state != BookUiState::Live {
            orders.clear();
        }
        // The governor can veto new exposure and (rule 7) realizations.
        if governed.intent == Intent::Hold && decision.intent != Intent::Hold {
            orders.clear();
        }
        for order in &mut orders {
            if matches!(
                order.kind,
                OrderKind::MakerPostOnly | OrderKind::TakerEntryFallback
            ) {
                order.qty *= governed.risk_multiplier;
            }
        }
        for order in &orders {
            debug!(symbol = %self.symbol, kind = %order.kind, qty = order.qty, "order intent emitted");
            self.sink.submit(order, mid);
        }

        // ── BTC cross-market publication ────────────────────────────────
        if is_btc {
            let (h1_up, h1_dn) = HtfTracker::directional(&self.htf.h1);
            let (h4_up, h4_dn) = HtfTracker::directional(&self.htf.h4);
            *self.app.btc_context.write() = CrossMarketContext {
                h1_up,
                h4_up,
                h1_dn,
                h4_dn,
                btc_position_side: position.map(|p| p.side),
                hard_veto: true,
            };
        }

        // ── Depth cache + metrics snapshot fan-out ──────────────────────
        let bids = self.book.top_bids(LADDER_LEVELS);
        let asks = self.book.top_asks(LADDER_LEVELS);
        self.app.cache_depth(
            &self.symbol,
            CachedDepth {
                last_update_id: self.book.last_update_id(),
                bids: bids.clone(),
                asks: asks.clone(),
                cached_at_ms: now_ms,
            },
        );

        let metrics = json!({
            "type": "metrics",
            "symbol": self.symbol,
            "state": self.book.ui_state,
            "timeAndSales": tas,
            "cvd": cvd,
            "absorption": absorption,
            "openInterest": oi,
            "funding": funding,
            "legacyMetrics": legacy,
            "vpin": vpin,
            "regime": regime,
            "deterministicState": state,
            "bids": bids,
            "asks": asks,
            "midPrice": mid,
            "lastUpdateId": self.book.last_update_id(),
            "decision": decision,
            "governed": governed,
            "eventTimeMs": now_ms,
        });
        self.app.hub.publish(&self.symbol, metrics.to_string());
    }

    /// Average bps paid crossing the book for one base-quantity notional,
    /// averaged over both sides.
    fn expected_slippage_bps(&self, mid: f64) -> f64 {
        if mid <= 0.0 {
            return 0.0;
        }
        let notional = self.cfg.base_qty_notional;
        let buy = side_slippage_bps(&self.book.top_asks(50), notional, mid);
        let sell = side_slippage_bps(&self.book.top_bids(50), notional, mid);
        match (buy, sell) {
            (Some(b), Some(s)) => (b + s) / 2.0,
            (Some(x), None) | (None, Some(x)) => x,
            (None, None) => 0.0,
        }
    }
}

/// Walk one side of the ladder filling `notional`; average fill vs mid.
fn side_slippage_bps(
    levels: &[crate::market::book::BookLevel],
    notional: f64,
    mid: f64,
) -> Option<f64> {
    if levels.is_empty() || notional <= 0.0 {
        return None;
    }
    let mut remaining_qty = notional / mid;
    let mut cost = 0.0;
    let mut filled = 0.0;
    for level in levels {
        let take = remaining_qty.min(level.size);
        cost += take * level.price;
        filled += take;
        remaining_qty -= take;
        if remaining_qty <= 0.0 {
            break;
        }
    }
    if filled <= 0.0 {
        return None;
    }
    let avg = cost / filled;
    Some(((avg - mid).abs() / mid) * 10_000.0)
}
