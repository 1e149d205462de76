// =============================================================================
// Fill Sink — execution capability + in-process paper ledger
// =============================================================================
//
// The orchestrator never talks to the exchange order API; every order intent
// goes to a `FillSink`, and the sink's position view is adopted as the
// authoritative position each tick.
//
// `PaperLedger` is the in-process dry-run implementation: fills are idealized
// (maker intents fill at their limit price, takers at the current mark; one
// entry fill per symbol while flat) and realized PnL accumulates per symbol.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::types::{OrderIntent, OrderKind, Side};

/// The sink's authoritative view of one open position.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SinkPosition {
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub adds_used: u32,
    /// Unrealized PnL in percent of entry (+1.5 ≡ +1.5 %).
    pub unrealized_pnl_pct: f64,
}

/// Execution capability consumed by the symbol engine.
pub trait FillSink: Send + Sync {
    /// Submit one intent; `mark_price` prices taker fills.
    fn submit(&self, intent: &OrderIntent, mark_price: f64);

    /// Update the mark used for unrealized PnL.
    fn on_mark(&self, symbol: &str, price: f64);

    /// The current position for `symbol`, if any.
    fn position(&self, symbol: &str) -> Option<SinkPosition>;

    /// Cumulative realized PnL for `symbol` (quote units).
    fn realized_pnl(&self, symbol: &str) -> f64;

    /// Current equity for `symbol`: capital + realized + unrealized.
    fn equity(&self, symbol: &str) -> f64;
}

#[derive(Debug, Default)]
struct SymbolBook {
    position: Option<PaperPosition>,
    realized_pnl: f64,
    mark_price: f64,
}

#[derive(Debug, Clone, Copy)]
struct PaperPosition {
    side: Side,
    qty: f64,
    entry_vwap: f64,
    adds_used: u32,
}

/// In-process dry-run ledger.
pub struct PaperLedger {
    books: RwLock<HashMap<String, SymbolBook>>,
    starting_capital: f64,
}

impl PaperLedger {
    pub fn new(starting_capital: f64) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            starting_capital,
        }
    }

    fn fill_price(intent: &OrderIntent, mark_price: f64) -> f64 {
        intent.price.unwrap_or(mark_price)
    }
}

impl FillSink for PaperLedger {
    fn submit(&self, intent: &OrderIntent, mark_price: f64) {
        let mut books = self.books.write();
        let book = books.entry(intent.symbol.clone()).or_default();
        let price = Self::fill_price(intent, mark_price);
        if price <= 0.0 {
            return;
        }

        match intent.kind {
            OrderKind::MakerPostOnly | OrderKind::TakerEntryFallback => {
                let is_add = intent.reason.starts_with("ADD_");
                match &mut book.position {
                    None => {
                        book.position = Some(PaperPosition {
                            side: intent.side,
                            qty: intent.qty,
                            entry_vwap: price,
                            adds_used: 0,
                        });
                        debug!(symbol = %intent.symbol, side = %intent.side, qty = intent.qty, price, "paper entry filled");
                    }
                    Some(pos) if pos.side == intent.side && is_add => {
                        let total = pos.qty + intent.qty;
                        pos.entry_vwap =
                            (pos.entry_vwap * pos.qty + price * intent.qty) / total;
                        pos.qty = total;
                        pos.adds_used += 1;
                        debug!(symbol = %intent.symbol, qty = intent.qty, price, adds = pos.adds_used, "paper add filled");
                    }
                    // Extra chase layers while a position exists are ignored:
                    // one entry fill per symbol while flat.
                    Some(_) => {}
                }
            }
            OrderKind::MakerExit | OrderKind::TakerRiskExit => {
                if let Some(pos) = book.position.take() {
                    let closed = pos.qty.min(intent.qty);
                    let pnl = (price - pos.entry_vwap) * closed * pos.side.sign();
                    book.realized_pnl += pnl;

                    let remaining = pos.qty - closed;
                    if remaining > 0.0 {
                        book.position = Some(PaperPosition {
                            qty: remaining,
                            ..pos
                        });
                    }
                    debug!(symbol = %intent.symbol, closed, pnl, "paper exit filled");
                }
            }
        }
    }

    fn on_mark(&self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        let mut books = self.books.write();
        books.entry(symbol.to_string()).or_default().mark_price = price;
    }

    fn position(&self, symbol: &str) -> Option<SinkPosition> {
        let books = self.books.read();
        let book = books.get(symbol)?;
        let pos = book.position.as_ref()?;

        let unrealized_pnl_pct = if pos.entry_vwap > 0.0 && book.mark_price > 0.0 {
            (book.mark_price - pos.entry_vwap) / pos.entry_vwap * 100.0 * pos.side.sign()
        } else {
            0.0
        };

        Some(SinkPosition {
            side: pos.side,
            qty: pos.qty,
            entry_price: pos.entry_vwap,
            adds_used: pos.adds_used,
            unrealized_pnl_pct,
        })
    }

    fn realized_pnl(&self, symbol: &str) -> f64 {
        self.books
            .read()
            .get(symbol)
            .map(|b| b.realized_pnl)
            .unwrap_or(0.0)
    }

    fn equity(&self, symbol: &str) -> f64 {
        let books = self.books.read();
        match books.get(symbol) {
            Some(book) => {
                let unrealized = book
                    .position
                    .as_ref()
                    .filter(|_| book.mark_price > 0.0)
                    .map(|p| (book.mark_price - p.entry_vwap) * p.qty * p.side.sign())
                    .unwrap_or(0.0);
                self.starting_capital + book.realized_pnl + unrealized
            }
            None => self.starting_capital,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn maker(symbol: &str, side: Side, price: f64, qty: f64, reason: &str) -> OrderIntent {
        OrderIntent::new(symbol, side, OrderKind::MakerPostOnly, Some(price), qty, reason)
    }

    #[test]
    fn entry_add_exit_lifecycle() {
        let ledger = PaperLedger::new(1_000.0);

        ledger.submit(&maker("ETHUSDT", Side::Buy, 100.0, 1.0, "ENTRY_CHASE_L0"), 100.0);
        let p = ledger.position("ETHUSDT").unwrap();
        assert_eq!(p.qty, 1.0);
        assert_eq!(p.entry_price, 100.0);
        assert_eq!(p.adds_used, 0);

        // Second chase layer while holding: ignored.
        ledger.submit(&maker("ETHUSDT", Side::Buy, 99.9, 1.0, "ENTRY_CHASE_L1"), 100.0);
        assert_eq!(ledger.position("ETHUSDT").unwrap().qty, 1.0);

        // Add re-averages the VWAP.
        ledger.submit(&maker("ETHUSDT", Side::Buy, 94.5, 0.75, "ADD_1"), 94.5);
        let p = ledger.position("ETHUSDT").unwrap();
        assert_eq!(p.adds_used, 1);
        assert!((p.entry_price - (100.0 + 94.5 * 0.75) / 1.75).abs() < 1e-9);

        // Full taker exit realizes PnL.
        let exit = OrderIntent::new(
            "ETHUSDT",
            Side::Sell,
            OrderKind::TakerRiskExit,
            None,
            1.75,
            "EXIT",
        );
        ledger.submit(&exit, 98.0);
        assert!(ledger.position("ETHUSDT").is_none());
        let expected = (98.0 - (100.0 + 94.5 * 0.75) / 1.75) * 1.75;
        assert!((ledger.realized_pnl("ETHUSDT") - expected).abs() < 1e-9);
    }

    #[test]
    fn unrealized_pnl_is_percent_of_entry() {
        let ledger = PaperLedger::new(1_000.0);
        ledger.submit(&maker("ETHUSDT", Side::Buy, 100.0, 2.0, "ENTRY_CHASE_L0"), 100.0);
        ledger.on_mark("ETHUSDT", 103.0);
        let p = ledger.position("ETHUSDT").unwrap();
        assert!((p.unrealized_pnl_pct - 3.0).abs() < 1e-9);

        // Short positions invert the sign.
        ledger.submit(
            &OrderIntent::new("ETHUSDT", Side::Sell, OrderKind::TakerRiskExit, None, 2.0, "X"),
            103.0,
        );
        ledger.submit(&maker("ETHUSDT", Side::Sell, 103.0, 1.0, "ENTRY_CHASE_L0"), 103.0);
        ledger.on_mark("ETHUSDT", 100.0);
        let p = ledger.position("ETHUSDT").unwrap();
        assert!(p.unrealized_pnl_pct > 0.0);
    }

    #[test]
    fn equity_combines_capital_realized_unrealized() {
        let ledger = PaperLedger::new(1_000.0);
        assert_eq!(ledger.equity("ETHUSDT"), 1_000.0);

        ledger.submit(&maker("ETHUSDT", Side::Buy, 100.0, 1.0, "ENTRY_CHASE_L0"), 100.0);
        ledger.on_mark("ETHUSDT", 105.0);
        assert!((ledger.equity("ETHUSDT") - 1_005.0).abs() < 1e-9);
    }

    #[test]
    fn symbols_are_isolated() {
        let ledger = PaperLedger::new(1_000.0);
        ledger.submit(&maker("ETHUSDT", Side::Buy, 100.0, 1.0, "ENTRY_CHASE_L0"), 100.0);
        assert!(ledger.position("BTCUSDT").is_none());
        assert_eq!(ledger.realized_pnl("BTCUSDT"), 0.0);
    }
}
