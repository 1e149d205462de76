// =============================================================================
// Shared types used across the Meridian orderflow engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Taker side of an aggressive trade, or the direction of a position/intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposing side.
    pub fn flip(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1.0 for Buy, -1.0 for Sell.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Coarse direction of a scalar series (CVD slope sign, OI direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trend {
    Up,
    Down,
    Flat,
}

impl Trend {
    pub fn from_signed(x: f64, eps: f64) -> Self {
        if x > eps {
            Self::Up
        } else if x < -eps {
            Self::Down
        } else {
            Self::Flat
        }
    }
}

/// High-level intent attached to a decision or advisor policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intent {
    Enter,
    Add,
    Reduce,
    Exit,
    Hold,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enter => "ENTER",
            Self::Add => "ADD",
            Self::Reduce => "REDUCE",
            Self::Exit => "EXIT",
            Self::Hold => "HOLD",
        };
        write!(f, "{s}")
    }
}

/// Client-visible lifecycle of a symbol's orderbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookUiState {
    Live,
    Stale,
    Resyncing,
}

impl std::fmt::Display for BookUiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Stale => write!(f, "STALE"),
            Self::Resyncing => write!(f, "RESYNCING"),
        }
    }
}

/// A single aggressive trade print with its inferred taker side.
///
/// `side` is `None` when the print could not be classified against the book
/// (price strictly inside the spread); such prints are forwarded raw but never
/// fed to the aggregators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradePrint {
    pub price: f64,
    pub qty: f64,
    pub side: Option<Side>,
    pub timestamp_ms: i64,
}

/// Execution style of an emitted order intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    /// Passive post-only entry/add layer.
    MakerPostOnly,
    /// Passive exit attempt at the best opposing quote.
    MakerExit,
    /// Small taker entry after a chase timeout.
    TakerEntryFallback,
    /// Market exit closing the position (at most one per exit episode).
    TakerRiskExit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MakerPostOnly => "MAKER_POST_ONLY",
            Self::MakerExit => "MAKER_EXIT",
            Self::TakerEntryFallback => "TAKER_ENTRY_FALLBACK",
            Self::TakerRiskExit => "TAKER_RISK_EXIT",
        };
        write!(f, "{s}")
    }
}

/// An order the engine wants executed. Consumed by the `FillSink` capability;
/// the engine never talks to the exchange order API directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    /// UUID v4, unique per emitted intent.
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    /// Limit price for maker intents; `None` for market intents.
    pub price: Option<f64>,
    pub qty: f64,
    /// Fraction of the per-symbol max notional this intent represents.
    /// Capped at 0.25 for `TakerEntryFallback`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional_pct: Option<f64>,
    /// Resting-time hint for maker layers; the sink cancels after this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<i64>,
    pub reason: String,
}

impl OrderIntent {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        kind: OrderKind,
        price: Option<f64>,
        qty: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            kind,
            price,
            qty,
            notional_pct: None,
            ttl_ms: None,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_flip_and_sign() {
        assert_eq!(Side::Buy.flip(), Side::Sell);
        assert_eq!(Side::Sell.flip(), Side::Buy);
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
    }

    #[test]
    fn trend_from_signed_uses_epsilon() {
        assert_eq!(Trend::from_signed(0.5, 0.1), Trend::Up);
        assert_eq!(Trend::from_signed(-0.5, 0.1), Trend::Down);
        assert_eq!(Trend::from_signed(0.05, 0.1), Trend::Flat);
    }

    #[test]
    fn serde_screaming_variants() {
        let json = serde_json::to_string(&OrderKind::TakerEntryFallback).unwrap();
        assert_eq!(json, "\"TAKER_ENTRY_FALLBACK\"");
        let side: Side = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(side, Side::Sell);
    }
}
