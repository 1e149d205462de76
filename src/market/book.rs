// =============================================================================
// Order Book — snapshot + incremental diff reconstruction per symbol
// =============================================================================
//
// Sequence discipline (futures depth stream):
//   - A diff `U..u` is applicable iff `U <= last_update_id + 1 <= u` and
//     `u > last_update_id`.
//   - Anything else is a sequence gap and forces a snapshot resync.
//   - A crossed book after application is a protocol error, also forcing
//     resync.
//
// `last_update_id` is monotonically non-decreasing except across a resync.
// =============================================================================

use std::collections::BTreeMap;

use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::market::frames::{DepthDiff, DepthSnapshot};
use crate::types::BookUiState;

/// Price key with a total order (f64 has none).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Px(f64);

impl Eq for Px {}

impl PartialOrd for Px {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Px {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One ladder row in the outbound snapshot: price, size, running total.
/// Serialises as the wire triple `[price, size, cumulative]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
    pub cumulative: f64,
}

impl Serialize for BookLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&self.price)?;
        tup.serialize_element(&self.size)?;
        tup.serialize_element(&self.cumulative)?;
        tup.end()
    }
}

/// Result of applying an incremental diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Diff applied; book advanced to its `u`.
    Applied,
    /// Already-seen diff (`u <= last_update_id`); dropped silently.
    Stale,
    /// Sequence gap or protocol violation; caller must resync.
    Gap,
}

/// Reconstructed depth book for a single symbol.
#[derive(Debug, Clone)]
pub struct OrderBook {
    symbol: String,
    bids: BTreeMap<Px, f64>,
    asks: BTreeMap<Px, f64>,
    last_update_id: u64,
    /// Highest `u` observed on the stream, including discarded diffs. Used to
    /// reject snapshots older than what the stream has already shown us.
    max_seen_final_id: u64,
    pub last_depth_time_ms: i64,
    pub ui_state: BookUiState,
    pub resync_pending: bool,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            max_seen_final_id: 0,
            last_depth_time_ms: 0,
            ui_state: BookUiState::Resyncing,
            resync_pending: false,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Replace the book wholesale from a REST snapshot.
    ///
    /// A snapshot older than the newest `u` seen on the stream is ignored
    /// (returns false): applying it would rewind the sequence.
    pub fn apply_snapshot(&mut self, snap: &DepthSnapshot, now_ms: i64) -> bool {
        if snap.last_update_id < self.max_seen_final_id {
            warn!(
                symbol = %self.symbol,
                snapshot_id = snap.last_update_id,
                max_seen = self.max_seen_final_id,
                "stale depth snapshot ignored"
            );
            return false;
        }

        self.bids.clear();
        self.asks.clear();
        for &(price, size) in &snap.bids {
            if size > 0.0 {
                self.bids.insert(Px(price), size);
            }
        }
        for &(price, size) in &snap.asks {
            if size > 0.0 {
                self.asks.insert(Px(price), size);
            }
        }

        self.last_update_id = snap.last_update_id;
        self.max_seen_final_id = self.max_seen_final_id.max(snap.last_update_id);
        self.last_depth_time_ms = now_ms;
        self.ui_state = BookUiState::Live;
        self.resync_pending = false;
        true
    }

    /// Apply one incremental diff under the sequence rule.
    pub fn apply_diff(&mut self, diff: &DepthDiff) -> DiffOutcome {
        self.max_seen_final_id = self.max_seen_final_id.max(diff.final_update_id);

        // No snapshot yet: nothing to apply against.
        if self.last_update_id == 0 {
            return DiffOutcome::Gap;
        }

        // While a resync is pending every diff is discarded.
        if self.resync_pending {
            return DiffOutcome::Gap;
        }

        if diff.final_update_id <= self.last_update_id {
            return DiffOutcome::Stale;
        }

        if diff.first_update_id > self.last_update_id + 1 {
            warn!(
                symbol = %self.symbol,
                have = self.last_update_id,
                first = diff.first_update_id,
                "depth sequence gap"
            );
            return DiffOutcome::Gap;
        }

        for &(price, size) in &diff.bids {
            if size > 0.0 {
                self.bids.insert(Px(price), size);
            } else {
                self.bids.remove(&Px(price));
            }
        }
        for &(price, size) in &diff.asks {
            if size > 0.0 {
                self.asks.insert(Px(price), size);
            } else {
                self.asks.remove(&Px(price));
            }
        }

        self.last_update_id = diff.final_update_id;
        self.last_depth_time_ms = diff.event_time_ms;
        // A freshly applied diff clears any staleness flag.
        if self.ui_state == BookUiState::Stale {
            self.ui_state = BookUiState::Live;
        }

        // A crossed book is a protocol error, not a market condition.
        if let (Some(bb), Some(ba)) = (self.best_bid(), self.best_ask()) {
            if bb.0 >= ba.0 {
                warn!(
                    symbol = %self.symbol,
                    best_bid = bb.0,
                    best_ask = ba.0,
                    "crossed book after diff — forcing resync"
                );
                return DiffOutcome::Gap;
            }
        }

        DiffOutcome::Applied
    }

    /// Enter the resync state: ladder is no longer trustworthy, diffs are
    /// discarded until a fresh snapshot lands.
    pub fn mark_resyncing(&mut self) {
        self.ui_state = BookUiState::Resyncing;
        self.resync_pending = true;
    }

    /// Flag the book stale (no depth event within the freshness window)
    /// without discarding state.
    pub fn mark_stale(&mut self) {
        if self.ui_state == BookUiState::Live {
            self.ui_state = BookUiState::Stale;
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.iter().next_back().map(|(p, &s)| (p.0, s))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter().next().map(|(p, &s)| (p.0, s))
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bb, _)), Some((ba, _))) => Some((bb + ba) / 2.0),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let (bb, _) = self.best_bid()?;
        let (ba, _) = self.best_ask()?;
        let mid = (bb + ba) / 2.0;
        if mid > 0.0 {
            Some((ba - bb) / mid * 10_000.0)
        } else {
            None
        }
    }

    /// Resting size at an exact price on either side (0.0 when absent).
    pub fn level_size(&self, price: f64) -> f64 {
        let key = Px(price);
        self.bids
            .get(&key)
            .or_else(|| self.asks.get(&key))
            .copied()
            .unwrap_or(0.0)
    }

    /// Top `n` bid rows (descending) with cumulative size totals.
    pub fn top_bids(&self, n: usize) -> Vec<BookLevel> {
        let mut cumulative = 0.0;
        self.bids
            .iter()
            .rev()
            .take(n)
            .map(|(p, &s)| {
                cumulative += s;
                BookLevel {
                    price: p.0,
                    size: s,
                    cumulative,
                }
            })
            .collect()
    }

    /// Top `n` ask rows (ascending) with cumulative size totals.
    pub fn top_asks(&self, n: usize) -> Vec<BookLevel> {
        let mut cumulative = 0.0;
        self.asks
            .iter()
            .take(n)
            .map(|(p, &s)| {
                cumulative += s;
                BookLevel {
                    price: p.0,
                    size: s,
                    cumulative,
                }
            })
            .collect()
    }

    /// Order-book imbalance over the top `n` levels: bid volume - ask volume.
    pub fn obi(&self, n: usize) -> f64 {
        let bid_vol: f64 = self.bids.iter().rev().take(n).map(|(_, &s)| s).sum();
        let ask_vol: f64 = self.asks.iter().take(n).map(|(_, &s)| s).sum();
        bid_vol - ask_vol
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}
