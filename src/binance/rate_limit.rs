// =============================================================================
// Rate-Limit Table — per-symbol REST throttling with exponential backoff
// =============================================================================
//
// One token per symbol: `{ last_request_ms, backoff_ms, backoff_until_ms }`.
// Requests for a symbol are spaced at least 500 ms apart. HTTP 429/418
// doubles the backoff (2 s floor, 30 s ceiling) and opens a cooldown window;
// any 2xx resets the ladder to 2 s.
//
// The table is process-wide and symbol-keyed; each entry is only mutated by
// the symbol task that owns it.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

/// Minimum spacing between REST requests for one symbol.
pub const THROTTLE_INTERVAL_MS: i64 = 500;
/// Backoff floor (also the reset value).
pub const BACKOFF_MIN_MS: i64 = 2_000;
/// Backoff ceiling.
pub const BACKOFF_MAX_MS: i64 = 30_000;

/// Depth limits the venue accepts.
const DEPTH_LIMITS: [u32; 7] = [5, 10, 20, 50, 100, 500, 1000];

/// Outcome of a pre-flight check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Allow,
    /// Caller must wait this long (throttle spacing or active backoff).
    Throttled { wait_ms: i64 },
}

#[derive(Debug, Clone, Copy)]
struct Token {
    last_request_ms: i64,
    backoff_ms: i64,
    backoff_until_ms: i64,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            last_request_ms: 0,
            backoff_ms: BACKOFF_MIN_MS,
            backoff_until_ms: 0,
        }
    }
}

/// Serialisable view of one symbol's token for the health payload.
#[derive(Debug, Clone, Serialize)]
pub struct TokenSnapshot {
    pub symbol: String,
    pub backoff_ms: i64,
    pub in_backoff: bool,
}

/// Process-wide, symbol-keyed rate-limit table.
#[derive(Debug, Default)]
pub struct RateLimitTable {
    tokens: RwLock<HashMap<String, Token>>,
}

impl RateLimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-flight check; records the request time when allowed.
    pub fn acquire(&self, symbol: &str, now_ms: i64) -> Permit {
        let mut tokens = self.tokens.write();
        let token = tokens.entry(symbol.to_string()).or_default();

        if now_ms < token.backoff_until_ms {
            return Permit::Throttled {
                wait_ms: token.backoff_until_ms - now_ms,
            };
        }

        let since_last = now_ms - token.last_request_ms;
        if since_last < THROTTLE_INTERVAL_MS {
            return Permit::Throttled {
                wait_ms: THROTTLE_INTERVAL_MS - since_last,
            };
        }

        token.last_request_ms = now_ms;
        Permit::Allow
    }

    /// Record the response status for a symbol's request.
    pub fn on_status(&self, symbol: &str, status: u16, now_ms: i64) {
        let mut tokens = self.tokens.write();
        let token = tokens.entry(symbol.to_string()).or_default();

        match status {
            429 | 418 => {
                token.backoff_ms = (token.backoff_ms * 2).min(BACKOFF_MAX_MS);
                token.backoff_until_ms = now_ms + token.backoff_ms;
                warn!(
                    symbol = %symbol,
                    status,
                    backoff_ms = token.backoff_ms,
                    "venue rate limit hit — backing off"
                );
            }
            200..=299 => {
                if token.backoff_ms != BACKOFF_MIN_MS {
                    debug!(symbol = %symbol, "rate-limit backoff reset");
                }
                token.backoff_ms = BACKOFF_MIN_MS;
                token.backoff_until_ms = 0;
            }
            _ => {
                // 5xx and friends: keep the current ladder, open a short
                // cooldown at the current backoff.
                token.backoff_until_ms = now_ms + token.backoff_ms;
            }
        }
    }

    /// Smallest venue-accepted depth limit >= the requested count.
    pub fn depth_limit_for(requested: u32) -> u32 {
        DEPTH_LIMITS
            .iter()
            .copied()
            .find(|&l| l >= requested)
            .unwrap_or(1000)
    }

    pub fn snapshot(&self, now_ms: i64) -> Vec<TokenSnapshot> {
        self.tokens
            .read()
            .iter()
            .map(|(symbol, t)| TokenSnapshot {
                symbol: symbol.clone(),
                backoff_ms: t.backoff_ms,
                in_backoff: now_ms < t.backoff_until_ms,
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_spacing_enforced() {
        let table = RateLimitTable::new();
        assert_eq!(table.acquire("BTCUSDT", 1_000), Permit::Allow);
        assert_eq!(
            table.acquire("BTCUSDT", 1_200),
            Permit::Throttled { wait_ms: 300 }
        );
        assert_eq!(table.acquire("BTCUSDT", 1_500), Permit::Allow);
    }

    #[test]
    fn symbols_are_independent() {
        let table = RateLimitTable::new();
        assert_eq!(table.acquire("BTCUSDT", 1_000), Permit::Allow);
        assert_eq!(table.acquire("ETHUSDT", 1_000), Permit::Allow);
    }

    #[test]
    fn http_429_doubles_backoff_to_ceiling() {
        let table = RateLimitTable::new();
        table.acquire("BTCUSDT", 0);

        table.on_status("BTCUSDT", 429, 0);
        let snap = &table.snapshot(1)[0];
        assert_eq!(snap.backoff_ms, 4_000);
        assert!(snap.in_backoff);

        table.on_status("BTCUSDT", 418, 0);
        table.on_status("BTCUSDT", 429, 0);
        table.on_status("BTCUSDT", 429, 0);
        assert_eq!(table.snapshot(1)[0].backoff_ms, 30_000);

        // Still throttled inside the window.
        match table.acquire("BTCUSDT", 10_000) {
            Permit::Throttled { wait_ms } => assert!(wait_ms > 0),
            other => panic!("expected throttle, got {other:?}"),
        }
    }

    #[test]
    fn success_resets_backoff() {
        let table = RateLimitTable::new();
        table.on_status("BTCUSDT", 429, 0);
        table.on_status("BTCUSDT", 200, 5_000);
        let snap = &table.snapshot(5_001)[0];
        assert_eq!(snap.backoff_ms, BACKOFF_MIN_MS);
        assert!(!snap.in_backoff);
    }

    #[test]
    fn depth_limit_rounds_up_to_valid_bucket() {
        assert_eq!(RateLimitTable::depth_limit_for(1), 5);
        assert_eq!(RateLimitTable::depth_limit_for(5), 5);
        assert_eq!(RateLimitTable::depth_limit_for(11), 20);
        assert_eq!(RateLimitTable::depth_limit_for(60), 100);
        assert_eq!(RateLimitTable::depth_limit_for(101), 500);
        assert_eq!(RateLimitTable::depth_limit_for(5_000), 1000);
    }
}
