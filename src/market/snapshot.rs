// =============================================================================
// Snapshot Resync — single-flight REST snapshot recovery after sequence gaps
// =============================================================================
//
// The book manager never talks to REST directly; it goes through the
// `SnapshotFetcher` capability so the engine, the depth API cache, and the
// tests can supply their own transport.
//
// Backoff policy: first retry after 2 s, doubling to a 30 s ceiling, reset on
// success. Exactly one fetch is in flight per symbol (`resync_pending` on the
// book is the guard); diffs arriving while pending are discarded upstream.
// =============================================================================

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;

use crate::market::frames::DepthSnapshot;

/// Minimum (initial) resync backoff.
pub const RESYNC_BACKOFF_MIN_MS: u64 = 2_000;
/// Backoff ceiling.
pub const RESYNC_BACKOFF_MAX_MS: u64 = 30_000;

/// Capability for fetching a depth snapshot. Implemented by the REST client;
/// mocked in tests.
pub trait SnapshotFetcher: Send + Sync {
    fn fetch_depth<'a>(
        &'a self,
        symbol: &'a str,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<DepthSnapshot>> + Send + 'a>>;
}

/// Per-symbol resync bookkeeping: backoff ladder plus attempt counters.
///
/// The driver holds no transport and never blocks; the owning engine task
/// spawns the actual fetch and reports the outcome back here.
#[derive(Debug, Clone)]
pub struct ResyncDriver {
    backoff_ms: u64,
    pub attempts: u64,
    pub completed: u64,
    pub consecutive_failures: u32,
}

impl ResyncDriver {
    pub fn new() -> Self {
        Self {
            backoff_ms: RESYNC_BACKOFF_MIN_MS,
            attempts: 0,
            completed: 0,
            consecutive_failures: 0,
        }
    }

    /// Delay to wait before the next fetch attempt.
    pub fn current_backoff_ms(&self) -> u64 {
        self.backoff_ms
    }

    /// Record the start of a fetch attempt.
    pub fn on_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Fetch failed: double the backoff up to the ceiling.
    pub fn on_failure(&mut self) {
        self.backoff_ms = (self.backoff_ms * 2).min(RESYNC_BACKOFF_MAX_MS);
        self.consecutive_failures += 1;
    }

    /// Fetch succeeded and the snapshot was accepted: reset the ladder.
    pub fn on_success(&mut self) {
        self.backoff_ms = RESYNC_BACKOFF_MIN_MS;
        self.completed += 1;
        self.consecutive_failures = 0;
    }
}

impl Default for ResyncDriver {
    fn default() -> Self {
        Self::new()
    }
}
