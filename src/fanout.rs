// =============================================================================
// Fan-out Hub — metrics + raw-frame broadcast to WebSocket subscribers
// =============================================================================
//
// Symbol engines publish; the transport layer filters per-subscriber symbol
// sets. Interest refcounts drive upstream stream reconfiguration through a
// watch channel: a symbol is streamed while either the static config or at
// least one subscriber wants it.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Broadcast buffer; slow subscribers lag and drop, they never block engines.
const CHANNEL_CAPACITY: usize = 1024;

/// One outbound payload, pre-serialised once per publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub symbol: String,
    pub json: Arc<String>,
}

pub struct FanoutHub {
    tx: broadcast::Sender<OutboundMessage>,
    clients: AtomicUsize,
    interest: RwLock<HashMap<String, usize>>,
    base_symbols: BTreeSet<String>,
    desired_tx: watch::Sender<BTreeSet<String>>,
}

impl FanoutHub {
    pub fn new(base_symbols: &[String]) -> Self {
        let base: BTreeSet<String> = base_symbols.iter().cloned().collect();
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (desired_tx, _) = watch::channel(base.clone());
        Self {
            tx,
            clients: AtomicUsize::new(0),
            interest: RwLock::new(HashMap::new()),
            base_symbols: base,
            desired_tx,
        }
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    /// Publish one payload for `symbol`. Send errors just mean "no
    /// subscribers right now".
    pub fn publish(&self, symbol: &str, json: String) {
        let _ = self.tx.send(OutboundMessage {
            symbol: symbol.to_string(),
            json: Arc::new(json),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Client bookkeeping
    // -------------------------------------------------------------------------

    pub fn client_connected(&self) -> usize {
        self.clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_disconnected(&self) -> usize {
        self.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Interest / upstream reconfiguration
    // -------------------------------------------------------------------------

    /// A subscriber added `symbol` to its set.
    pub fn add_interest(&self, symbol: &str) {
        {
            let mut interest = self.interest.write();
            *interest.entry(symbol.to_string()).or_insert(0) += 1;
        }
        self.push_desired();
    }

    /// A subscriber dropped `symbol` (or disconnected).
    pub fn remove_interest(&self, symbol: &str) {
        {
            let mut interest = self.interest.write();
            if let Some(count) = interest.get_mut(symbol) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    interest.remove(symbol);
                }
            }
        }
        self.push_desired();
    }

    /// Watch side for the upstream stream task.
    pub fn desired_symbols(&self) -> watch::Receiver<BTreeSet<String>> {
        self.desired_tx.subscribe()
    }

    pub fn current_desired(&self) -> BTreeSet<String> {
        self.desired_tx.borrow().clone()
    }

    fn push_desired(&self) {
        let mut desired = self.base_symbols.clone();
        desired.extend(self.interest.read().keys().cloned());
        if *self.desired_tx.borrow() != desired {
            debug!(symbols = ?desired, "desired upstream symbol set changed");
            let _ = self.desired_tx.send(desired);
        }
    }
}
