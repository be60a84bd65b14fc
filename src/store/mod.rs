//! Realtime store: reconciled market snapshots fed by [`WsEvent`]s.
//!
//! The store is the sole consumer of feed events. It does not know whether
//! they came from a live connection or the simulated feed.

pub mod snapshot;

pub use snapshot::{ApplyOutcome, MarketSnapshot};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::Stream;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use crate::domain::trade::{TradeUpdate, DEFAULT_TAPE_CAPACITY};
use crate::shared::Pair;
use crate::ws::{WireMessage, WsEvent};

/// Default capacity of the update broadcast channel.
pub const DEFAULT_UPDATE_BUFFER: usize = 1024;

/// Which part of a snapshot changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    OrderBook,
    Trade,
    Ticker,
    Candle,
}

impl From<&WireMessage> for UpdateKind {
    fn from(message: &WireMessage) -> Self {
        match message {
            WireMessage::OrderBook(_) => UpdateKind::OrderBook,
            WireMessage::Trade(_) => UpdateKind::Trade,
            WireMessage::Price(_) => UpdateKind::Ticker,
            WireMessage::Candle(_) => UpdateKind::Candle,
        }
    }
}

/// Notification sent after every applied message.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketUpdate {
    pub pair: Pair,
    pub kind: UpdateKind,
    /// The pair's snapshot right after the update.
    pub snapshot: MarketSnapshot,
}

/// Snapshots for every pair seen so far.
///
/// Snapshots are created on the first message for a pair and never removed.
pub struct RealtimeStore {
    markets: RwLock<BTreeMap<Pair, MarketSnapshot>>,
    connected: AtomicBool,
    trade_capacity: usize,
    updates_tx: broadcast::Sender<MarketUpdate>,
}

impl Default for RealtimeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TAPE_CAPACITY, DEFAULT_UPDATE_BUFFER)
    }

    pub fn with_capacity(trade_capacity: usize, update_buffer: usize) -> Self {
        let (updates_tx, _) = broadcast::channel(update_buffer.max(1));
        Self {
            markets: RwLock::new(BTreeMap::new()),
            connected: AtomicBool::new(false),
            trade_capacity,
            updates_tx,
        }
    }

    /// Apply one message and notify subscribers if it changed anything.
    pub fn apply(&self, message: &WireMessage) -> ApplyOutcome {
        let pair = message.pair().clone();
        let (outcome, snapshot) = {
            let mut markets = self.markets.write();
            let snapshot = markets.entry(pair.clone()).or_insert_with(|| {
                tracing::debug!("New market snapshot for {}", pair);
                MarketSnapshot::with_trade_capacity(pair.clone(), self.trade_capacity)
            });
            let outcome = snapshot.apply(message);
            (outcome, outcome.is_applied().then(|| snapshot.clone()))
        };

        match snapshot {
            Some(snapshot) => {
                // No receivers is not an error.
                let _ = self.updates_tx.send(MarketUpdate {
                    pair,
                    kind: UpdateKind::from(message),
                    snapshot,
                });
            }
            None => {
                tracing::debug!(
                    "Discarded {} for {} ({:?}, ts {})",
                    message.kind(),
                    pair,
                    outcome,
                    message.timestamp()
                );
            }
        }
        outcome
    }

    /// Handle one feed event.
    pub fn handle_event(&self, event: WsEvent) {
        match event {
            WsEvent::Connected => {
                self.connected.store(true, Ordering::SeqCst);
            }
            WsEvent::Disconnected { .. } | WsEvent::Reconnecting { .. } | WsEvent::Failed => {
                self.connected.store(false, Ordering::SeqCst);
            }
            WsEvent::Message(message) => {
                self.apply(&message);
            }
            WsEvent::Error(e) => {
                tracing::debug!("Feed error: {}", e);
            }
        }
    }

    /// Consume events until every sender is dropped.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<WsEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!("Feed event channel closed");
    }

    /// Load a page of trades (oldest first) through the same dedup and cap
    /// rules as live trades. Returns how many were accepted.
    pub fn seed_trades(&self, pair: &Pair, trades: Vec<TradeUpdate>) -> usize {
        let mut accepted = 0;
        for trade in trades {
            if trade.pair != *pair {
                tracing::warn!("Skipping seeded trade {} for {}, expected {}", trade.id, trade.pair, pair);
                continue;
            }
            if self.apply(&WireMessage::Trade(trade)).is_applied() {
                accepted += 1;
            }
        }
        tracing::debug!("Seeded {} trade(s) for {}", accepted, pair);
        accepted
    }

    pub fn snapshot(&self, pair: &Pair) -> Option<MarketSnapshot> {
        self.markets.read().get(pair).cloned()
    }

    /// All snapshots, ordered by pair.
    pub fn snapshots(&self) -> Vec<MarketSnapshot> {
        self.markets.read().values().cloned().collect()
    }

    pub fn pairs(&self) -> Vec<Pair> {
        self.markets.read().keys().cloned().collect()
    }

    /// Whether the feed source last reported itself connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Raw receiver for update notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketUpdate> {
        self.updates_tx.subscribe()
    }

    /// Update notifications as a stream. A slow consumer skips what it
    /// missed rather than ending the stream.
    pub fn updates(&self) -> impl Stream<Item = MarketUpdate> + Send + 'static {
        let mut rx = self.updates_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(update) => yield update,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Update stream lagged, skipped {} update(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
