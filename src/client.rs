//! High-level client: `RealtimeClient`, the composition root.
//!
//! Owns one `ResilientClient`, one `RealtimeStore` and one feed source. The
//! feed is a live `ConnectionManager` when a WebSocket URL is configured and
//! the simulated feed otherwise; the store cannot tell them apart.

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use reqwest::Url;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::trade::DEFAULT_TAPE_CAPACITY;
use crate::error::{ClientError, RequestError};
use crate::feed::{FeedHandle, SimulatedFeed, SimulatedFeedConfig};
use crate::http::{RequestOptions, ResilienceConfig, ResilientClient};
use crate::network::{url_from_env, API_URL_ENV, DEFAULT_API_URL, WS_URL_ENV};
use crate::resilience::cache::DEFAULT_SWEEP_INTERVAL;
use crate::resilience::{BatcherConfig, CircuitBreakerConfig, RetryConfig};
use crate::shared::Pair;
use crate::store::{MarketSnapshot, MarketUpdate, RealtimeStore, DEFAULT_UPDATE_BUFFER};
use crate::ws::native::ConnectionManager;
use crate::ws::{ConnectionStatus, SubscribeParams, UnsubscribeParams, WsConfig, WsEvent};

/// Which source feeds the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Live,
    Simulated,
}

enum Feed {
    Live(ConnectionManager),
    Simulated {
        config: SimulatedFeedConfig,
        handle: Option<FeedHandle>,
    },
}

/// The primary entry point.
///
/// Call [`start`](Self::start) to begin pumping feed events into the store.
pub struct RealtimeClient {
    rest: ResilientClient,
    store: Arc<RealtimeStore>,
    feed: Feed,
    events_tx: mpsc::Sender<WsEvent>,
    events_rx: Option<mpsc::Receiver<WsEvent>>,
    event_buffer: usize,
    pump: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    sweep_interval: Duration,
}

impl RealtimeClient {
    pub fn builder() -> RealtimeClientBuilder {
        RealtimeClientBuilder::default()
    }

    pub fn mode(&self) -> FeedMode {
        match self.feed {
            Feed::Live(_) => FeedMode::Live,
            Feed::Simulated { .. } => FeedMode::Simulated,
        }
    }

    pub fn rest(&self) -> &ResilientClient {
        &self.rest
    }

    pub fn store(&self) -> &Arc<RealtimeStore> {
        &self.store
    }

    /// The live connection, if running in live mode.
    pub fn connection(&self) -> Option<&ConnectionManager> {
        match &self.feed {
            Feed::Live(manager) => Some(manager),
            Feed::Simulated { .. } => None,
        }
    }

    /// Start the store pump, the cache sweeper, and the feed.
    ///
    /// Idempotent, and valid again after [`shutdown`](Self::shutdown).
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if self.pump.is_none() {
            let rx = match self.events_rx.take() {
                Some(rx) => rx,
                None => self.reopen_events(),
            };
            self.pump = Some(tokio::spawn(Arc::clone(&self.store).run(rx)));
        }
        if self.sweeper.is_none() && !self.sweep_interval.is_zero() {
            self.sweeper = Some(self.rest.cache().spawn_sweeper(self.sweep_interval));
        }

        match &mut self.feed {
            Feed::Live(manager) => {
                if manager.status() == ConnectionStatus::Disconnected
                    || manager.status() == ConnectionStatus::Failed
                {
                    manager.connect().await?;
                }
            }
            Feed::Simulated { config, handle } => {
                if handle.as_ref().map_or(true, FeedHandle::is_finished) {
                    tracing::info!("No WebSocket URL configured, using simulated feed");
                    *handle =
                        Some(SimulatedFeed::new(config.clone()).spawn(self.events_tx.clone()));
                }
            }
        }
        Ok(())
    }

    /// Stop the feed and background tasks. The store keeps its snapshots.
    ///
    /// The event channel goes away with the pump; the next `start()` opens a
    /// new one.
    pub async fn shutdown(&mut self) {
        match &mut self.feed {
            Feed::Live(manager) => manager.disconnect().await,
            Feed::Simulated { handle, .. } => {
                if let Some(h) = handle.take() {
                    h.stop().await;
                }
            }
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.store.handle_event(WsEvent::Disconnected {
            code: None,
            reason: "client shutdown".to_string(),
        });
        tracing::info!("Realtime client shut down");
    }

    /// Fresh event channel for a restart. The feed must be stopped.
    fn reopen_events(&mut self) -> mpsc::Receiver<WsEvent> {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        if let Feed::Live(manager) = &mut self.feed {
            manager.set_event_sender(tx.clone());
        }
        self.events_tx = tx;
        rx
    }

    /// Status of the feed, live or simulated.
    pub fn status(&self) -> ConnectionStatus {
        match &self.feed {
            Feed::Live(manager) => manager.status(),
            Feed::Simulated { handle, .. } => match handle {
                Some(h) if !h.is_finished() => ConnectionStatus::Connected,
                _ => ConnectionStatus::Disconnected,
            },
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    // ── Market data ──────────────────────────────────────────────────────

    pub fn snapshot(&self, pair: &Pair) -> Option<MarketSnapshot> {
        self.store.snapshot(pair)
    }

    pub fn snapshots(&self) -> Vec<MarketSnapshot> {
        self.store.snapshots()
    }

    pub fn updates(&self) -> impl Stream<Item = MarketUpdate> + Send + 'static {
        self.store.updates()
    }

    /// Subscribe to a channel. The simulated feed emits everything, so
    /// there this only succeeds.
    pub fn subscribe(&self, params: SubscribeParams) -> Result<(), ClientError> {
        match &self.feed {
            Feed::Live(manager) => Ok(manager.subscribe(params)?),
            Feed::Simulated { .. } => Ok(()),
        }
    }

    pub fn unsubscribe(&self, params: UnsubscribeParams) -> Result<(), ClientError> {
        match &self.feed {
            Feed::Live(manager) => Ok(manager.unsubscribe(params)?),
            Feed::Simulated { .. } => Ok(()),
        }
    }

    /// Load recent trades over REST into the store's tape for `pair`.
    pub async fn seed_trades(&self, pair: &Pair, limit: Option<u32>) -> Result<usize, ClientError> {
        let mut trades = self.rest.recent_trades(pair, limit).await?;
        trades.reverse();
        Ok(self.store.seed_trades(pair, trades))
    }

    // ── REST ─────────────────────────────────────────────────────────────

    pub async fn request(&self, url: &str, options: RequestOptions) -> Result<Value, RequestError> {
        self.rest.request(url, options).await
    }

    pub async fn is_healthy(&self) -> bool {
        self.rest.is_healthy().await
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Builder
// ═════════════════════════════════════════════════════════════════════════════

pub struct RealtimeClientBuilder {
    api_url: String,
    ws_url: Option<String>,
    ws_config: WsConfig,
    resilience: ResilienceConfig,
    simulated: SimulatedFeedConfig,
    sweep_interval: Duration,
    trade_capacity: usize,
    update_buffer: usize,
}

impl Default for RealtimeClientBuilder {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: None,
            ws_config: WsConfig::default(),
            resilience: ResilienceConfig::default(),
            simulated: SimulatedFeedConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            trade_capacity: DEFAULT_TAPE_CAPACITY,
            update_buffer: DEFAULT_UPDATE_BUFFER,
        }
    }
}

impl RealtimeClientBuilder {
    /// Read `REALTIME_API_URL` and `REALTIME_WS_URL`. Unset variables
    /// leave the current values alone.
    pub fn from_env(mut self) -> Self {
        if let Some(url) = url_from_env(API_URL_ENV) {
            self.api_url = url;
        }
        if let Some(url) = url_from_env(WS_URL_ENV) {
            self.ws_url = Some(url);
        }
        self
    }

    pub fn api_url(mut self, url: &str) -> Self {
        self.api_url = url.to_string();
        self
    }

    /// Live feed URL. Without one the client runs on the simulated feed.
    pub fn ws_url(mut self, url: &str) -> Self {
        self.ws_url = Some(url.to_string());
        self
    }

    /// Connection settings. Its `url` is replaced by [`ws_url`](Self::ws_url).
    pub fn ws_config(mut self, config: WsConfig) -> Self {
        self.ws_config = config;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.resilience.cache_ttl = ttl;
        self
    }

    /// Zero disables the periodic sweep; expiry stays lazy.
    pub fn cache_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn batch_window(mut self, window: Duration) -> Self {
        self.resilience.batcher = BatcherConfig { window };
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.resilience.breaker = config;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.resilience.retry = config;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.resilience.request_timeout = timeout;
        self
    }

    pub fn simulated_feed(mut self, config: SimulatedFeedConfig) -> Self {
        self.simulated = config;
        self
    }

    pub fn trade_capacity(mut self, capacity: usize) -> Self {
        self.trade_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<RealtimeClient, ClientError> {
        Url::parse(&self.api_url)
            .map_err(|e| ClientError::Config(format!("invalid API URL {}: {}", self.api_url, e)))?;

        let event_buffer = self.ws_config.event_buffer.max(1);
        let (events_tx, events_rx) = mpsc::channel(event_buffer);

        let feed = match self.ws_url {
            Some(url) => {
                if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                    return Err(ClientError::Config(format!(
                        "WebSocket URL must start with ws:// or wss://, got {}",
                        url
                    )));
                }
                let config = WsConfig {
                    url,
                    ..self.ws_config
                };
                Feed::Live(ConnectionManager::with_sender(config, events_tx.clone()))
            }
            None => Feed::Simulated {
                config: self.simulated,
                handle: None,
            },
        };

        Ok(RealtimeClient {
            rest: ResilientClient::with_config(&self.api_url, self.resilience),
            store: Arc::new(RealtimeStore::with_capacity(
                self.trade_capacity,
                self.update_buffer,
            )),
            feed,
            events_tx,
            events_rx: Some(events_rx),
            event_buffer,
            pump: None,
            sweeper: None,
            sweep_interval: self.sweep_interval,
        })
    }
}
