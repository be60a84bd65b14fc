//! # Realtime Client
//!
//! A resilient real-time market data client: a reconnecting WebSocket feed
//! (or a simulated one when no endpoint is configured), a store of
//! reconciled per-pair snapshots, and a REST client with caching, request
//! coalescing, circuit breaking and retry.
//!
//! ## Architecture
//!
//! The crate is organized in layers:
//!
//! 1. **Core**: Pairs, domain updates and their reconciled state
//! 2. **Resilience**: TTL cache, request batcher, circuit breakers, retry
//! 3. **HTTP API**: `ResilientClient` composing the resilience layer over `reqwest`
//! 4. **Feeds**: `ConnectionManager` over `tokio-tungstenite`, `SimulatedFeed`
//! 5. **Store**: `RealtimeStore`, the single consumer of feed events
//! 6. **High-Level Client**: `RealtimeClient` wiring everything together
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use realtime_client::prelude::*;
//!
//! let mut client = RealtimeClient::builder()
//!     .api_url("https://api.example.com/v1")
//!     .ws_url("wss://stream.example.com/ws")
//!     .build()?;
//! client.start().await?;
//! client.subscribe(SubscribeParams::OrderBook { pairs: vec![Pair::from("BTC/USDT")] })?;
//!
//! let ticker = client.rest().ticker(&Pair::from("BTC/USDT")).await?;
//! let snapshot = client.snapshot(&Pair::from("BTC/USDT"));
//! ```

// ── Layer 1: Core ────────────────────────────────────────────────────────────

/// Shared newtypes used across all domains.
pub mod shared;

/// Domain modules: update types and the state they reduce into.
pub mod domain;

/// Unified error types.
pub mod error;

/// Endpoint defaults and environment variable names.
pub mod network;

// ── Layer 2: Resilience ──────────────────────────────────────────────────────

/// Transport-independent cache, batcher, circuit breaker and retry.
pub mod resilience;

// ── Layer 3: HTTP API ────────────────────────────────────────────────────────

/// REST client composed from the resilience layer.
#[cfg(feature = "http")]
pub mod http;

// ── Layer 4: Feeds ───────────────────────────────────────────────────────────

/// WebSocket messages, connection state and the connection manager.
pub mod ws;

/// Simulated feed for running without a live endpoint.
pub mod feed;

// ── Layer 5: Store ───────────────────────────────────────────────────────────

/// Reconciled market snapshots fed by feed events.
pub mod store;

// ── Layer 6: High-Level Client ───────────────────────────────────────────────

/// `RealtimeClient`, the primary entry point.
#[cfg(all(feature = "http", feature = "ws-native"))]
pub mod client;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    // Shared newtypes
    pub use crate::shared::{Interval, Pair, Side};

    // Domain types
    pub use crate::domain::candle::{Candle, CandleSeries, CandleUpdate};
    pub use crate::domain::orderbook::{BookLevel, OrderBookState, OrderBookUpdate};
    pub use crate::domain::ticker::PriceUpdate;
    pub use crate::domain::trade::{TradeTape, TradeUpdate};

    // Errors
    pub use crate::error::{CircuitOpenError, ClientError, RequestError, WsError};

    // Resilience
    pub use crate::resilience::{
        generate_key, retry, BatcherConfig, CircuitBreakerConfig, CircuitBreakerRegistry,
        CircuitState, RequestBatcher, RetryConfig, RetryHandler, RetryPolicy, TtlCache,
    };

    // HTTP client
    #[cfg(feature = "http")]
    pub use crate::http::{CachePolicy, RequestOptions, ResilienceConfig, ResilientClient};

    // WebSocket types
    pub use crate::ws::{
        ConnectionState, ConnectionStatus, MessageOut, ReconnectBackoff, SubscribeParams,
        UnsubscribeParams, WireMessage, WsConfig, WsEvent,
    };
    #[cfg(feature = "ws-native")]
    pub use crate::ws::native::ConnectionManager;

    // Feeds and store
    pub use crate::feed::{SimulatedFeed, SimulatedFeedConfig};
    pub use crate::store::{ApplyOutcome, MarketSnapshot, MarketUpdate, RealtimeStore, UpdateKind};

    // High-level client
    #[cfg(all(feature = "http", feature = "ws-native"))]
    pub use crate::client::{FeedMode, RealtimeClient, RealtimeClientBuilder};
}
