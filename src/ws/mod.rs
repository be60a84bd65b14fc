//! WebSocket layer: wire messages, subscriptions, events, connection state.
//!
//! The transport lives in `native.rs` (`ws-native` feature, `tokio-tungstenite`).
//! Everything else here is transport-agnostic and is also what the
//! simulated feed speaks, so the store never knows which source it is fed by.

pub mod state;
pub mod subscriptions;

#[cfg(feature = "ws-native")]
pub mod native;

use std::time::Duration;

use crate::domain::candle::CandleUpdate;
use crate::domain::orderbook::OrderBookUpdate;
use crate::domain::ticker::PriceUpdate;
use crate::domain::trade::TradeUpdate;
use crate::error::WsError;
use crate::shared::Pair;
use serde::{Deserialize, Serialize};

pub use state::{CloseDecision, ConnectionState, ConnectionStatus};
pub use subscriptions::{SubscribeParams, Subscription, SubscriptionChange, UnsubscribeParams};

// ─── Inbound messages ────────────────────────────────────────────────────────

/// Inbound feed message: `{ "type": ..., "data": ... }`.
///
/// Decoding validates the `type` tag before the payload; an unknown tag is a
/// parse error rather than a pass-through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WireMessage {
    #[serde(rename = "orderbook")]
    OrderBook(OrderBookUpdate),
    #[serde(rename = "trade")]
    Trade(TradeUpdate),
    #[serde(rename = "price")]
    Price(PriceUpdate),
    #[serde(rename = "candlestick")]
    Candle(CandleUpdate),
}

impl WireMessage {
    /// Decode one JSON text frame.
    pub fn decode(text: &str) -> Result<Self, WsError> {
        serde_json::from_str(text).map_err(|e| WsError::Parse(e.to_string()))
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String, WsError> {
        serde_json::to_string(self).map_err(|e| WsError::Parse(e.to_string()))
    }

    pub fn pair(&self) -> &Pair {
        match self {
            WireMessage::OrderBook(u) => &u.pair,
            WireMessage::Trade(u) => &u.pair,
            WireMessage::Price(u) => &u.pair,
            WireMessage::Candle(u) => &u.pair,
        }
    }

    /// Logical timestamp used for ordering. Candles report their bucket start.
    pub fn timestamp(&self) -> i64 {
        match self {
            WireMessage::OrderBook(u) => u.timestamp,
            WireMessage::Trade(u) => u.timestamp,
            WireMessage::Price(u) => u.timestamp,
            WireMessage::Candle(u) => u.time,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::OrderBook(_) => "orderbook",
            WireMessage::Trade(_) => "trade",
            WireMessage::Price(_) => "price",
            WireMessage::Candle(_) => "candlestick",
        }
    }
}

// ─── Outbound messages ───────────────────────────────────────────────────────

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum MessageOut {
    #[serde(rename = "subscribe")]
    Subscribe { params: SubscribeParams },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { params: UnsubscribeParams },
}

impl MessageOut {
    pub fn subscribe_order_book(pairs: Vec<Pair>) -> Self {
        MessageOut::Subscribe {
            params: SubscribeParams::OrderBook { pairs },
        }
    }

    pub fn subscribe_trades(pairs: Vec<Pair>) -> Self {
        MessageOut::Subscribe {
            params: SubscribeParams::Trades { pairs },
        }
    }

    pub fn subscribe_ticker(pairs: Vec<Pair>) -> Self {
        MessageOut::Subscribe {
            params: SubscribeParams::Ticker { pairs },
        }
    }

    /// The tracked-subscription change this message implies.
    pub fn subscription_change(&self) -> SubscriptionChange {
        match self {
            MessageOut::Subscribe { params } => SubscriptionChange::Add(params.clone()),
            MessageOut::Unsubscribe { params } => SubscriptionChange::Remove(params.clone()),
        }
    }
}

// ─── WsEvent ─────────────────────────────────────────────────────────────────

/// Events emitted by a feed source to its consumer.
///
/// Both the live connection and the simulated feed produce these.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    /// Connection established (or simulated feed started).
    Connected,
    /// Connection lost. A `Reconnecting` or `Failed` event follows when
    /// auto-reconnect is on.
    Disconnected { code: Option<u16>, reason: String },
    /// A decoded feed message.
    Message(WireMessage),
    /// A dropped frame or transport error. Never fatal.
    Error(String),
    /// Reconnect scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts exhausted.
    Failed,
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Delay policy between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectBackoff {
    /// Same delay before every attempt.
    Fixed { delay_ms: u64 },
    /// `base_ms * factor^(attempt - 1)`, capped at `max_ms`, optionally ±25% jitter.
    Exponential {
        base_ms: u64,
        factor: f64,
        max_ms: u64,
        jitter: bool,
    },
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        ReconnectBackoff::Exponential {
            base_ms: 1_000,
            factor: 2.0,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

/// Configuration for the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct WsConfig {
    pub url: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub backoff: ReconnectBackoff,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Capacity of the event channel. Events are dropped (with a warning) when full.
    pub event_buffer: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            backoff: ReconnectBackoff::default(),
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            event_buffer: 256,
        }
    }
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}
