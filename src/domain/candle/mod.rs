//! Candlestick domain: OHLCV bars per pair and interval.

pub mod state;

use crate::shared::{Interval, Pair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use state::{CandleSeries, DEFAULT_CANDLE_CAPACITY};

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, milliseconds since the Unix epoch.
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Candlestick update from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    pub pair: Pair,
    pub interval: Interval,
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl From<&CandleUpdate> for Candle {
    fn from(u: &CandleUpdate) -> Self {
        Self {
            time: u.time,
            open: u.open,
            high: u.high,
            low: u.low,
            close: u.close,
            volume: u.volume,
        }
    }
}
