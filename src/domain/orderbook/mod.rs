//! Order book domain: price levels and the reconciled book for one pair.

pub mod state;

pub use state::OrderBookState;

use crate::shared::Pair;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single price level as sent by the feed.
///
/// `total` is the cumulative amount up to and including this level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub amount: Decimal,
    pub total: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, amount: Decimal, total: Decimal) -> Self {
        Self {
            price,
            amount,
            total,
        }
    }
}

/// Full order book replacement for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookUpdate {
    pub pair: Pair,
    #[serde(default = "Vec::new")]
    pub bids: Vec<BookLevel>,
    #[serde(default = "Vec::new")]
    pub asks: Vec<BookLevel>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}
