//! Trade domain: executed trades and the rolling trade tape.

pub mod state;

use crate::shared::{Pair, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use state::{TradeTape, DEFAULT_TAPE_CAPACITY};

/// An executed trade. `id` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub id: String,
    pub pair: Pair,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl TradeUpdate {
    /// Quote-currency value of the trade.
    pub fn notional(&self) -> Decimal {
        self.price * self.amount
    }
}
