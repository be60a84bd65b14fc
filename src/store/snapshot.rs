//! Per-pair market snapshot and the message reducer.

use serde::Serialize;

use crate::domain::candle::CandleSeries;
use crate::domain::orderbook::OrderBookState;
use crate::domain::ticker::PriceUpdate;
use crate::domain::trade::{TradeTape, DEFAULT_TAPE_CAPACITY};
use crate::shared::Pair;
use crate::ws::WireMessage;

/// Result of applying one message to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Timestamp not newer than what is held.
    Stale,
    /// Trade id already on the tape.
    Duplicate,
}

impl ApplyOutcome {
    pub fn is_applied(self) -> bool {
        self == ApplyOutcome::Applied
    }
}

/// Reconciled market data for one pair.
///
/// Created on the first message for a pair and updated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub pair: Pair,
    pub order_book: Option<OrderBookState>,
    pub trades: TradeTape,
    pub ticker: Option<PriceUpdate>,
    pub candles: CandleSeries,
}

impl MarketSnapshot {
    pub fn new(pair: Pair) -> Self {
        Self::with_trade_capacity(pair, DEFAULT_TAPE_CAPACITY)
    }

    pub fn with_trade_capacity(pair: Pair, capacity: usize) -> Self {
        Self {
            pair,
            order_book: None,
            trades: TradeTape::new(capacity),
            ticker: None,
            candles: CandleSeries::new(),
        }
    }

    /// Reduce one message into the snapshot.
    ///
    /// Order books and tickers are replaced only by strictly newer
    /// timestamps; trades are deduplicated by id.
    pub fn apply(&mut self, message: &WireMessage) -> ApplyOutcome {
        match message {
            WireMessage::OrderBook(update) => match &mut self.order_book {
                Some(book) => applied_or(book.apply(update), ApplyOutcome::Stale),
                None => {
                    self.order_book = Some(OrderBookState::from(update));
                    ApplyOutcome::Applied
                }
            },
            WireMessage::Trade(trade) => {
                applied_or(self.trades.push(trade.clone()), ApplyOutcome::Duplicate)
            }
            WireMessage::Price(update) => {
                let newer = self
                    .ticker
                    .as_ref()
                    .map_or(true, |held| update.timestamp > held.timestamp);
                if newer {
                    self.ticker = Some(update.clone());
                }
                applied_or(newer, ApplyOutcome::Stale)
            }
            WireMessage::Candle(update) => {
                applied_or(self.candles.apply(update), ApplyOutcome::Stale)
            }
        }
    }

    /// Last traded or ticker price, whichever is more recent.
    pub fn last_price(&self) -> Option<rust_decimal::Decimal> {
        match (self.trades.latest(), &self.ticker) {
            (Some(trade), Some(ticker)) if trade.timestamp > ticker.timestamp => Some(trade.price),
            (_, Some(ticker)) => Some(ticker.price),
            (Some(trade), None) => Some(trade.price),
            (None, None) => None,
        }
    }
}

fn applied_or(applied: bool, otherwise: ApplyOutcome) -> ApplyOutcome {
    if applied {
        ApplyOutcome::Applied
    } else {
        otherwise
    }
}
