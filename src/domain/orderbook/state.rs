//! Order book state container: wholesale-replaced, timestamp-guarded.

use super::{BookLevel, OrderBookUpdate};
use rust_decimal::Decimal;
use serde::Serialize;

/// Latest accepted order book for a pair.
///
/// Levels are kept in the order the feed sent them; the accessors below
/// do not assume any particular sort.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderBookState {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: i64,
}

impl OrderBookState {
    /// Replace the book if `update` is strictly newer. Returns whether it was applied.
    pub fn apply(&mut self, update: &OrderBookUpdate) -> bool {
        if update.timestamp <= self.timestamp {
            return false;
        }
        self.bids = update.bids.clone();
        self.asks = update.asks.clone();
        self.timestamp = update.timestamp;
        true
    }

    /// Highest bid price.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().map(|l| l.price).max()
    }

    /// Lowest ask price.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().map(|l| l.price).min()
    }

    /// Mid price (average of best bid and best ask).
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Spread between best ask and best bid.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn bid_depth(&self) -> Decimal {
        self.bids.iter().map(|l| l.amount).sum()
    }

    pub fn ask_depth(&self) -> Decimal {
        self.asks.iter().map(|l| l.amount).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

impl From<&OrderBookUpdate> for OrderBookState {
    fn from(update: &OrderBookUpdate) -> Self {
        Self {
            bids: update.bids.clone(),
            asks: update.asks.clone(),
            timestamp: update.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::Pair;
    use rust_decimal::Decimal;

    fn levels(raw: &[(i64, i64)]) -> Vec<BookLevel> {
        let mut total = Decimal::ZERO;
        raw.iter()
            .map(|&(price, amount)| {
                total += Decimal::from(amount);
                BookLevel::new(Decimal::from(price), Decimal::from(amount), total)
            })
            .collect()
    }

    fn update(ts: i64, bids: &[(i64, i64)], asks: &[(i64, i64)]) -> OrderBookUpdate {
        OrderBookUpdate {
            pair: Pair::from("BTC/USDT"),
            bids: levels(bids),
            asks: levels(asks),
            timestamp: ts,
        }
    }

    #[test]
    fn test_newer_update_replaces_wholesale() {
        let mut book = OrderBookState::from(&update(10, &[(100, 1), (99, 2)], &[(101, 1)]));
        assert!(book.apply(&update(20, &[(98, 5)], &[(102, 3)])));
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.best_bid(), Some(Decimal::from(98)));
        assert_eq!(book.best_ask(), Some(Decimal::from(102)));
        assert_eq!(book.timestamp, 20);
    }

    #[test]
    fn test_older_or_equal_update_is_discarded() {
        let mut book = OrderBookState::from(&update(20, &[(100, 1)], &[(101, 1)]));
        assert!(!book.apply(&update(10, &[(50, 1)], &[(60, 1)])));
        assert!(!book.apply(&update(20, &[(50, 1)], &[(60, 1)])));
        assert_eq!(book.best_bid(), Some(Decimal::from(100)));
        assert_eq!(book.timestamp, 20);
    }

    #[test]
    fn test_mid_price_spread_and_depth() {
        let book = OrderBookState::from(&update(1, &[(100, 1), (99, 2)], &[(104, 3)]));
        assert_eq!(book.mid_price(), Some(Decimal::from(102)));
        assert_eq!(book.spread(), Some(Decimal::from(4)));
        assert_eq!(book.bid_depth(), Decimal::from(3));
        assert_eq!(book.ask_depth(), Decimal::from(3));
    }

    #[test]
    fn test_one_sided_book_has_no_mid() {
        let book = OrderBookState::from(&update(1, &[(100, 1)], &[]));
        assert_eq!(book.mid_price(), None);
        assert_eq!(book.spread(), None);
        assert!(!book.is_empty());
    }
}
