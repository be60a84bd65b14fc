//! Trade tape: newest-first, capped, deduplicated by trade id.

use super::TradeUpdate;
use serde::{Serialize, Serializer};
use std::collections::{HashSet, VecDeque};

/// Number of trades retained per pair.
pub const DEFAULT_TAPE_CAPACITY: usize = 100;

/// Rolling trade history buffer for a pair.
///
/// Trades are kept in arrival order, newest at the front. `ids` always
/// mirrors the ids currently in `trades`. Serializes as the plain list of
/// trades.
#[derive(Debug, Clone)]
pub struct TradeTape {
    trades: VecDeque<TradeUpdate>,
    ids: HashSet<String>,
    max_size: usize,
}

impl Serialize for TradeTape {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.trades.serialize(serializer)
    }
}

impl Default for TradeTape {
    fn default() -> Self {
        Self::new(DEFAULT_TAPE_CAPACITY)
    }
}

impl PartialEq for TradeTape {
    fn eq(&self, other: &Self) -> bool {
        self.trades == other.trades
    }
}

impl TradeTape {
    pub fn new(max_size: usize) -> Self {
        Self {
            trades: VecDeque::with_capacity(max_size),
            ids: HashSet::with_capacity(max_size),
            max_size,
        }
    }

    /// Push a new trade, evicting the oldest if at capacity.
    ///
    /// Returns `false` (and leaves the tape untouched) if a trade with the
    /// same id is already present.
    pub fn push(&mut self, trade: TradeUpdate) -> bool {
        if self.max_size == 0 || self.ids.contains(&trade.id) {
            return false;
        }
        while self.trades.len() >= self.max_size {
            if let Some(evicted) = self.trades.pop_back() {
                self.ids.remove(&evicted.id);
            }
        }
        self.ids.insert(trade.id.clone());
        self.trades.push_front(trade);
        true
    }

    /// Push a page of trades given oldest-first (e.g. from a REST fetch).
    ///
    /// Returns how many were accepted.
    pub fn extend<I>(&mut self, trades: I) -> usize
    where
        I: IntoIterator<Item = TradeUpdate>,
    {
        let mut accepted = 0;
        for trade in trades {
            if self.push(trade) {
                accepted += 1;
            }
        }
        accepted
    }

    pub fn trades(&self) -> &VecDeque<TradeUpdate> {
        &self.trades
    }

    pub fn latest(&self) -> Option<&TradeUpdate> {
        self.trades.front()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{Pair, Side};
    use rust_decimal::Decimal;

    fn make_trade(id: &str, price: i64, ts: i64) -> TradeUpdate {
        TradeUpdate {
            id: id.to_string(),
            pair: Pair::from("ETH/USDT"),
            price: Decimal::from(price),
            amount: Decimal::ONE,
            side: Side::Buy,
            timestamp: ts,
        }
    }

    #[test]
    fn test_push_adds_newest_first() {
        let mut tape = TradeTape::new(10);
        tape.push(make_trade("t1", 50, 1));
        tape.push(make_trade("t2", 51, 2));
        assert_eq!(tape.len(), 2);
        assert_eq!(tape.latest().unwrap().id, "t2");
    }

    #[test]
    fn test_duplicate_id_is_discarded() {
        let mut tape = TradeTape::new(10);
        assert!(tape.push(make_trade("t1", 50, 1)));
        assert!(!tape.push(make_trade("t1", 99, 2)));
        assert_eq!(tape.len(), 1);
        assert_eq!(tape.latest().unwrap().price, Decimal::from(50));
    }

    #[test]
    fn test_rolling_buffer_evicts_oldest() {
        let mut tape = TradeTape::new(3);
        for (i, id) in ["t1", "t2", "t3", "t4"].iter().enumerate() {
            tape.push(make_trade(id, 50, i as i64));
        }
        assert_eq!(tape.len(), 3);
        let ids: Vec<_> = tape.trades().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["t4", "t3", "t2"]);
        assert!(!tape.contains("t1"));
    }

    #[test]
    fn test_evicted_id_can_be_reinserted() {
        let mut tape = TradeTape::new(2);
        tape.push(make_trade("a", 1, 1));
        tape.push(make_trade("b", 1, 2));
        tape.push(make_trade("c", 1, 3));
        assert!(tape.push(make_trade("a", 1, 4)));
        let ids: Vec<_> = tape.trades().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
    }

    #[test]
    fn test_150_trades_leave_100_newest_first() {
        let mut tape = TradeTape::default();
        for i in 0..150 {
            tape.push(make_trade(&format!("t{i}"), 100, i));
        }
        assert_eq!(tape.len(), 100);
        assert_eq!(tape.latest().unwrap().id, "t149");
        assert_eq!(tape.trades().back().unwrap().id, "t50");
    }

    #[test]
    fn test_serializes_as_flat_list() {
        let mut tape = TradeTape::new(10);
        tape.push(make_trade("t1", 50, 1));
        tape.push(make_trade("t2", 51, 2));
        let value = serde_json::to_value(&tape).unwrap();
        let ids: Vec<_> = value
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["t2", "t1"]);
    }

    #[test]
    fn test_extend_counts_accepted() {
        let mut tape = TradeTape::new(10);
        tape.push(make_trade("x", 1, 1));
        let accepted = tape.extend(vec![make_trade("x", 1, 1), make_trade("y", 1, 2)]);
        assert_eq!(accepted, 1);
        assert_eq!(tape.latest().unwrap().id, "y");
    }
}
