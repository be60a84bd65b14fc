//! Candle state container: per-interval series with in-place bar updates.

use super::{Candle, CandleUpdate};
use crate::shared::Interval;
use serde::Serialize;
use std::collections::BTreeMap;

/// Number of bars kept per interval.
pub const DEFAULT_CANDLE_CAPACITY: usize = 500;

/// Candles for one pair, keyed by interval, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandleSeries {
    series: BTreeMap<Interval, Vec<Candle>>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a candle update (replaces the last bar on the same `time`, appends a newer one).
    ///
    /// Bars older than the last one are discarded. Returns whether the series changed.
    pub fn apply(&mut self, update: &CandleUpdate) -> bool {
        let bars = self.series.entry(update.interval).or_default();

        if let Some(last) = bars.last_mut() {
            if last.time == update.time {
                *last = Candle::from(update);
                return true;
            }
            if update.time < last.time {
                return false;
            }
        }

        bars.push(Candle::from(update));
        if bars.len() > DEFAULT_CANDLE_CAPACITY {
            let excess = bars.len() - DEFAULT_CANDLE_CAPACITY;
            bars.drain(..excess);
        }
        true
    }

    pub fn get(&self, interval: Interval) -> Option<&[Candle]> {
        self.series.get(&interval).map(Vec::as_slice)
    }

    pub fn last(&self, interval: Interval) -> Option<&Candle> {
        self.series.get(&interval).and_then(|bars| bars.last())
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(Vec::is_empty)
    }
}
