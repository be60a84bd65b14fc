//! Subscription types, tracking, and matching.

use crate::shared::{Interval, Pair};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Parameters for subscribing to a feed channel.
///
/// Wire format uses `#[serde(tag = "channel")]`; subscribe and unsubscribe
/// share the same channel names.
#[derive(Debug, Clone, Serialize, Deserialize, Hash, Eq, PartialEq)]
#[serde(tag = "channel")]
pub enum SubscribeParams {
    #[serde(rename = "orderbook")]
    OrderBook { pairs: Vec<Pair> },
    #[serde(rename = "trades")]
    Trades { pairs: Vec<Pair> },
    #[serde(rename = "ticker")]
    Ticker { pairs: Vec<Pair> },
    #[serde(rename = "candles")]
    Candles { pair: Pair, interval: Interval },
}

/// Parameters for unsubscribing from a feed channel.
#[derive(Debug, Clone, Serialize, Deserialize, Hash, Eq, PartialEq)]
#[serde(tag = "channel")]
pub enum UnsubscribeParams {
    #[serde(rename = "orderbook")]
    OrderBook { pairs: Vec<Pair> },
    #[serde(rename = "trades")]
    Trades { pairs: Vec<Pair> },
    #[serde(rename = "ticker")]
    Ticker { pairs: Vec<Pair> },
    #[serde(rename = "candles")]
    Candles { pair: Pair, interval: Interval },
}

/// Trait for subscription types that can be tracked and matched.
pub trait Subscription {
    fn to_unsubscribe_params(&self) -> UnsubscribeParams;
    fn matches_unsubscribe(&self, unsub: &UnsubscribeParams) -> bool;
    fn subscription_key(&self) -> String;
}

impl Subscription for SubscribeParams {
    fn to_unsubscribe_params(&self) -> UnsubscribeParams {
        match self {
            SubscribeParams::OrderBook { pairs } => UnsubscribeParams::OrderBook {
                pairs: pairs.clone(),
            },
            SubscribeParams::Trades { pairs } => UnsubscribeParams::Trades {
                pairs: pairs.clone(),
            },
            SubscribeParams::Ticker { pairs } => UnsubscribeParams::Ticker {
                pairs: pairs.clone(),
            },
            SubscribeParams::Candles { pair, interval } => UnsubscribeParams::Candles {
                pair: pair.clone(),
                interval: *interval,
            },
        }
    }

    fn matches_unsubscribe(&self, unsub: &UnsubscribeParams) -> bool {
        match (self, unsub) {
            (
                SubscribeParams::OrderBook { pairs: sub_pairs },
                UnsubscribeParams::OrderBook { pairs: unsub_pairs },
            )
            | (
                SubscribeParams::Trades { pairs: sub_pairs },
                UnsubscribeParams::Trades { pairs: unsub_pairs },
            )
            | (
                SubscribeParams::Ticker { pairs: sub_pairs },
                UnsubscribeParams::Ticker { pairs: unsub_pairs },
            ) => same_pairs(sub_pairs, unsub_pairs),
            (
                SubscribeParams::Candles {
                    pair: sub_pair,
                    interval: sub_interval,
                },
                UnsubscribeParams::Candles {
                    pair: unsub_pair,
                    interval: unsub_interval,
                },
            ) => sub_pair == unsub_pair && sub_interval == unsub_interval,
            _ => false,
        }
    }

    fn subscription_key(&self) -> String {
        match self {
            SubscribeParams::OrderBook { pairs } => format!("orderbook:{}", pairs_key(pairs)),
            SubscribeParams::Trades { pairs } => format!("trades:{}", pairs_key(pairs)),
            SubscribeParams::Ticker { pairs } => format!("ticker:{}", pairs_key(pairs)),
            SubscribeParams::Candles { pair, interval } => {
                format!("candles:{}:{}", pair, interval)
            }
        }
    }
}

/// Record a subscribe/unsubscribe in the tracked set. Returns whether the set changed.
pub fn track(subs: &mut Vec<SubscribeParams>, change: &SubscriptionChange) -> bool {
    match change {
        SubscriptionChange::Add(params) => {
            if subs.iter().any(|s| s == params) {
                return false;
            }
            tracing::debug!("Tracking subscription: {}", params.subscription_key());
            subs.push(params.clone());
            true
        }
        SubscriptionChange::Remove(unsub) => {
            let before = subs.len();
            subs.retain(|s| !s.matches_unsubscribe(unsub));
            let removed = before - subs.len();
            if removed > 0 {
                tracing::debug!("Removed {} subscription(s) from tracking", removed);
            }
            removed > 0
        }
    }
}

/// A change to the tracked subscription set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    Add(SubscribeParams),
    Remove(UnsubscribeParams),
}

fn same_pairs(a: &[Pair], b: &[Pair]) -> bool {
    let a: HashSet<_> = a.iter().collect();
    let b: HashSet<_> = b.iter().collect();
    a == b
}

fn pairs_key(pairs: &[Pair]) -> String {
    let mut sorted: Vec<_> = pairs.iter().map(|p| p.to_string()).collect();
    sorted.sort();
    sorted.join(",")
}
