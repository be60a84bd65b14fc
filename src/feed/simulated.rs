//! Simulated feed: random-walk market data or a scripted replay.
//!
//! Emits exactly the [`WsEvent`]s a live connection would, on the same kind
//! of channel, so everything downstream runs the same code path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::candle::CandleUpdate;
use crate::domain::orderbook::{BookLevel, OrderBookUpdate};
use crate::domain::ticker::PriceUpdate;
use crate::domain::trade::TradeUpdate;
use crate::shared::{now_millis, Interval, Pair, Side};
use crate::ws::{WireMessage, WsEvent};

/// Feed runs in this process. Trade ids are unique across runs.
static FEED_RUNS: AtomicU64 = AtomicU64::new(0);

/// Random-walk configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedFeedConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Fixed seed for reproducible output.
    pub seed: Option<u64>,
    /// Pairs and their starting prices.
    pub pairs: Vec<(Pair, Decimal)>,
    /// Levels per side in generated order books.
    pub book_depth: usize,
    /// Largest per-tick move, in basis points.
    pub max_move_bps: i64,
}

impl Default for SimulatedFeedConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            seed: None,
            pairs: vec![
                (Pair::from("BTC/USDT"), Decimal::new(65_000, 0)),
                (Pair::from("ETH/USDT"), Decimal::new(3_500, 0)),
                (Pair::from("SOL/USDT"), Decimal::new(150, 0)),
            ],
            book_depth: 10,
            max_move_bps: 50,
        }
    }
}

enum Source {
    RandomWalk(SimulatedFeedConfig),
    Scripted(Vec<WireMessage>),
}

/// Stand-in for the live feed when no WebSocket URL is configured.
pub struct SimulatedFeed {
    source: Source,
}

impl Default for SimulatedFeed {
    fn default() -> Self {
        Self::new(SimulatedFeedConfig::default())
    }
}

impl SimulatedFeed {
    pub fn new(config: SimulatedFeedConfig) -> Self {
        Self {
            source: Source::RandomWalk(config),
        }
    }

    /// Replay `messages` in order, then stop.
    pub fn scripted(messages: Vec<WireMessage>) -> Self {
        Self {
            source: Source::Scripted(messages),
        }
    }

    /// Start emitting into `events`.
    pub fn spawn(self, events: mpsc::Sender<WsEvent>) -> FeedHandle {
        let handle = match self.source {
            Source::RandomWalk(config) => tokio::spawn(run_random_walk(config, events)),
            Source::Scripted(messages) => tokio::spawn(run_script(messages, events)),
        };
        FeedHandle { handle }
    }
}

/// Handle to a running simulated feed. Dropping it stops the feed.
pub struct FeedHandle {
    handle: JoinHandle<()>,
}

impl FeedHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop emitting.
    pub async fn stop(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }

    /// Wait for a scripted feed to deliver everything.
    pub async fn finished(mut self) {
        let _ = (&mut self.handle).await;
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_script(messages: Vec<WireMessage>, events: mpsc::Sender<WsEvent>) {
    tracing::info!("Simulated feed replaying {} message(s)", messages.len());
    if events.send(WsEvent::Connected).await.is_err() {
        return;
    }
    for message in messages {
        if events.send(WsEvent::Message(message)).await.is_err() {
            return;
        }
    }
}

async fn run_random_walk(config: SimulatedFeedConfig, events: mpsc::Sender<WsEvent>) {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let run = FEED_RUNS.fetch_add(1, Ordering::Relaxed);
    let mut markets: Vec<MarketSim> = config
        .pairs
        .iter()
        .map(|(pair, price)| MarketSim::new(pair.clone(), *price, run))
        .collect();

    tracing::info!(
        "Simulated feed started for {} pair(s), every {}ms",
        markets.len(),
        config.interval.as_millis()
    );
    if events.send(WsEvent::Connected).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(config.interval);
    loop {
        ticker.tick().await;
        for market in &mut markets {
            for message in market.tick(&mut rng, &config) {
                if events.send(WsEvent::Message(message)).await.is_err() {
                    tracing::debug!("Simulated feed receiver gone, stopping");
                    return;
                }
            }
        }
    }
}

// ─── Per-pair random walk ────────────────────────────────────────────────────

struct MarketSim {
    pair: Pair,
    price: Decimal,
    open_24h: Decimal,
    high_24h: Decimal,
    low_24h: Decimal,
    volume_24h: Decimal,
    candle: Option<CandleUpdate>,
    last_ts: i64,
    run: u64,
    trade_seq: u64,
}

impl MarketSim {
    fn new(pair: Pair, price: Decimal, run: u64) -> Self {
        Self {
            pair,
            price,
            open_24h: price,
            high_24h: price,
            low_24h: price,
            volume_24h: Decimal::ZERO,
            candle: None,
            last_ts: 0,
            run,
            trade_seq: 0,
        }
    }

    /// Timestamps strictly increase per pair even if the wall clock does not.
    fn next_timestamp(&mut self) -> i64 {
        self.last_ts = now_millis().max(self.last_ts + 1);
        self.last_ts
    }

    fn tick(&mut self, rng: &mut StdRng, config: &SimulatedFeedConfig) -> Vec<WireMessage> {
        let bps = rng.gen_range(-config.max_move_bps..=config.max_move_bps);
        let moved = self.price * (Decimal::ONE + Decimal::new(bps, 4));
        self.price = moved.round_dp(2).max(Decimal::new(1, 2));
        self.high_24h = self.high_24h.max(self.price);
        self.low_24h = self.low_24h.min(self.price);

        let ts = self.next_timestamp();
        let trade = self.trade(rng, ts);
        self.volume_24h += trade.amount;

        vec![
            WireMessage::Trade(trade),
            WireMessage::OrderBook(self.order_book(rng, config.book_depth, ts)),
            WireMessage::Price(self.ticker(ts)),
            WireMessage::Candle(self.candle(ts)),
        ]
    }

    fn trade(&mut self, rng: &mut StdRng, ts: i64) -> TradeUpdate {
        self.trade_seq += 1;
        TradeUpdate {
            id: format!("sim-{}-{}-{}", self.pair, self.run, self.trade_seq),
            pair: self.pair.clone(),
            price: self.price,
            amount: Decimal::new(rng.gen_range(1..=5_000), 3),
            side: if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell },
            timestamp: ts,
        }
    }

    fn order_book(&self, rng: &mut StdRng, depth: usize, ts: i64) -> OrderBookUpdate {
        let step = (self.price * Decimal::new(5, 4)).round_dp(2).max(Decimal::new(1, 2));
        let mut side = |sign: Decimal| {
            let mut total = Decimal::ZERO;
            (1..=depth)
                .map(|i| {
                    let price = (self.price + sign * step * Decimal::from(i as u64)).round_dp(2);
                    let amount = Decimal::new(rng.gen_range(100..=10_000), 3);
                    total += amount;
                    BookLevel::new(price, amount, total)
                })
                .filter(|level| level.price > Decimal::ZERO)
                .collect::<Vec<_>>()
        };
        let bids = side(Decimal::NEGATIVE_ONE);
        let asks = side(Decimal::ONE);

        OrderBookUpdate {
            pair: self.pair.clone(),
            bids,
            asks,
            timestamp: ts,
        }
    }

    fn ticker(&self, ts: i64) -> PriceUpdate {
        let change = if self.open_24h.is_zero() {
            Decimal::ZERO
        } else {
            ((self.price - self.open_24h) / self.open_24h * Decimal::ONE_HUNDRED).round_dp(2)
        };
        PriceUpdate {
            pair: self.pair.clone(),
            price: self.price,
            change_24h: change,
            volume_24h: self.volume_24h,
            high_24h: self.high_24h,
            low_24h: self.low_24h,
            timestamp: ts,
        }
    }

    fn candle(&mut self, ts: i64) -> CandleUpdate {
        let interval = Interval::Minute1;
        let time = interval.bucket_start(ts);
        let price = self.price;
        let candle = match self.candle.take() {
            Some(mut c) if c.time == time => {
                c.high = c.high.max(price);
                c.low = c.low.min(price);
                c.close = price;
                c.volume += Decimal::ONE;
                c
            }
            _ => CandleUpdate {
                pair: self.pair.clone(),
                interval,
                time,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: Decimal::ONE,
            },
        };
        self.candle = Some(candle.clone());
        candle
    }
}
