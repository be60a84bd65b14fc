//! The store must end up in the same state whichever feed delivers a script:
//! the simulated feed, or a live WebSocket connection.

#![cfg(feature = "ws-native")]

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use realtime_client::domain::candle::CandleUpdate;
use realtime_client::domain::orderbook::{BookLevel, OrderBookUpdate};
use realtime_client::domain::ticker::PriceUpdate;
use realtime_client::domain::trade::TradeUpdate;
use realtime_client::feed::SimulatedFeed;
use realtime_client::shared::{Interval, Pair, Side};
use realtime_client::store::RealtimeStore;
use realtime_client::ws::native::ConnectionManager;
use realtime_client::ws::{ConnectionStatus, WireMessage, WsConfig};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Both sources get the same small buffer, so the live path has to wait
/// for the store rather than outrun it.
const EVENT_BUFFER: usize = 16;

fn book(pair: &str, ts: i64, bid: i64) -> WireMessage {
    WireMessage::OrderBook(OrderBookUpdate {
        pair: Pair::from(pair),
        bids: vec![BookLevel::new(Decimal::from(bid), Decimal::ONE, Decimal::ONE)],
        asks: vec![BookLevel::new(
            Decimal::from(bid + 1),
            Decimal::new(5, 1),
            Decimal::new(5, 1),
        )],
        timestamp: ts,
    })
}

fn trade(pair: &str, id: &str, ts: i64) -> WireMessage {
    WireMessage::Trade(TradeUpdate {
        id: id.to_string(),
        pair: Pair::from(pair),
        price: Decimal::new(10_050 + ts, 2),
        amount: Decimal::new(25, 2),
        side: if ts % 2 == 0 { Side::Buy } else { Side::Sell },
        timestamp: ts,
    })
}

fn price(pair: &str, ts: i64, px: i64) -> WireMessage {
    WireMessage::Price(PriceUpdate {
        pair: Pair::from(pair),
        price: Decimal::from(px),
        change_24h: Decimal::new(-125, 2),
        volume_24h: Decimal::from(1_000),
        high_24h: Decimal::from(px + 10),
        low_24h: Decimal::from(px - 10),
        timestamp: ts,
    })
}

fn candle(pair: &str, time: i64, close: i64) -> WireMessage {
    WireMessage::Candle(CandleUpdate {
        pair: Pair::from(pair),
        interval: Interval::Minute1,
        time,
        open: Decimal::from(100),
        high: Decimal::from(close.max(100)),
        low: Decimal::from(close.min(100)),
        close: Decimal::from(close),
        volume: Decimal::ONE,
    })
}

/// Out-of-order books and tickers, duplicate trades, more trades than the
/// tape holds, and candle revisions across two pairs.
fn script() -> Vec<WireMessage> {
    let mut script = vec![
        book("BTC/USDT", 5, 105),
        book("ETH/USDT", 1, 3_000),
        book("BTC/USDT", 3, 103),
        price("BTC/USDT", 10, 100),
        price("BTC/USDT", 10, 999),
        price("BTC/USDT", 7, 70),
        trade("BTC/USDT", "dup", 1),
        trade("BTC/USDT", "dup", 2),
        candle("BTC/USDT", 60_000, 101),
        candle("BTC/USDT", 60_000, 104),
        candle("BTC/USDT", 0, 90),
        book("BTC/USDT", 9, 109),
        book("BTC/USDT", 9, 1),
        price("ETH/USDT", 4, 3_010),
    ];
    for i in 0..120 {
        script.push(trade("BTC/USDT", &format!("t{i}"), 100 + i));
    }
    script.push(trade("ETH/USDT", "e1", 50));
    script
}

async fn via_simulated_feed(script: Vec<WireMessage>) -> Arc<RealtimeStore> {
    let store = Arc::new(RealtimeStore::new());
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let pump = tokio::spawn(Arc::clone(&store).run(rx));

    SimulatedFeed::scripted(script).spawn(tx).finished().await;
    timeout(TEST_TIMEOUT, pump).await.unwrap().unwrap();
    store
}

async fn via_websocket(script: Vec<WireMessage>) -> Arc<RealtimeStore> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        for message in &script {
            ws.send(Message::Text(message.encode().unwrap().into()))
                .await
                .unwrap();
        }
        let _ = ws.close(None).await;
    });

    let store = Arc::new(RealtimeStore::new());
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let pump = tokio::spawn(Arc::clone(&store).run(rx));

    let config = WsConfig {
        auto_reconnect: false,
        ..WsConfig::new(url)
    };
    let mut manager = ConnectionManager::with_sender(config, tx);
    manager.connect().await.unwrap();
    let mut state = manager.watch_state();

    timeout(
        TEST_TIMEOUT,
        state.wait_for(|s| s.status == ConnectionStatus::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    manager.disconnect().await;
    drop(manager);
    timeout(TEST_TIMEOUT, pump).await.unwrap().unwrap();
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_feed_sources_produce_identical_snapshots() {
    let simulated = via_simulated_feed(script()).await;
    let live = via_websocket(script()).await;

    let simulated_json = serde_json::to_string(&simulated.snapshots()).unwrap();
    let live_json = serde_json::to_string(&live.snapshots()).unwrap();
    assert_eq!(simulated_json, live_json);

    // And the state is the reconciled one, not just the same.
    let btc = simulated.snapshot(&Pair::from("BTC/USDT")).unwrap();
    let book = btc.order_book.as_ref().unwrap();
    assert_eq!(book.timestamp, 9);
    assert_eq!(book.best_bid(), Some(Decimal::from(109)));
    assert_eq!(btc.ticker.as_ref().unwrap().price, Decimal::from(100));
    assert_eq!(btc.trades.len(), 100);
    assert_eq!(btc.trades.latest().unwrap().id, "t119");
    assert!(!btc.trades.contains("dup"), "oldest trades are evicted");
    assert_eq!(btc.candles.last(Interval::Minute1).unwrap().close, Decimal::from(104));

    let eth = live.snapshot(&Pair::from("ETH/USDT")).unwrap();
    assert_eq!(eth.ticker.as_ref().unwrap().price, Decimal::from(3_010));
    assert_eq!(eth.trades.len(), 1);
}
