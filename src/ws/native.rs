//! Native connection manager: `tokio-tungstenite`.
//!
//! - Background tokio task owns the socket; the public API talks to it over mpsc
//! - WebSocket ping frames with a pong deadline
//! - Reconnect scheduling driven by [`ConnectionState`]
//! - Subscription tracking + resubscribe after every successful open
//! - Status published on a `watch` channel, events on an mpsc channel
//! - The socket is only read while the event channel has room, so a slow
//!   consumer applies backpressure instead of losing messages

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream, Stream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::WsError;
use crate::ws::subscriptions::{self, Subscription};
use crate::ws::{
    CloseDecision, ConnectionState, ConnectionStatus, MessageOut, SubscribeParams,
    UnsubscribeParams, WireMessage, WsConfig, WsEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Frame = Option<Result<Message, tungstenite::Error>>;

// ─── Commands from public API to background task ─────────────────────────────

enum Command {
    Send(MessageOut),
    Disconnect,
}

enum DisconnectReason {
    UserRequested,
    Closed,
}

// ─── Background task state ───────────────────────────────────────────────────

struct TaskState {
    config: WsConfig,
    event_tx: mpsc::Sender<WsEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    subscriptions: Arc<Mutex<Vec<SubscribeParams>>>,
}

impl TaskState {
    /// Deliver an event, waiting for the consumer if the channel is full.
    async fn emit(&self, event: WsEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }

    /// Advisory events (errors) are dropped rather than waited on.
    fn notify(&self, event: WsEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            tracing::warn!("Event channel full, dropping {:?}", event);
        }
    }

    fn on_close(&self) -> CloseDecision {
        let mut decision = CloseDecision::Stop;
        self.state_tx
            .send_modify(|state| decision = state.on_close(&self.config));
        decision
    }

    fn tracked(&self) -> Vec<SubscribeParams> {
        self.subscriptions.lock().clone()
    }
}

// ─── Public ConnectionManager ────────────────────────────────────────────────

/// Owns the lifecycle of one WebSocket: connect, receive, reconnect, disconnect.
///
/// Decoded messages are delivered as [`WsEvent`]s, either through
/// [`events()`](Self::events) or through a caller-supplied sender
/// ([`with_sender`](Self::with_sender)).
pub struct ConnectionManager {
    config: WsConfig,
    cmd_tx: Option<mpsc::Sender<Command>>,
    event_tx: mpsc::Sender<WsEvent>,
    event_rx: Option<tokio::sync::Mutex<mpsc::Receiver<WsEvent>>>,
    task_handle: Option<JoinHandle<()>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    subscriptions: Arc<Mutex<Vec<SubscribeParams>>>,
}

impl ConnectionManager {
    /// Create a manager with its own event channel. Does not connect yet.
    pub fn new(config: WsConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let mut manager = Self::with_sender(config, event_tx);
        manager.event_rx = Some(tokio::sync::Mutex::new(event_rx));
        manager
    }

    /// Create a manager that emits into an existing event channel.
    ///
    /// [`events()`](Self::events) yields nothing for a manager built this way.
    pub fn with_sender(config: WsConfig, event_tx: mpsc::Sender<WsEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            config,
            cmd_tx: None,
            event_tx,
            event_rx: None,
            task_handle: None,
            state_tx: Arc::new(state_tx),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Emit into `event_tx` from the next `connect()` on.
    ///
    /// [`events()`](Self::events) yields nothing afterwards.
    pub fn set_event_sender(&mut self, event_tx: mpsc::Sender<WsEvent>) {
        self.event_tx = event_tx;
        self.event_rx = None;
    }

    /// Open the connection.
    ///
    /// Any existing connection is closed first, so there is never more than
    /// one live socket per manager.
    pub async fn connect(&mut self) -> Result<(), WsError> {
        if self.config.url.trim().is_empty() {
            return Err(WsError::ConnectionFailed("No WebSocket URL configured".into()));
        }
        if self.task_handle.is_some() {
            self.disconnect().await;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        self.cmd_tx = Some(cmd_tx);
        self.state_tx.send_modify(|state| state.on_connecting());

        let task = TaskState {
            config: self.config.clone(),
            event_tx: self.event_tx.clone(),
            cmd_rx,
            state_tx: Arc::clone(&self.state_tx),
            subscriptions: Arc::clone(&self.subscriptions),
        };
        self.task_handle = Some(tokio::spawn(run_task(task)));
        Ok(())
    }

    /// Close the connection and cancel any pending reconnect.
    ///
    /// Idempotent. Tracked subscriptions are kept for the next `connect()`.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(Command::Disconnect).await;
        }

        if let Some(handle) = self.task_handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("Connection task did not stop in time, aborting");
                abort.abort();
            }
        }

        self.state_tx.send_modify(|state| state.on_disconnect());
    }

    /// Tear down and reconnect with a fresh attempt counter.
    pub async fn restart(&mut self) -> Result<(), WsError> {
        if self.status() == ConnectionStatus::Connecting {
            tracing::info!("Already connecting, skipping restart");
            return Ok(());
        }
        tracing::info!("Manual reconnection requested");
        self.disconnect().await;
        self.connect().await
    }

    /// Send a message on the open socket.
    ///
    /// Never queues: returns `WsError::NotConnected` unless the status is
    /// `Connected`.
    pub fn send(&self, msg: MessageOut) -> Result<(), WsError> {
        if !self.is_connected() {
            tracing::warn!("Cannot send while {:?}: {:?}", self.status(), msg);
            return Err(WsError::NotConnected);
        }
        self.track(&msg);
        self.send_command(msg)
    }

    /// Subscribe to a channel.
    ///
    /// The subscription is tracked and sent now if connected, otherwise on
    /// the next successful open.
    pub fn subscribe(&self, params: SubscribeParams) -> Result<(), WsError> {
        self.track_or_send(MessageOut::Subscribe { params })
    }

    /// Unsubscribe from a channel.
    pub fn unsubscribe(&self, params: UnsubscribeParams) -> Result<(), WsError> {
        self.track_or_send(MessageOut::Unsubscribe { params })
    }

    /// Currently tracked subscriptions.
    pub fn subscriptions(&self) -> Vec<SubscribeParams> {
        self.subscriptions.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state_tx.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Watch channel that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Stream of events from the connection.
    ///
    /// The returned stream borrows `self`, so it must be dropped
    /// before calling `disconnect()`.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = WsEvent> + Send + '_>> {
        match &self.event_rx {
            Some(event_rx) => Box::pin(futures_util::stream::unfold(event_rx, |rx| async move {
                let mut guard = rx.lock().await;
                guard.recv().await.map(|event| (event, rx))
            })),
            None => Box::pin(futures_util::stream::empty()),
        }
    }

    fn track(&self, msg: &MessageOut) {
        subscriptions::track(&mut self.subscriptions.lock(), &msg.subscription_change());
    }

    fn track_or_send(&self, msg: MessageOut) -> Result<(), WsError> {
        self.track(&msg);
        if self.is_connected() {
            self.send_command(msg)
        } else {
            tracing::debug!("Not connected; tracked {:?} for the next open", msg);
            Ok(())
        }
    }

    fn send_command(&self, msg: MessageOut) -> Result<(), WsError> {
        match &self.cmd_tx {
            Some(tx) => tx.try_send(Command::Send(msg)).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    WsError::SendFailed("Command channel full".into())
                }
                mpsc::error::TrySendError::Closed(_) => WsError::NotConnected,
            }),
            None => Err(WsError::NotConnected),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

// ─── Background task ─────────────────────────────────────────────────────────

async fn run_task(mut task: TaskState) {
    loop {
        task.state_tx.send_modify(|state| state.on_connecting());
        tracing::info!("Connecting to {}", task.config.url);

        let Some(connected) = connect_or_cancel(&mut task).await else {
            return;
        };

        let reason = match connected {
            Ok((sink, stream)) => {
                task.state_tx.send_modify(|state| state.on_open());
                tracing::info!("WebSocket connected to {}", task.config.url);
                task.emit(WsEvent::Connected).await;

                let mut sink = sink;
                resubscribe_all(&mut sink, &task.tracked()).await;
                run_connected(&mut task, sink, stream).await
            }
            Err(e) => {
                tracing::error!("WebSocket connection failed: {}", e);
                task.state_tx.send_modify(|state| state.on_error(e.clone()));
                task.notify(WsEvent::Error(format!("Connection failed: {}", e)));
                task.emit(WsEvent::Disconnected {
                    code: None,
                    reason: e,
                })
                .await;
                DisconnectReason::Closed
            }
        };

        if let DisconnectReason::UserRequested = reason {
            return;
        }

        match task.on_close() {
            CloseDecision::Reconnect { attempt, delay } => {
                tracing::info!(
                    "Reconnect attempt {}/{} in {}ms",
                    attempt,
                    task.config.max_reconnect_attempts,
                    delay.as_millis()
                );
                task.emit(WsEvent::Reconnecting { attempt, delay }).await;
                if !backoff_sleep(&mut task, delay).await {
                    return;
                }
            }
            CloseDecision::Failed => {
                tracing::warn!(
                    "Giving up after {} reconnect attempt(s)",
                    task.config.max_reconnect_attempts
                );
                task.emit(WsEvent::Failed).await;
                return;
            }
            CloseDecision::Stop => return,
        }
    }
}

/// The inner connected loop, runs until the connection breaks.
async fn run_connected(
    task: &mut TaskState,
    mut sink: WsSink,
    mut stream: SplitStream<WsStream>,
) -> DisconnectReason {
    let ping_enabled = task.config.ping_interval_ms > 0;
    let ping_dur = Duration::from_millis(task.config.ping_interval_ms.max(1));
    let pong_dur = Duration::from_millis(task.config.pong_timeout_ms);

    let mut ping_interval = tokio::time::interval(ping_dur);
    ping_interval.reset(); // skip immediate first tick

    let mut awaiting_pong = false;
    let far_future = tokio::time::Instant::now() + Duration::from_secs(86400);
    let pong_sleep = tokio::time::sleep_until(far_future);
    tokio::pin!(pong_sleep);

    let event_tx = task.event_tx.clone();

    loop {
        tokio::select! {
            // ── a) Incoming WS message, once the consumer has room ───────
            next = next_frame(&event_tx, &mut stream) => {
                let Some((permit, msg)) = next else {
                    tracing::info!("Event receiver dropped, closing connection");
                    let _ = sink.close().await;
                    task.state_tx.send_modify(|state| state.on_disconnect());
                    return DisconnectReason::UserRequested;
                };
                match msg {
                    Some(Ok(Message::Text(text))) => match WireMessage::decode(text.as_str()) {
                        Ok(wire) => permit.send(WsEvent::Message(wire)),
                        Err(e) => {
                            tracing::warn!("Dropping frame: {}, raw: {}", e, text.as_str());
                            permit.send(WsEvent::Error(e.to_string()));
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                        pong_sleep.as_mut().reset(far_future);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = extract_close(frame.as_ref());
                        tracing::info!("WebSocket closed by server: {} {}", code, reason);
                        permit.send(WsEvent::Disconnected { code: Some(code), reason });
                        return DisconnectReason::Closed;
                    }
                    Some(Ok(_)) => {} // binary and raw frames are ignored
                    Some(Err(e)) => {
                        let reason = e.to_string();
                        tracing::error!("WebSocket error: {}", reason);
                        task.state_tx.send_modify(|state| state.on_error(reason.clone()));
                        task.notify(WsEvent::Error(reason.clone()));
                        permit.send(WsEvent::Disconnected { code: None, reason });
                        return DisconnectReason::Closed;
                    }
                    None => {
                        permit.send(WsEvent::Disconnected {
                            code: None,
                            reason: "Stream ended".into(),
                        });
                        return DisconnectReason::Closed;
                    }
                }
            }

            // ── b) Command from public API ───────────────────────────────
            cmd = task.cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send(msg_out)) => {
                        if let Err(e) = send_msg(&mut sink, &msg_out).await {
                            tracing::warn!("Send failed: {}", e);
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = sink.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Client disconnect".into(),
                        }))).await;
                        tracing::info!("WebSocket disconnected by client");
                        task.emit(WsEvent::Disconnected {
                            code: Some(1000),
                            reason: "Client disconnect".into(),
                        })
                        .await;
                        return DisconnectReason::UserRequested;
                    }
                }
            }

            // ── c) Ping interval ─────────────────────────────────────────
            _ = ping_interval.tick(), if ping_enabled => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    tracing::warn!("Failed to send ping: {}", e);
                } else if !awaiting_pong {
                    awaiting_pong = true;
                    pong_sleep.as_mut().reset(tokio::time::Instant::now() + pong_dur);
                }
            }

            // ── d) Pong timeout ──────────────────────────────────────────
            () = &mut pong_sleep, if awaiting_pong => {
                if event_tx.capacity() == 0 {
                    // Frames are unread while the consumer is behind, so the pong may be queued.
                    pong_sleep.as_mut().reset(tokio::time::Instant::now() + pong_dur);
                    continue;
                }
                tracing::warn!(
                    "Pong timeout, no response within {}ms",
                    task.config.pong_timeout_ms
                );
                task.state_tx.send_modify(|state| state.on_error("Pong timeout"));
                task.emit(WsEvent::Disconnected {
                    code: None,
                    reason: "Pong timeout".into(),
                })
                .await;
                let _ = sink.close().await;
                return DisconnectReason::Closed;
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Reserve a slot in the event channel, then read the next frame.
///
/// Returns `None` once the receiver is gone. Dropping the future before it
/// resolves loses no frame.
async fn next_frame<'a>(
    event_tx: &'a mpsc::Sender<WsEvent>,
    stream: &mut SplitStream<WsStream>,
) -> Option<(mpsc::Permit<'a, WsEvent>, Frame)> {
    let permit = event_tx.reserve().await.ok()?;
    Some((permit, stream.next().await))
}

/// Run the handshake. Returns `None` if a disconnect arrived first.
async fn connect_or_cancel(
    task: &mut TaskState,
) -> Option<Result<(WsSink, SplitStream<WsStream>), String>> {
    let connect = attempt_connect(&task.config);
    tokio::pin!(connect);

    loop {
        tokio::select! {
            result = &mut connect => return Some(result),
            cmd = task.cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    tracing::warn!("Dropping {:?}: still connecting", msg);
                }
                Some(Command::Disconnect) | None => return None,
            },
        }
    }
}

async fn attempt_connect(
    config: &WsConfig,
) -> Result<(WsSink, SplitStream<WsStream>), String> {
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| "Connection timeout".to_string())?
        .map_err(|e| e.to_string())?;

    Ok(ws_stream.split())
}

async fn send_msg(sink: &mut WsSink, msg: &MessageOut) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Extract close code and reason from an optional CloseFrame.
fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.as_str().to_string()),
        None => (1006, "No close frame".into()),
    }
}

async fn resubscribe_all(sink: &mut WsSink, subs: &[SubscribeParams]) {
    if subs.is_empty() {
        return;
    }
    tracing::info!("Resubscribing to {} tracked subscription(s)", subs.len());
    for sub in subs {
        let msg = MessageOut::Subscribe { params: sub.clone() };
        if let Err(e) = send_msg(sink, &msg).await {
            tracing::warn!("Failed to resubscribe {}: {}", sub.subscription_key(), e);
        }
    }
}

/// Sleep out the reconnect delay. Returns `false` if a disconnect arrived.
async fn backoff_sleep(task: &mut TaskState, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return true,
            cmd = task.cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    tracing::warn!("Dropping {:?}: reconnect pending", msg);
                }
                Some(Command::Disconnect) | None => {
                    tracing::info!("Pending reconnect cancelled");
                    return false;
                }
            },
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::Pair;

    #[test]
    fn test_manager_new() {
        let manager = ConnectionManager::new(WsConfig::new("ws://127.0.0.1:1"));
        assert!(manager.cmd_tx.is_none());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_send_when_not_connected() {
        let manager = ConnectionManager::new(WsConfig::new("ws://127.0.0.1:1"));
        let result = manager.send(MessageOut::subscribe_ticker(vec![Pair::from("BTC/USDT")]));
        assert_eq!(result, Err(WsError::NotConnected));
        assert!(manager.subscriptions().is_empty());
    }

    #[test]
    fn test_subscribe_while_disconnected_is_tracked() {
        let manager = ConnectionManager::new(WsConfig::new("ws://127.0.0.1:1"));
        let params = SubscribeParams::OrderBook {
            pairs: vec![Pair::from("BTC/USDT")],
        };
        manager.subscribe(params.clone()).unwrap();
        manager.subscribe(params.clone()).unwrap();
        assert_eq!(manager.subscriptions(), vec![params.clone()]);

        manager.unsubscribe(params.to_unsubscribe_params()).unwrap();
        assert!(manager.subscriptions().is_empty());
    }

    #[test]
    fn test_extract_close_with_frame() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "goodbye".into(),
        };
        let (code, reason) = extract_close(Some(&frame));
        assert_eq!(code, 1000);
        assert_eq!(reason, "goodbye");
    }

    #[test]
    fn test_extract_close_no_frame() {
        let (code, reason) = extract_close(None);
        assert_eq!(code, 1006);
        assert_eq!(reason, "No close frame");
    }

    #[tokio::test]
    async fn test_connect_without_url_fails() {
        let mut manager = ConnectionManager::new(WsConfig::default());
        let result = manager.connect().await;
        assert!(matches!(result, Err(WsError::ConnectionFailed(_))));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut manager = ConnectionManager::new(WsConfig::new("ws://127.0.0.1:1"));
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::default());
    }

    #[tokio::test]
    async fn test_with_sender_has_no_own_stream() {
        let (tx, _rx) = mpsc::channel(4);
        let manager = ConnectionManager::with_sender(WsConfig::new("ws://127.0.0.1:1"), tx);
        let mut events = manager.events();
        assert!(events.next().await.is_none());
    }
}
