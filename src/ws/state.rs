//! Connection state machine.
//!
//! Pure transitions only: the transport task drives these from socket
//! events, which keeps the reconnect bookkeeping testable without a socket.

use serde::Serialize;
use std::time::Duration;

use crate::ws::{ReconnectBackoff, WsConfig};

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted. Terminal until `connect()` is called again.
    Failed,
}

/// Observable connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Reconnect attempts since the last successful open.
    pub attempt: u32,
    pub last_error: Option<String>,
}

/// What to do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Schedule attempt number `attempt` after `delay`.
    Reconnect { attempt: u32, delay: Duration },
    /// Reconnect budget exhausted.
    Failed,
    /// Auto-reconnect is disabled.
    Stop,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn on_connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    pub fn on_open(&mut self) {
        self.status = ConnectionStatus::Connected;
        self.attempt = 0;
        self.last_error = None;
    }

    /// Errors are recorded only; the close that follows drives the transition.
    pub fn on_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Socket closed (or never opened). Decides whether to reconnect.
    ///
    /// The initial connection is not a reconnect: with `max_reconnect_attempts = n`
    /// the first `n` closes schedule reconnects and close `n + 1` yields `Failed`.
    pub fn on_close(&mut self, config: &WsConfig) -> CloseDecision {
        self.status = ConnectionStatus::Disconnected;

        if !config.auto_reconnect {
            return CloseDecision::Stop;
        }
        if self.attempt >= config.max_reconnect_attempts {
            self.status = ConnectionStatus::Failed;
            return CloseDecision::Failed;
        }

        self.attempt += 1;
        self.status = ConnectionStatus::Reconnecting;
        CloseDecision::Reconnect {
            attempt: self.attempt,
            delay: config.backoff.delay_for_attempt(self.attempt),
        }
    }

    /// Explicit disconnect: back to a fresh state.
    pub fn on_disconnect(&mut self) {
        *self = ConnectionState::default();
    }
}

impl ReconnectBackoff {
    /// Delay before reconnect attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectBackoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            ReconnectBackoff::Exponential {
                base_ms,
                factor,
                max_ms,
                jitter,
            } => {
                let exp = attempt.saturating_sub(1).min(16) as i32;
                let capped = (base_ms as f64 * factor.powi(exp)).min(max_ms as f64);
                let final_ms = if jitter {
                    let jitter_range = capped * 0.25;
                    let offset = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
                    (capped + offset).clamp(0.0, max_ms as f64)
                } else {
                    capped
                };
                Duration::from_millis(final_ms as u64)
            }
        }
    }
}
