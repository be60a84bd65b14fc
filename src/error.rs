//! Unified client error types.

use thiserror::Error;

/// Top-level client error.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// REST-layer errors.
///
/// `Clone` so that a single batched outcome can be delivered to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The request never reached the server (DNS, refused, reset, TLS).
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The circuit for this resource is open; no request was attempted.
    #[error("Circuit open for {resource}")]
    CircuitOpen { resource: String },

    #[error("Timeout")]
    Timeout,

    /// A 2xx response whose body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl RequestError {
    /// HTTP status, if the server reported one.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RequestError::CircuitOpen { .. })
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RequestError::Timeout
        } else if e.is_decode() {
            RequestError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            RequestError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            RequestError::Network(e.to_string())
        }
    }
}

/// Returned by the circuit breaker when a resource is failing fast.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit open for {resource}")]
pub struct CircuitOpenError {
    pub resource: String,
}

impl From<CircuitOpenError> for RequestError {
    fn from(e: CircuitOpenError) -> Self {
        RequestError::CircuitOpen {
            resource: e.resource,
        }
    }
}

/// WebSocket errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WsError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Malformed or unknown inbound frame. Dropped by the connection task.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Connection closed: code={code:?} reason={reason}")]
    Closed { code: Option<u16>, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_converts_to_request_error() {
        let err: RequestError = CircuitOpenError {
            resource: "/api/ticker".into(),
        }
        .into();
        assert!(err.is_circuit_open());
        assert_eq!(err.status(), None);
        assert_eq!(err.to_string(), "Circuit open for /api/ticker");
    }

    #[test]
    fn test_http_error_exposes_status() {
        let err = RequestError::Http {
            status: 503,
            message: "maintenance".into(),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.to_string(), "HTTP 503: maintenance");
    }
}
