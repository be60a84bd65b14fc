//! Endpoint defaults and environment variable names.

/// Default REST API base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:4000/api/v1";

/// Environment variable holding the REST API base URL.
pub const API_URL_ENV: &str = "REALTIME_API_URL";

/// Environment variable holding the WebSocket URL.
///
/// There is no default WebSocket URL: when this is unset the client runs
/// on the simulated feed.
pub const WS_URL_ENV: &str = "REALTIME_WS_URL";

/// Read a URL from the environment, treating empty values as unset.
pub fn url_from_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
