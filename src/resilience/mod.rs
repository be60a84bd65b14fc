//! Resilience primitives for the REST path: TTL cache, request batcher,
//! per-resource circuit breakers, and retry.
//!
//! None of these depend on a transport; `http::ResilientClient` composes them.

pub mod batcher;
pub mod cache;
pub mod circuit_breaker;
pub mod retry;

pub use batcher::{BatcherConfig, BatcherStats, RequestBatcher};
pub use cache::{generate_key, CacheEntry, CacheStats, TtlCache};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStats,
};
pub use retry::{retry, RetryConfig, RetryHandler, RetryPolicy, RetryStats, Retryable};
