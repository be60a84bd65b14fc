//! HTTP client layer: `ResilientClient` with per-request cache and retry policies.

pub mod client;

pub use client::{resource_key, CachePolicy, RequestOptions, ResilienceConfig, ResilientClient};
