//! `ResilientClient`: REST calls through cache, batcher, circuit breaker
//! and retry.
//!
//! A GET goes: cache lookup → batch by request key → breaker for the URL
//! path → retry → HTTP. Successful responses are cached; failures never are.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::orderbook::OrderBookUpdate;
use crate::domain::ticker::PriceUpdate;
use crate::domain::trade::TradeUpdate;
use crate::error::RequestError;
use crate::network::DEFAULT_API_URL;
use crate::resilience::{
    generate_key, BatcherConfig, BatcherStats, CacheStats, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState, CircuitStats, RequestBatcher, RetryConfig,
    RetryHandler, RetryPolicy, RetryStats, TtlCache,
};
use crate::shared::Pair;

/// Whether and how long to cache a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Use the cache's default TTL.
    #[default]
    Default,
    Ttl(Duration),
    /// Neither read nor write the cache.
    Bypass,
}

/// Per-request options for [`ResilientClient::request`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    /// Ignored for anything but GET, which is the only cached method.
    pub cache: CachePolicy,
    /// `None` picks `Idempotent` for GET and no retries otherwise.
    pub retry: Option<RetryPolicy>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            cache: CachePolicy::Default,
            retry: None,
        }
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Settings for the resilience layers wrapped around the HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    pub cache_ttl: Duration,
    pub batcher: BatcherConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            cache_ttl: crate::resilience::cache::DEFAULT_TTL,
            batcher: BatcherConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// REST client with caching, coalescing, circuit breaking and retry.
///
/// Cheap to clone; clones share every layer.
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<Inner>,
}

struct Inner {
    base_url: String,
    http: Client,
    cache: Arc<TtlCache<Value>>,
    batcher: RequestBatcher<Value, RequestError>,
    breakers: CircuitBreakerRegistry,
    retry: RetryHandler,
}

impl Default for ResilientClient {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

impl ResilientClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_config(base_url, ResilienceConfig::default())
    }

    pub fn with_config(base_url: &str, config: ResilienceConfig) -> Self {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        Self {
            inner: Arc::new(Inner {
                base_url: base_url.trim_end_matches('/').to_string(),
                http,
                cache: Arc::new(TtlCache::new(config.cache_ttl)),
                batcher: RequestBatcher::new(config.batcher),
                breakers: CircuitBreakerRegistry::new(config.breaker),
                retry: RetryHandler::new(config.retry),
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Shared response cache, e.g. for `spawn_sweeper` or invalidation.
    pub fn cache(&self) -> &Arc<TtlCache<Value>> {
        &self.inner.cache
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn circuit_state(&self, resource: &str) -> CircuitState {
        self.inner.breakers.state(resource)
    }

    pub fn circuit_stats(&self, resource: &str) -> Option<CircuitStats> {
        self.inner.breakers.stats(resource)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn batcher_stats(&self) -> BatcherStats {
        self.inner.batcher.stats()
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.inner.retry.stats()
    }

    // ── Endpoints ────────────────────────────────────────────────────────

    /// GET `/health`. Never cached.
    pub async fn health(&self) -> Result<(), RequestError> {
        self.request("/health", RequestOptions::get().cache(CachePolicy::Bypass))
            .await
            .map(|_| ())
    }

    pub async fn is_healthy(&self) -> bool {
        self.health().await.is_ok()
    }

    pub async fn ticker(&self, pair: &Pair) -> Result<PriceUpdate, RequestError> {
        let url = format!("/markets/{}/ticker", urlencoding::encode(pair.as_str()));
        self.get(&url).await
    }

    pub async fn order_book(&self, pair: &Pair) -> Result<OrderBookUpdate, RequestError> {
        let url = format!("/markets/{}/orderbook", urlencoding::encode(pair.as_str()));
        self.get(&url).await
    }

    /// Most recent trades for `pair`, newest first.
    pub async fn recent_trades(
        &self,
        pair: &Pair,
        limit: Option<u32>,
    ) -> Result<Vec<TradeUpdate>, RequestError> {
        let mut url = format!("/markets/{}/trades", urlencoding::encode(pair.as_str()));
        if let Some(l) = limit {
            url = format!("{}?limit={}", url, l);
        }
        self.get(&url).await
    }

    // ── Generic requests ─────────────────────────────────────────────────

    /// Cached, batched, retried GET decoded into `T`.
    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, RequestError> {
        let value = self.request(url, RequestOptions::get()).await?;
        decode(value)
    }

    /// POST with no caching or retries. Still guarded by the breaker.
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, RequestError> {
        let body = serde_json::to_value(body).map_err(|e| RequestError::Decode(e.to_string()))?;
        let value = self.request(url, RequestOptions::post(body)).await?;
        decode(value)
    }

    /// Issue a request through every resilience layer.
    ///
    /// `url` is either absolute or a path relative to the base URL.
    pub async fn request(&self, url: &str, options: RequestOptions) -> Result<Value, RequestError> {
        let url = self.inner.absolute(url);
        let key = generate_key(&url, options.body.as_ref());
        let is_get = options.method == Method::GET;
        let cache = if is_get { options.cache } else { CachePolicy::Bypass };
        let retry = options.retry.unwrap_or(if is_get {
            RetryPolicy::Idempotent
        } else {
            RetryPolicy::None
        });

        if cache != CachePolicy::Bypass {
            if let Some(value) = self.inner.cache.get(&key) {
                tracing::debug!("Cache hit for {}", key);
                return Ok(value);
            }
            tracing::debug!("Cache miss for {}", key);
        }

        let inner = Arc::clone(&self.inner);
        let method = options.method;
        let body = options.body;
        let value = if is_get {
            self.inner
                .batcher
                .batch(&key, move || inner.execute(method, url, body, retry))
                .await?
        } else {
            inner.execute(method, url, body, retry).await?
        };

        match cache {
            CachePolicy::Default => self.inner.cache.set(key, value.clone(), None),
            CachePolicy::Ttl(ttl) => self.inner.cache.set(key, value.clone(), Some(ttl)),
            CachePolicy::Bypass => {}
        }
        Ok(value)
    }
}

impl Inner {
    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    async fn execute(
        self: Arc<Self>,
        method: Method,
        url: String,
        body: Option<Value>,
        retry: RetryPolicy,
    ) -> Result<Value, RequestError> {
        let resource = resource_key(&url);
        let config = match retry {
            RetryPolicy::None => None,
            RetryPolicy::Idempotent => Some(self.retry.config().clone()),
            RetryPolicy::Custom(c) => Some(c),
        };

        self.breakers
            .call_with(
                &resource,
                || async {
                    match &config {
                        Some(c) => {
                            self.retry
                                .execute_with(c, || self.do_request(&method, &url, body.as_ref()))
                                .await
                        }
                        None => self.do_request(&method, &url, body.as_ref()).await,
                    }
                },
                counts_against_circuit,
            )
            .await
    }

    async fn do_request(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, RequestError> {
        let mut req = self.http.request(method.clone(), url);
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status.is_success() {
            let text = resp.text().await?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| RequestError::Decode(e.to_string()));
        }

        let body_text = resp.text().await.unwrap_or_default();
        let message = error_message(&body_text)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
        tracing::debug!("{} {} -> {}: {}", method, url, status.as_u16(), message);
        Err(RequestError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

/// Breaker key for a URL: its path, without query string.
pub fn resource_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    }
}

/// Client errors other than timeouts and rate limits mean the resource
/// answered, so they do not open its circuit.
fn counts_against_circuit(error: &RequestError) -> bool {
    match error {
        RequestError::Network(_) | RequestError::Timeout => true,
        RequestError::Http { status, .. } => *status >= 500 || matches!(status, 408 | 429),
        RequestError::CircuitOpen { .. } | RequestError::Decode(_) => false,
    }
}

/// `message` from a JSON error body, else the trimmed body text.
fn error_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let from_json = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string));
    Some(from_json.unwrap_or_else(|| body.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RequestError> {
    serde_json::from_value(value).map_err(|e| RequestError::Decode(e.to_string()))
}
