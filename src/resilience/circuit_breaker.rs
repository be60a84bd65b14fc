//! Per-resource circuit breakers.
//!
//! `Closed` passes calls through and counts consecutive failures. At the
//! threshold the circuit goes `Open` and fails fast. Once the cooldown has
//! elapsed (checked lazily on the next call, no timer) a single probe is let
//! through in `HalfOpen`: success closes the circuit, failure re-opens it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::CircuitOpenError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Counters for one resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls rejected without reaching the resource.
    pub rejected: u64,
    pub opened_at: Option<Instant>,
}

impl CircuitStats {
    /// Successes as a fraction of calls that reached the resource.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.successes + self.failures;
        if attempted == 0 {
            1.0
        } else {
            self.successes as f64 / attempted as f64
        }
    }
}

#[derive(Debug, Default)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_requests: u64,
    successes: u64,
    failures: u64,
    rejected: u64,
}

impl Circuit {
    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            total_requests: self.total_requests,
            successes: self.successes,
            failures: self.failures,
            rejected: self.rejected,
            opened_at: self.opened_at,
        }
    }
}

/// Circuit breakers keyed by downstream resource (e.g. an endpoint path).
///
/// One failing resource never blocks calls to another.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` through the breaker for `resource`. Every error counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, resource: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.call_with(resource, f, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors for which `is_failure`
    /// returns `true` count against the circuit. Other errors are passed
    /// through and treated as proof the resource is reachable.
    pub async fn call_with<T, E, F, Fut, C>(
        &self,
        resource: &str,
        f: F,
        is_failure: C,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
        C: FnOnce(&E) -> bool,
    {
        let mut permit = self.acquire(resource)?;
        let result = f().await;
        let failed = match &result {
            Ok(_) => false,
            Err(e) => is_failure(e),
        };
        permit.complete(!failed);
        result
    }

    /// Stored state for `resource`. An open circuit whose cooldown has
    /// elapsed still reads `Open` until the next call probes it.
    pub fn state(&self, resource: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(resource)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    pub fn stats(&self, resource: &str) -> Option<CircuitStats> {
        self.circuits.lock().get(resource).map(Circuit::stats)
    }

    /// Stats for every known resource.
    pub fn all_stats(&self) -> HashMap<String, CircuitStats> {
        self.circuits
            .lock()
            .iter()
            .map(|(k, c)| (k.clone(), c.stats()))
            .collect()
    }

    /// Forget all history for `resource`; it starts `Closed`.
    pub fn reset(&self, resource: &str) {
        if self.circuits.lock().remove(resource).is_some() {
            tracing::info!("Circuit reset for {}", resource);
        }
    }

    pub fn reset_all(&self) {
        self.circuits.lock().clear();
    }

    /// Open the circuit for `resource` now, starting a fresh cooldown.
    pub fn force_open(&self, resource: &str) {
        let mut circuits = self.circuits.lock();
        circuits
            .entry(resource.to_string())
            .or_default()
            .open(Instant::now());
        tracing::warn!("Circuit forced open for {}", resource);
    }

    fn acquire<'a>(&'a self, resource: &'a str) -> Result<Permit<'a>, CircuitOpenError> {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(resource.to_string()).or_default();
        circuit.total_requests += 1;

        let probe = match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = circuit
                    .opened_at
                    .map_or(true, |at| now.duration_since(at) >= self.config.cooldown);
                if !cooled {
                    circuit.rejected += 1;
                    return Err(CircuitOpenError {
                        resource: resource.to_string(),
                    });
                }
                tracing::info!("Circuit half-open for {}, sending probe", resource);
                circuit.state = CircuitState::HalfOpen;
                circuit.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    circuit.rejected += 1;
                    return Err(CircuitOpenError {
                        resource: resource.to_string(),
                    });
                }
                circuit.probe_in_flight = true;
                true
            }
        };

        Ok(Permit {
            registry: self,
            resource,
            probe,
            done: false,
        })
    }

    fn record(&self, resource: &str, probe: bool, success: bool) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(resource) else {
            // Reset while the call was in flight.
            return;
        };
        if probe {
            circuit.probe_in_flight = false;
        }

        if success {
            circuit.successes += 1;
            circuit.consecutive_failures = 0;
            if circuit.state == CircuitState::HalfOpen {
                tracing::info!("Probe succeeded, circuit closed for {}", resource);
            }
            if circuit.state != CircuitState::Open {
                circuit.state = CircuitState::Closed;
                circuit.opened_at = None;
            }
            return;
        }

        circuit.failures += 1;
        circuit.consecutive_failures += 1;
        match circuit.state {
            CircuitState::HalfOpen if probe => {
                tracing::warn!("Probe failed, circuit re-opened for {}", resource);
                circuit.open(now);
            }
            CircuitState::Closed
                if circuit.consecutive_failures >= self.config.failure_threshold =>
            {
                tracing::warn!(
                    "Circuit opened for {} after {} consecutive failure(s)",
                    resource,
                    circuit.consecutive_failures
                );
                circuit.open(now);
            }
            _ => {}
        }
    }

    fn release_probe(&self, resource: &str) {
        if let Some(circuit) = self.circuits.lock().get_mut(resource) {
            circuit.probe_in_flight = false;
        }
    }
}

/// Outstanding admission. Dropping an unfinished probe frees the probe slot
/// so a cancelled probe does not wedge the circuit in `HalfOpen`.
struct Permit<'a> {
    registry: &'a CircuitBreakerRegistry,
    resource: &'a str,
    probe: bool,
    done: bool,
}

impl Permit<'_> {
    fn complete(&mut self, success: bool) {
        self.done = true;
        self.registry.record(self.resource, self.probe, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.done {
            tracing::debug!("Probe for {} cancelled", self.resource);
            self.registry.release_probe(self.resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(threshold: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(1),
        })
    }

    async fn fail(reg: &CircuitBreakerRegistry, calls: &AtomicUsize) -> Result<(), RequestError> {
        reg.call("/api", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RequestError::Network("refused".into()))
        })
        .await
    }

    async fn succeed(reg: &CircuitBreakerRegistry, calls: &AtomicUsize) -> Result<(), RequestError> {
        reg.call("/api", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let reg = registry(3);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&reg, &calls).await, Err(RequestError::Network(_))));
        }
        assert_eq!(reg.state("/api"), CircuitState::Open);

        let err = succeed(&reg, &calls).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3, "open circuit must not call through");
        assert_eq!(reg.stats("/api").unwrap().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_cooldown() {
        let reg = registry(3);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&reg, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(reg.state("/api"), CircuitState::Open, "transition is lazy");

        let probe_calls = AtomicUsize::new(0);
        let probe = reg.call("/api", || async {
            probe_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, RequestError>(())
        });
        let concurrent = async {
            tokio::task::yield_now().await;
            reg.call("/api", || async {
                probe_calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RequestError>(())
            })
            .await
        };
        let (probe_result, concurrent_result) = tokio::join!(probe, concurrent);

        assert!(probe_result.is_ok());
        assert!(concurrent_result.unwrap_err().is_circuit_open());
        assert_eq!(probe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(reg.state("/api"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let reg = registry(2);
        let calls = AtomicUsize::new(0);
        let _ = fail(&reg, &calls).await;
        let _ = fail(&reg, &calls).await;

        tokio::time::advance(Duration::from_secs(1)).await;
        let _ = fail(&reg, &calls).await;
        assert_eq!(reg.state("/api"), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Fresh cooldown from the failed probe.
        assert!(succeed(&reg, &calls).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let reg = registry(3);
        let calls = AtomicUsize::new(0);
        let _ = fail(&reg, &calls).await;
        let _ = fail(&reg, &calls).await;
        succeed(&reg, &calls).await.unwrap();
        let _ = fail(&reg, &calls).await;
        let _ = fail(&reg, &calls).await;
        assert_eq!(reg.state("/api"), CircuitState::Closed);
        assert_eq!(reg.stats("/api").unwrap().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_resources_are_isolated() {
        let reg = registry(1);
        let calls = AtomicUsize::new(0);
        let _ = fail(&reg, &calls).await;
        assert_eq!(reg.state("/api"), CircuitState::Open);

        let other: Result<u8, RequestError> = reg.call("/health", || async { Ok(1) }).await;
        assert_eq!(other, Ok(1));
        assert_eq!(reg.state("/health"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_releases_slot() {
        let reg = registry(1);
        let calls = AtomicUsize::new(0);
        let _ = fail(&reg, &calls).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let hung = reg.call("/api", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, RequestError>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), hung).await;
        assert!(timed_out.is_err());
        assert_eq!(reg.state("/api"), CircuitState::HalfOpen);

        succeed(&reg, &calls).await.unwrap();
        assert_eq!(reg.state("/api"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_failures_do_not_trip() {
        let reg = registry(1);
        let result: Result<(), RequestError> = reg
            .call_with(
                "/api",
                || async {
                    Err(RequestError::Http {
                        status: 404,
                        message: "missing".into(),
                    })
                },
                |e| e.status().map_or(true, |s| s >= 500),
            )
            .await;
        assert_eq!(result.unwrap_err().status(), Some(404));
        assert_eq!(reg.state("/api"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let reg = registry(5);
        reg.force_open("/api");
        assert_eq!(reg.state("/api"), CircuitState::Open);
        let calls = AtomicUsize::new(0);
        assert!(succeed(&reg, &calls).await.unwrap_err().is_circuit_open());

        reg.reset("/api");
        assert!(reg.stats("/api").is_none());
        succeed(&reg, &calls).await.unwrap();
        let stats = reg.stats("/api").unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.success_rate(), 1.0);
    }
}
