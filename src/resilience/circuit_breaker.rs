// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-tier circuit breaker built on `recloser`.
//!
//! Guards the authoritative tier so that an outage turns into fast
//! [`CircuitError::Rejected`] answers instead of a pile of timeouts.
//!
//! States:
//! - Closed: calls pass through, the failure rate is tracked over a ring
//! - Open: calls are rejected without touching the tier
//! - HalfOpen: after `recovery_timeout`, a few probe calls are let through
//!
//! A successful health probe calls [`TierCircuit::reset`], closing the
//! circuit immediately instead of waiting for the half-open window.

use parking_lot::RwLock;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the tier was not called
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure ratio over the closed-state window that trips the circuit
    pub error_rate: f32,
    /// Calls remembered while closed
    pub window: usize,
    /// Calls let through while half-open
    pub half_open_probes: usize,
    /// Time spent open before probing again
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            window: 10,
            half_open_probes: 1,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips after a handful of calls, reopens quickly.
    #[cfg(test)]
    #[must_use]
    pub fn test() -> Self {
        Self {
            error_rate: 0.5,
            window: 2,
            half_open_probes: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }

    fn build(&self) -> AsyncRecloser {
        Recloser::custom()
            .error_rate(self.error_rate)
            .closed_len(self.window.max(1))
            .half_open_len(self.half_open_probes.max(1))
            .open_wait(self.recovery_timeout)
            .build()
            .into()
    }
}

/// A named circuit breaker with call accounting.
pub struct TierCircuit {
    name: String,
    config: CircuitConfig,
    inner: RwLock<AsyncRecloser>,
    /// Set by a rejection, cleared by the next call that gets through
    tripped: AtomicBool,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl TierCircuit {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let inner = RwLock::new(config.build());
        Self {
            name: name.into(),
            config,
            inner,
            tripped: AtomicBool::new(false),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Best-effort state: recloser keeps its state private, so "open" means
    /// the most recent call was rejected.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        if self.tripped.load(Ordering::Relaxed) {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Run `f` through the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let breaker = self.inner.read().clone();

        match breaker.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.set_tripped(false);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.set_tripped(true);
                debug!(circuit = %self.name, "Circuit breaker rejected call");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.set_tripped(false);
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Close the circuit and forget the failure window.
    pub fn reset(&self) {
        *self.inner.write() = self.config.build();
        if self.tripped.swap(false, Ordering::Relaxed) {
            info!(circuit = %self.name, "Circuit breaker reset after successful probe");
        }
        crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
    }

    fn set_tripped(&self, tripped: bool) {
        let was = self.tripped.swap(tripped, Ordering::Relaxed);
        if was != tripped {
            let state = if tripped { CircuitState::Open } else { CircuitState::Closed };
            if tripped {
                warn!(circuit = %self.name, "Circuit breaker opened");
            } else {
                info!(circuit = %self.name, "Circuit breaker closed");
            }
            crate::metrics::set_circuit_state(&self.name, state as u8);
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Failed calls over all calls (0.0 - 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}

impl std::fmt::Debug for TierCircuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierCircuit")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("calls_total", &self.calls_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide_open() -> CircuitConfig {
        CircuitConfig {
            error_rate: 0.5,
            window: 2,
            half_open_probes: 1,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_passes_successful_calls() {
        let cb = TierCircuit::new("test", CircuitConfig::test());
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_tracks_inner_failures() {
        let cb = TierCircuit::new("test", CircuitConfig::test());
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_opens_after_repeated_failures() {
        let cb = TierCircuit::new("test", wide_open());

        for _ in 0..4 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;

        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert!(cb.is_open());
        assert!(cb.rejections() >= 1);
    }

    #[tokio::test]
    async fn test_reset_closes_open_circuit() {
        let cb = TierCircuit::new("test", wide_open());
        for _ in 0..5 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }
        assert!(cb.is_open());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_failure_rate() {
        let cb = TierCircuit::new(
            "test",
            CircuitConfig { window: 100, ..CircuitConfig::default() },
        );
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("x") }).await;

        assert!((cb.failure_rate() - 0.5).abs() < 0.01);
        assert_eq!(cb.calls_total(), 2);
    }
}
