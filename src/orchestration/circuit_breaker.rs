//! # Circuit Breaker
//!
//! Three-state (closed/open/half-open) failure guard around each
//! execution attempt, keyed by a named scope. Closed/open/half-open
//! transitions happen under a `parking_lot::Mutex` with `tracing`
//! instrumentation, generalized from a single hard-coded
//! `success_threshold` scheme to a named-scope registry with
//! `halfOpenMaxProbes` admitted *concurrently* rather than sequentially.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::error::GatewayError;

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout_ms: u64,
    pub half_open_max_probes: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_probes: 3,
        }
    }
}

/// Snapshot of a scope's circuit state.
#[derive(Debug, Clone)]
pub struct CircuitStateSnapshot {
    pub state: CircuitStateKind,
    pub consecutive_failures: usize,
    pub last_failure_at_unix_ms: Option<u64>,
    pub open_until_unix_ms: Option<u64>,
    pub half_open_probes_used: usize,
}

struct Inner {
    state: CircuitStateKind,
    consecutive_failures: usize,
    last_failure_at_unix_ms: Option<u64>,
    open_until_unix_ms: Option<u64>,
    half_open_probes_used: usize,
    half_open_successes: usize,
    half_open_inflight: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitStateKind::Closed,
            consecutive_failures: 0,
            last_failure_at_unix_ms: None,
            open_until_unix_ms: None,
            half_open_probes_used: 0,
            half_open_successes: 0,
            half_open_inflight: 0,
        }
    }

    fn snapshot(&self) -> CircuitStateSnapshot {
        CircuitStateSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_at_unix_ms: self.last_failure_at_unix_ms,
            open_until_unix_ms: self.open_until_unix_ms,
            half_open_probes_used: self.half_open_probes_used,
        }
    }
}

/// A process-wide, per-scope circuit breaker. `CircuitState`
/// is mutated only under this scope's single mutual-exclusion region.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> CircuitStateSnapshot {
        self.inner.lock().snapshot()
    }

    /// Checks admission for a new call without executing it. Transitions
    /// open -> half_open on the first call observed after `open_until`
    /// elapses.
    pub fn try_acquire(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitStateKind::Closed => Ok(()),
            CircuitStateKind::Open => {
                let now = now_unix_ms();
                let open_until = inner.open_until_unix_ms.unwrap_or(u64::MAX);
                if now >= open_until {
                    inner.state = CircuitStateKind::HalfOpen;
                    inner.half_open_probes_used = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_inflight = 0;
                    info!(scope = %self.name, "circuit transitioning open -> half_open");
                    self.admit_half_open_probe(&mut inner)
                } else {
                    Err(GatewayError::CircuitOpen {
                        scope: self.name.clone(),
                        open_until_unix_ms: open_until,
                    })
                }
            }
            CircuitStateKind::HalfOpen => self.admit_half_open_probe(&mut inner),
        }
    }

    fn admit_half_open_probe(&self, inner: &mut Inner) -> Result<(), GatewayError> {
        if inner.half_open_inflight >= self.config.half_open_max_probes {
            return Err(GatewayError::CircuitOpen {
                scope: self.name.clone(),
                open_until_unix_ms: inner.open_until_unix_ms.unwrap_or_else(now_unix_ms),
            });
        }
        inner.half_open_inflight += 1;
        inner.half_open_probes_used += 1;
        Ok(())
    }

    /// Runs `work` under circuit-breaker admission, reporting the outcome
    /// back to the breaker on every exit path.
    pub async fn call<F, Fut, T>(&self, work: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        self.try_acquire()?;
        let was_half_open = matches!(self.inner.lock().state, CircuitStateKind::HalfOpen);
        let result = work().await;
        match &result {
            Ok(_) => self.on_success(was_half_open),
            Err(e) if e.is_circuit_failure() => self.on_failure(was_half_open),
            Err(_) => self.on_non_failure_exit(was_half_open),
        }
        result
    }

    fn on_success(&self, was_half_open: bool) {
        let mut inner = self.inner.lock();
        if was_half_open {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_max_probes {
                inner.state = CircuitStateKind::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_probes_used = 0;
                inner.half_open_successes = 0;
                info!(scope = %self.name, "circuit half_open -> closed");
            }
        } else {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, was_half_open: bool) {
        let mut inner = self.inner.lock();
        let now = now_unix_ms();
        inner.last_failure_at_unix_ms = Some(now);
        if was_half_open {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
            self.trip_open(&mut inner, now);
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold {
            self.trip_open(&mut inner, now);
        }
    }

    fn trip_open(&self, inner: &mut Inner, now: u64) {
        inner.state = CircuitStateKind::Open;
        inner.open_until_unix_ms = Some(now + self.config.recovery_timeout_ms);
        inner.half_open_probes_used = 0;
        inner.half_open_successes = 0;
        inner.half_open_inflight = 0;
        warn!(scope = %self.name, open_until = inner.open_until_unix_ms, "circuit tripped open");
    }

    /// A non-circuit-failure exit (e.g. explicit cancellation) releases a
    /// half-open probe slot without counting as success or failure.
    fn on_non_failure_exit(&self, was_half_open: bool) {
        if was_half_open {
            let mut inner = self.inner.lock();
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }

    /// Unconditionally returns to closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::new();
        info!(scope = %self.name, "circuit reset to closed");
    }
}

/// Process-wide registry of circuit breakers keyed by scope name (spec
/// §4.7 "scope names are process-global singletons").
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    scopes: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    scopes_created: AtomicU64,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            scopes: Mutex::new(HashMap::new()),
            scopes_created: AtomicU64::new(0),
        }
    }

    pub fn get_or_create(&self, scope: &str) -> Arc<CircuitBreaker> {
        let mut scopes = self.scopes.lock();
        if let Some(existing) = scopes.get(scope) {
            return existing.clone();
        }
        let breaker = CircuitBreaker::new(scope.to_string(), self.default_config);
        scopes.insert(scope.to_string(), breaker.clone());
        self.scopes_created.fetch_add(1, Ordering::Relaxed);
        breaker
    }

    pub fn all_snapshots(&self) -> HashMap<String, CircuitStateSnapshot> {
        self.scopes
            .lock()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
