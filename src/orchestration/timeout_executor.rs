//! # Timeout Executor
//!
//! Runs the opaque database call with a cancellation token and a
//! wall-clock deadline, tracking the set of currently in-flight
//! executions with `tokio::time::timeout` for deadline enforcement, and a
//! registry that guarantees cleanup on every exit path — success, timeout,
//! or cancellation.

use crate::common::QueryId;
use crate::error::GatewayError;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Registry of in-flight executions keyed by query id, each owning a
/// cooperative cancellation token.
#[derive(Default)]
pub struct TimeoutExecutor {
    in_flight: DashMap<QueryId, CancellationToken>,
}

impl TimeoutExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_flight: DashMap::new(),
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Registers `id`, runs `work(token)` under a `timeout_ms` deadline
    /// alarm, and guarantees the registry entry is removed on every exit
    /// path (success, error, timeout, or cancellation).
    pub async fn execute<F, Fut, T>(
        &self,
        id: QueryId,
        timeout_ms: u64,
        work: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let token = CancellationToken::new();
        self.in_flight.insert(id, token.clone());

        let deadline = tokio::time::Duration::from_millis(timeout_ms);
        let fut = work(token.clone());

        let outcome = tokio::select! {
            result = fut => result,
            _ = tokio::time::sleep(deadline) => {
                token.cancel();
                Err(GatewayError::Timeout { timeout_ms })
            }
        };

        self.in_flight.remove(&id);
        outcome
    }

    /// Triggers the cancellation token for `id`, if it is currently
    /// in-flight. Returns whether an entry was found.
    pub fn cancel(&self, id: QueryId) -> bool {
        if let Some(entry) = self.in_flight.get(&id) {
            entry.cancel();
            true
        } else {
            false
        }
    }

    /// Triggers every in-flight token and returns the count triggered.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.in_flight.iter() {
            entry.value().cancel();
            count += 1;
        }
        count
    }
}
