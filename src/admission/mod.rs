//! # Admission Controller
//!
//! Two constant-time gates checked in order before a request reaches the
//! queue: a concurrency gate backed by a live counter, and a time-windowed
//! rate gate backed by a rolling deque of submission timestamps.

use crate::config::GatewayConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionRejection {
    ConcurrencySaturated { retry_after_ms: u64 },
    RateLimited { retry_after_ms: u64 },
}

const WINDOW: Duration = Duration::from_secs(60);

/// Admission controller. `in_flight` is a live counter owned
/// by the timeout executor / queue and read here without locking; the
/// rate window is this controller's own mutual-exclusion region.
pub struct AdmissionController {
    max_concurrent: usize,
    max_per_minute: usize,
    window: Mutex<VecDeque<Instant>>,
}

impl AdmissionController {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            max_per_minute: config.max_per_minute,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Checks both gates and records the submission timestamp on
    /// acceptance. `in_flight` must reflect the caller's current
    /// in-flight count.
    pub fn admit(&self, in_flight: &AtomicUsize, now: Instant) -> Result<(), AdmissionRejection> {
        if in_flight.load(Ordering::Acquire) >= self.max_concurrent {
            return Err(AdmissionRejection::ConcurrencySaturated {
                retry_after_ms: 1000,
            });
        }

        let mut window = self.window.lock();
        prune(&mut window, now);

        if window.len() >= self.max_per_minute {
            let oldest = *window.front().expect("non-empty: len >= max_per_minute > 0");
            let elapsed = now.saturating_duration_since(oldest);
            let retry_after_ms = WINDOW.as_millis().saturating_sub(elapsed.as_millis()) as u64;
            return Err(AdmissionRejection::RateLimited { retry_after_ms });
        }

        window.push_back(now);
        Ok(())
    }

    pub fn window_len(&self, now: Instant) -> usize {
        let mut window = self.window.lock();
        prune(&mut window, now);
        window.len()
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&front) = window.front() {
        if now.saturating_duration_since(front) > WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_when_concurrency_saturated() {
        let mut cfg = GatewayConfig::default();
        cfg.max_concurrent = 1;
        let admission = AdmissionController::new(&cfg);
        let in_flight = AtomicUsize::new(1);
        let result = admission.admit(&in_flight, Instant::now());
        assert_eq!(
            result,
            Err(AdmissionRejection::ConcurrencySaturated { retry_after_ms: 1000 })
        );
    }

    #[test]
    fn rate_gate_rejects_fourth_request_within_window() {
        let mut cfg = GatewayConfig::default();
        cfg.max_per_minute = 3;
        let admission = AdmissionController::new(&cfg);
        let in_flight = AtomicUsize::new(0);
        let now = Instant::now();

        for _ in 0..3 {
            admission.admit(&in_flight, now).unwrap();
        }
        let result = admission.admit(&in_flight, now);
        match result {
            Err(AdmissionRejection::RateLimited { retry_after_ms }) => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn window_prunes_entries_older_than_sixty_seconds() {
        let cfg = GatewayConfig::default();
        let admission = AdmissionController::new(&cfg);
        let in_flight = AtomicUsize::new(0);
        let t0 = Instant::now();
        admission.admit(&in_flight, t0).unwrap();
        let later = t0 + Duration::from_secs(61);
        assert_eq!(admission.window_len(later), 0);
    }
}
