//! # Common Types
//!
//! Shared types and the lightweight component-lifecycle trait used across
//! the gateway's pipeline stages. Trimmed from a broader shared-kernel
//! module down to what the safe-query pipeline actually needs: tenant and
//! workflow identity, load-level classification, and a `Component` trait
//! each pipeline stage can implement for uniform health reporting.

pub mod bounded_map;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use bounded_map::BoundedFifoMap;

/// A tenant identity used for data isolation.
pub type TenantId = String;

/// Unique identifier for a submitted query.
pub type QueryId = uuid::Uuid;

/// Business policy flag controlling how strictly tenant isolation is
/// enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    /// Single-company analysis; tenant filter is mandatory.
    Audit,
    /// Portfolio-wide analysis; tenant filter is optional.
    Lending,
}

/// Coarse system-load classification consumed by the adaptive governor
/// and derived by the admission/queue layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LoadLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for LoadLevel {
    fn default() -> Self {
        LoadLevel::Low
    }
}

/// Severity of a validator violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Health status of a pipeline component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Base trait implemented by each major pipeline stage so the orchestrator
/// can report aggregate health uniformly.
pub trait Component: Send + Sync {
    fn health_check(&self) -> HealthStatus;
}

/// Injectable wall-clock, so orchestration-level
/// timing decisions (load classification, periodic metrics emission) can
/// be driven deterministically in tests. Submodules with their own
/// internal timing invariants (the admission rate window, the circuit
/// breaker's recovery deadline) use `std::time::Instant`/`SystemTime`
/// directly, since their correctness only depends on elapsed real time,
/// not on a value a test needs to control independently of `tokio`'s own
/// paused-time facilities.
pub trait Clock: Send + Sync {
    fn now_unix_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A generic metric value, used by the metrics recorder's custom-metric
/// extension point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
}

/// Per-component statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatistics {
    pub component_name: String,
    pub uptime: Duration,
    pub total_operations: u64,
    pub failed_operations: u64,
    pub avg_latency_ms: f64,
    pub custom_metrics: HashMap<String, MetricValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_level_orders_low_to_critical() {
        assert!(LoadLevel::Low < LoadLevel::Medium);
        assert!(LoadLevel::Medium < LoadLevel::High);
        assert!(LoadLevel::High < LoadLevel::Critical);
    }

    #[test]
    fn workflow_mode_serializes_lowercase() {
        let s = serde_json::to_string(&WorkflowMode::Audit).unwrap();
        assert_eq!(s, "\"audit\"");
    }
}
