//! # Metrics & Audit Recorder
//!
//! Counters, rolling averages, gauges, and an append-only audit stream.
//! The audit writer is non-blocking for callers: a bounded ring buffer
//! drops the oldest record on overflow and increments a dropped-record
//! counter, pairing the audit log with `tracing` output the same way a
//! compliance-oriented audit logger would, trimmed down to the four event
//! kinds this pipeline needs.
//!
//! Redaction: no parameter values or SQL literals are ever recorded, only
//! query length; no authorization material is recorded at all.

use crate::common::{QueryId, TenantId, WorkflowMode};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventCategory {
    QueryAttempt,
    QueryExecution,
    SystemMetrics,
    MetricsReset,
}

/// Append-only, redacted audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp_utc: DateTime<Utc>,
    pub event: AuditEventCategory,
    pub query_id: Option<QueryId>,
    pub tenant_id: Option<TenantId>,
    pub workflow_mode: Option<WorkflowMode>,
    pub query_length: Option<usize>,
    pub blocked: bool,
    pub execution_time_ms: Option<f64>,
    pub row_count: Option<u64>,
    pub error_message: Option<String>,
}

const FORBIDDEN_SUBSTRINGS: &[&str] = &["password", "apikey", "secret"];

/// Strips any accidental occurrence of a forbidden substring from a
/// caller-supplied error message before it is recorded. Defense in depth:
/// callers should never pass raw SQL literals or secrets here in the
/// first place.
fn redact_message(message: &str) -> String {
    let lower = message.to_lowercase();
    if FORBIDDEN_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        "[redacted]".to_string()
    } else {
        message.to_string()
    }
}

const AUDIT_BUFFER_DEFAULT_CAPACITY: usize = 10_000;

/// Non-blocking, bounded, append-only audit buffer. Overflow drops the
/// oldest record and increments `dropped`.
pub struct AuditSink {
    buffer: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl AuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn write(&self, record: AuditRecord) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "audit buffer full, dropping oldest record");
        }
        buffer.push_back(record);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Supplemental read API, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let buffer = self.buffer.lock();
        buffer.iter().rev().take(limit).cloned().collect()
    }

    pub fn by_tenant(&self, tenant_id: &str) -> Vec<AuditRecord> {
        let buffer = self.buffer.lock();
        buffer
            .iter()
            .filter(|r| r.tenant_id.as_deref() == Some(tenant_id))
            .cloned()
            .collect()
    }

    /// Retention: evict records older than `retention_days`. Called
    /// periodically; this in-memory audit stream has no persistent store
    /// to key-expire, so this sweeps the buffer directly.
    pub fn evict_older_than(&self, retention_days: u32) {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let mut buffer = self.buffer.lock();
        buffer.retain(|r| r.timestamp_utc >= cutoff);
    }
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::new(AUDIT_BUFFER_DEFAULT_CAPACITY)
    }
}

const EXEC_TIME_WINDOW: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_submitted: u64,
    pub total_blocked: u64,
    pub total_timeouts: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub average_execution_time_ms: f64,
    pub queue_length: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceAlert {
    LowSuccessRate,
    HighAvgExecution,
    QueueBacklog,
    HighTimeoutRate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub metrics: MetricsSnapshot,
    pub success_rate: f64,
    pub timeout_rate: f64,
    pub alerts: Vec<PerformanceAlert>,
}

/// Metrics recorder. Counters are monotonic unless reset;
/// gauges are snapshot on demand from whatever owns the live queue/
/// in-flight counters.
pub struct MetricsRecorder {
    total_submitted: AtomicU64,
    total_blocked: AtomicU64,
    total_timeouts: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
    exec_samples: Mutex<VecDeque<f64>>,
    pub audit: AuditSink,
}

impl MetricsRecorder {
    pub fn new(audit_buffer_capacity: usize) -> Self {
        Self {
            total_submitted: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            exec_samples: Mutex::new(VecDeque::new()),
            audit: AuditSink::new(audit_buffer_capacity),
        }
    }

    pub fn record_submitted(&self) {
        self.total_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.total_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, execution_time_ms: f64) {
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.exec_samples.lock();
        samples.push_back(execution_time_ms);
        if samples.len() > EXEC_TIME_WINDOW {
            samples.pop_front();
        }
    }

    pub fn record_failed(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.total_submitted.store(0, Ordering::Relaxed);
        self.total_blocked.store(0, Ordering::Relaxed);
        self.total_timeouts.store(0, Ordering::Relaxed);
        self.total_completed.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        self.exec_samples.lock().clear();
        self.audit.write(AuditRecord {
            timestamp_utc: Utc::now(),
            event: AuditEventCategory::MetricsReset,
            query_id: None,
            tenant_id: None,
            workflow_mode: None,
            query_length: None,
            blocked: false,
            execution_time_ms: None,
            row_count: None,
            error_message: None,
        });
        debug!("metrics reset");
    }

    fn average_execution_ms(&self) -> f64 {
        let samples = self.exec_samples.lock();
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }

    pub fn snapshot(&self, queue_length: usize, in_flight: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            total_blocked: self.total_blocked.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            average_execution_time_ms: self.average_execution_ms(),
            queue_length,
            in_flight,
        }
    }

    /// Emits a `query_attempt` audit record plus the ambient `tracing`
    /// event.
    pub fn audit_attempt(
        &self,
        query_id: Option<QueryId>,
        tenant_id: &str,
        mode: WorkflowMode,
        query_len: usize,
        blocked: bool,
    ) {
        self.audit.write(AuditRecord {
            timestamp_utc: Utc::now(),
            event: AuditEventCategory::QueryAttempt,
            query_id,
            tenant_id: Some(tenant_id.to_string()),
            workflow_mode: Some(mode),
            query_length: Some(query_len),
            blocked,
            execution_time_ms: None,
            row_count: None,
            error_message: None,
        });
        if blocked {
            warn!(tenant_id, ?mode, query_len, "query_attempt blocked");
        } else {
            info!(tenant_id, ?mode, query_len, "query_attempt admitted");
        }
    }

    /// Emits `query_execution` on terminal state.
    #[allow(clippy::too_many_arguments)]
    pub fn audit_execution(
        &self,
        query_id: QueryId,
        tenant_id: &str,
        mode: WorkflowMode,
        status: &str,
        execution_time_ms: Option<f64>,
        row_count: Option<u64>,
        error_message: Option<String>,
    ) {
        let redacted_error = error_message.map(|m| redact_message(&m));
        self.audit.write(AuditRecord {
            timestamp_utc: Utc::now(),
            event: AuditEventCategory::QueryExecution,
            query_id: Some(query_id),
            tenant_id: Some(tenant_id.to_string()),
            workflow_mode: Some(mode),
            query_length: None,
            blocked: false,
            execution_time_ms,
            row_count,
            error_message: redacted_error.clone(),
        });
        match status {
            "completed" => info!(%query_id, tenant_id, execution_time_ms, row_count, "query_execution completed"),
            "timeout" => warn!(%query_id, tenant_id, "query_execution timed out"),
            "failed" => warn!(%query_id, tenant_id, error = ?redacted_error, "query_execution failed"),
            _ => debug!(%query_id, tenant_id, status, "query_execution"),
        }
    }

    /// Emits the periodic `system_metrics` event (every 30s in production;
    /// callers drive the cadence via their own timer task).
    pub fn audit_system_metrics(&self, queue_length: usize, in_flight: usize) {
        let snapshot = self.snapshot(queue_length, in_flight);
        self.audit.write(AuditRecord {
            timestamp_utc: Utc::now(),
            event: AuditEventCategory::SystemMetrics,
            query_id: None,
            tenant_id: None,
            workflow_mode: None,
            query_length: None,
            blocked: false,
            execution_time_ms: Some(snapshot.average_execution_time_ms),
            row_count: None,
            error_message: None,
        });
        debug!(?snapshot, "system_metrics");
    }

    /// On-demand performance report with alert thresholds.
    pub fn performance_report(&self, queue_length: usize, in_flight: usize) -> PerformanceReport {
        let metrics = self.snapshot(queue_length, in_flight);
        let terminal = metrics.total_completed + metrics.total_failed + metrics.total_timeouts;
        let success_rate = if terminal == 0 {
            1.0
        } else {
            metrics.total_completed as f64 / terminal as f64
        };
        let timeout_rate = if terminal == 0 {
            0.0
        } else {
            metrics.total_timeouts as f64 / terminal as f64
        };

        let mut alerts = Vec::new();
        if success_rate < 0.95 {
            alerts.push(PerformanceAlert::LowSuccessRate);
        }
        if metrics.average_execution_time_ms > 5_000.0 {
            alerts.push(PerformanceAlert::HighAvgExecution);
        }
        if queue_length > 10 {
            alerts.push(PerformanceAlert::QueueBacklog);
        }
        if timeout_rate > 0.10 {
            alerts.push(PerformanceAlert::HighTimeoutRate);
        }

        PerformanceReport {
            metrics,
            success_rate,
            timeout_rate,
            alerts,
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(AUDIT_BUFFER_DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_sink_drops_oldest_on_overflow() {
        let sink = AuditSink::new(2);
        for i in 0..5 {
            sink.write(AuditRecord {
                timestamp_utc: Utc::now(),
                event: AuditEventCategory::QueryAttempt,
                query_id: None,
                tenant_id: Some(format!("T{i}")),
                workflow_mode: None,
                query_length: None,
                blocked: false,
                execution_time_ms: None,
                row_count: None,
                error_message: None,
            });
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.dropped_count(), 3);
        let recent = sink.recent(2);
        assert_eq!(recent[0].tenant_id.as_deref(), Some("T4"));
    }

    #[test]
    fn no_audit_record_leaks_forbidden_substrings() {
        let metrics = MetricsRecorder::default();
        metrics.audit_execution(
            uuid::Uuid::new_v4(),
            "T1",
            WorkflowMode::Audit,
            "failed",
            None,
            None,
            Some("connection refused; password=hunter2".to_string()),
        );
        for record in metrics.audit.recent(10) {
            let joined = format!("{:?}", record);
            assert!(!joined.to_lowercase().contains("password"));
            assert!(!joined.to_lowercase().contains("apikey"));
            assert!(!joined.to_lowercase().contains("secret"));
        }
    }

    #[test]
    fn performance_report_flags_low_success_rate() {
        let metrics = MetricsRecorder::default();
        for _ in 0..10 {
            metrics.record_failed();
        }
        let report = metrics.performance_report(0, 0);
        assert!(report.alerts.contains(&PerformanceAlert::LowSuccessRate));
    }

    #[test]
    fn rolling_average_window_caps_at_100_samples() {
        let metrics = MetricsRecorder::default();
        for i in 0..150 {
            metrics.record_completed(i as f64);
        }
        let snapshot = metrics.snapshot(0, 0);
        // average of the last 100 samples (50..149) is 99.5
        assert!((snapshot.average_execution_time_ms - 99.5).abs() < 0.01);
    }
}
