//! # Pipeline Orchestrator
//!
//! Glues analyzer, validator, governor, cost estimator, admission
//! controller, priority queue, circuit breaker, and timeout executor
//! together behind a single public entry point, `Gateway::submit`.
//! `Gateway` is the composition root: it owns every pipeline stage and
//! plays the same "coordinates all governance activities" role a query
//! governor usually does, generalized here to the full pipeline rather
//! than one stage of it. `src/main.rs` constructs it and drives its
//! startup/shutdown sequence.

pub mod circuit_breaker;
pub mod timeout_executor;

use crate::admission::{AdmissionController, AdmissionRejection};
use crate::analyzer::Analyzer;
use crate::audit::MetricsRecorder;
use crate::common::{LoadLevel, QueryId, TenantId, WorkflowMode};
use crate::config::GatewayConfig;
use crate::cost_estimator::{CostEstimate, CostEstimator, RiskLevel, TableStatsProvider};
use crate::error::{GatewayError, Result as GatewayResult};
use crate::governor::Governor;
use crate::queue::{PriorityQueue, QueueItem, QueueState, QueueStats};
use crate::validator::{UploadTableExists, ValidationReport, Validator, Violation};
use async_trait::async_trait;
use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitStateSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use timeout_executor::TimeoutExecutor;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A single returned row; values are opaque JSON to the gateway (result
/// transformation is out of scope here).
pub type Row = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone)]
pub struct DbExecutionResult {
    pub rows: Vec<Row>,
    pub row_count: u64,
    pub execution_time_ms: f64,
}

/// External collaborator: the opaque
/// database runner. Implementations must observe `cancel` cooperatively;
/// the timeout executor never forcibly interrupts them.
#[async_trait]
pub trait DatabaseExecutor: Send + Sync {
    async fn execute(
        &self,
        governed_sql: &str,
        tenant_id: &str,
        mode: WorkflowMode,
        cancel: CancellationToken,
    ) -> GatewayResult<DbExecutionResult>;
}

/// Outcome of `Submit`.
#[derive(Debug, Clone)]
pub enum SubmitResult {
    Accepted {
        query_id: QueryId,
        estimated_wait_ms: u64,
    },
    Rejected {
        reason: RejectionReason,
        violations: Option<Vec<Violation>>,
        retry_after_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    AdmissionConcurrency,
    AdmissionRate,
    AnalyzerMalformed,
    ValidationRejected,
    CriticalRisk,
    GovernorRejected,
    QueueFull,
}

/// Outcome of `AwaitResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: QueueState,
    pub row_count: Option<u64>,
    pub execution_time_ms: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub in_flight: usize,
    pub queued: usize,
    pub queries_in_last_minute: usize,
    pub level: LoadLevel,
}

#[derive(Debug, Clone, Default)]
pub struct EmergencyStopOutcome {
    pub cancelled_executing: usize,
    pub cancelled_queued: usize,
}

#[derive(Debug, Clone)]
pub struct GatewayStats {
    pub queue: QueueStats,
    pub load: LoadSnapshot,
    pub metrics: crate::audit::MetricsSnapshot,
    pub circuits: HashMap<String, CircuitStateSnapshot>,
}

/// The public entry point of the safe-query execution gateway. Owns every
/// pipeline stage and wires them in the documented lock order: admission
/// -> queue -> circuit -> metrics.
pub struct Gateway {
    config: GatewayConfig,
    analyzer: Analyzer,
    admission: AdmissionController,
    queue: Arc<PriorityQueue>,
    circuits: CircuitBreakerRegistry,
    timeout_executor: Arc<TimeoutExecutor>,
    metrics: Arc<MetricsRecorder>,
    upload_check: Arc<dyn UploadTableExists>,
    table_stats: Arc<dyn TableStatsProvider>,
    db_executor: Arc<dyn DatabaseExecutor>,
    scheduler_started: AsyncMutex<bool>,
}

const DEFAULT_CIRCUIT_SCOPE: &str = "default";

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        upload_check: Arc<dyn UploadTableExists>,
        table_stats: Arc<dyn TableStatsProvider>,
        db_executor: Arc<dyn DatabaseExecutor>,
    ) -> Arc<Self> {
        let queue = PriorityQueue::new(config.max_queue_size, config.max_concurrent);
        let circuits = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            recovery_timeout_ms: config.recovery_timeout_ms,
            half_open_max_probes: config.half_open_max_probes,
        });
        let metrics = Arc::new(MetricsRecorder::new(config.audit_buffer_capacity));
        let analyzer = Analyzer::new(&config);
        let admission = AdmissionController::new(&config);

        Arc::new(Self {
            config,
            analyzer,
            admission,
            queue,
            circuits,
            timeout_executor: TimeoutExecutor::new(),
            metrics,
            upload_check,
            table_stats,
            db_executor,
            scheduler_started: AsyncMutex::new(false),
        })
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Starts the scheduler loop and the periodic `system_metrics`
    /// emitter. Idempotent: calling twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut started = self.scheduler_started.lock().await;
        if *started {
            return;
        }
        *started = true;

        let scheduler_gateway = self.clone();
        tokio::spawn(async move {
            scheduler_gateway.run_scheduler().await;
        });

        let metrics_gateway = self.clone();
        tokio::spawn(async move {
            metrics_gateway.run_metrics_emitter().await;
        });
    }

    async fn run_scheduler(self: Arc<Self>) {
        loop {
            let item = self.queue.dequeue().await;
            let gateway = self.clone();
            tokio::spawn(async move {
                gateway.execute_item(item).await;
            });
        }
    }

    async fn run_metrics_emitter(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let stats = self.queue.stats();
            self.metrics
                .audit_system_metrics(stats.queued, self.timeout_executor.in_flight_count());
            self.metrics
                .audit
                .evict_older_than(self.config.audit_retention_days);
        }
    }

    /// Runs a raw query through the full pipeline and either enqueues it
    /// or rejects it with a reason.
    pub async fn submit(
        &self,
        raw_query: String,
        tenant_id: TenantId,
        workflow_mode: WorkflowMode,
        priority: u8,
    ) -> SubmitResult {
        self.metrics.record_submitted();
        self.metrics
            .audit_attempt(None, &tenant_id, workflow_mode, raw_query.len(), false);

        // 1. Admission gate. Never reaches the database or the circuit
        // breaker on rejection.
        if let Err(rejection) = self
            .admission
            .admit(self.timeout_executor_in_flight(), std::time::Instant::now())
        {
            self.metrics.record_blocked();
            self.metrics
                .audit_attempt(None, &tenant_id, workflow_mode, raw_query.len(), true);
            return match rejection {
                AdmissionRejection::ConcurrencySaturated { retry_after_ms } => {
                    SubmitResult::Rejected {
                        reason: RejectionReason::AdmissionConcurrency,
                        violations: None,
                        retry_after_ms: Some(retry_after_ms),
                    }
                }
                AdmissionRejection::RateLimited { retry_after_ms } => SubmitResult::Rejected {
                    reason: RejectionReason::AdmissionRate,
                    violations: None,
                    retry_after_ms: Some(retry_after_ms),
                },
            };
        }

        // 2. Analyze.
        let shape = match self.analyzer.analyze(&raw_query) {
            Ok(shape) => shape,
            Err(GatewayError::AnalyzerMalformed(_)) => {
                self.metrics.record_blocked();
                self.metrics
                    .audit_attempt(None, &tenant_id, workflow_mode, raw_query.len(), true);
                return SubmitResult::Rejected {
                    reason: RejectionReason::AnalyzerMalformed,
                    violations: None,
                    retry_after_ms: None,
                };
            }
            Err(_) => unreachable!("analyzer only returns AnalyzerMalformed"),
        };

        // 3. Validate.
        let validator = Validator::new(&self.config);
        let report: ValidationReport = validator
            .validate(&shape, &tenant_id, workflow_mode, self.upload_check.as_ref())
            .await;
        if !report.is_valid {
            self.metrics.record_blocked();
            self.metrics
                .audit_attempt(None, &tenant_id, workflow_mode, raw_query.len(), true);
            return SubmitResult::Rejected {
                reason: RejectionReason::ValidationRejected,
                violations: Some(report.violations),
                retry_after_ms: None,
            };
        }

        // 4. Cost estimate.
        let estimate: CostEstimate =
            CostEstimator::estimate(&shape, self.table_stats.as_ref(), &self.config).await;
        if estimate.risk_level == RiskLevel::Critical && self.config.reject_critical_risk {
            self.metrics.record_blocked();
            self.metrics
                .audit_attempt(None, &tenant_id, workflow_mode, raw_query.len(), true);
            return SubmitResult::Rejected {
                reason: RejectionReason::CriticalRisk,
                violations: None,
                retry_after_ms: None,
            };
        }

        // 5. Adaptive governance under current system load.
        let load = self.current_load_level();
        let governor = Governor::new(&self.config);
        let governance = governor.govern_adaptive(
            &raw_query,
            &shape,
            workflow_mode,
            &tenant_id,
            self.config.execution_timeout_ms,
            load,
        );
        if !governance.allowed {
            self.metrics.record_blocked();
            self.metrics
                .audit_attempt(None, &tenant_id, workflow_mode, raw_query.len(), true);
            return SubmitResult::Rejected {
                reason: RejectionReason::GovernorRejected,
                violations: None,
                retry_after_ms: None,
            };
        }
        let governed_sql = governance
            .modified_query
            .unwrap_or_else(|| raw_query.clone());

        // 6. Enqueue.
        let item = QueueItem::new(governed_sql, tenant_id, workflow_mode, priority);
        match self.queue.enqueue(item) {
            Ok((query_id, estimated_wait_ms)) => SubmitResult::Accepted {
                query_id,
                estimated_wait_ms,
            },
            Err(()) => {
                self.metrics.record_blocked();
                SubmitResult::Rejected {
                    reason: RejectionReason::QueueFull,
                    violations: None,
                    retry_after_ms: Some(500),
                }
            }
        }
    }

    /// `AwaitResult`.
    pub async fn await_result(&self, query_id: QueryId, wait_timeout_ms: u64) -> ExecutionOutcome {
        let item = self
            .queue
            .await_terminal(query_id, Duration::from_millis(wait_timeout_ms))
            .await;
        match item {
            Some(item) => ExecutionOutcome {
                status: item.state,
                row_count: item.row_count,
                execution_time_ms: item
                    .dequeued_at
                    .zip(item.completed_at)
                    .map(|(d, c)| c.saturating_duration_since(d).as_millis() as f64),
                error: item.error,
            },
            None => ExecutionOutcome {
                status: QueueState::Queued,
                row_count: None,
                execution_time_ms: None,
                error: None,
            },
        }
    }

    /// `Cancel`. Cooperative: marks the item cancelled and, if
    /// executing, triggers the execution's cancellation token.
    pub fn cancel(&self, query_id: QueryId) -> bool {
        let found = self.queue.cancel(query_id);
        self.timeout_executor.cancel(query_id);
        found
    }

    /// `Stats`.
    pub fn stats(&self) -> GatewayStats {
        let queue_stats = self.queue.stats();
        let load = self.load_snapshot(&queue_stats);
        GatewayStats {
            metrics: self
                .metrics
                .snapshot(queue_stats.queued, self.timeout_executor.in_flight_count()),
            circuits: self.circuits.all_snapshots(),
            queue: queue_stats,
            load,
        }
    }

    /// `EmergencyStop`.
    pub fn emergency_stop(&self) -> EmergencyStopOutcome {
        let (result, executing_ids) = self.queue.emergency_stop();
        for id in executing_ids {
            self.timeout_executor.cancel(id);
        }
        warn!(
            cancelled_executing = result.cancelled_executing,
            cancelled_queued = result.cancelled_queued,
            "emergency stop issued"
        );
        EmergencyStopOutcome {
            cancelled_executing: result.cancelled_executing,
            cancelled_queued: result.cancelled_queued,
        }
    }

    async fn execute_item(self: Arc<Self>, item: QueueItem) {
        let breaker = self.circuits.get_or_create(DEFAULT_CIRCUIT_SCOPE);
        let id = item.id;
        let tenant_id = item.tenant_id.clone();
        let mode = item.workflow_mode;
        let sql = item.raw_query.clone();
        let timeout_ms = self.config.execution_timeout_ms;
        let db_executor = self.db_executor.clone();
        let timeout_executor = self.timeout_executor.clone();

        let result = breaker
            .call(|| async move {
                timeout_executor
                    .execute(id, timeout_ms, |token| async move {
                        db_executor.execute(&sql, &tenant_id, mode, token).await
                    })
                    .await
            })
            .await;

        match result {
            Ok(db_result) => {
                self.queue.complete(
                    id,
                    QueueState::Completed,
                    Some(db_result.row_count),
                    None,
                );
                self.metrics.record_completed(db_result.execution_time_ms);
                self.metrics.audit_execution(
                    id,
                    &item.tenant_id,
                    mode,
                    "completed",
                    Some(db_result.execution_time_ms),
                    Some(db_result.row_count),
                    None,
                );
                info!(%id, "query_execution completed");
            }
            Err(GatewayError::Timeout { timeout_ms }) => {
                let message = format!("execution timed out after {timeout_ms}ms");
                self.queue
                    .complete(id, QueueState::Timeout, None, Some(message.clone()));
                self.metrics.record_timeout();
                self.metrics.audit_execution(
                    id,
                    &item.tenant_id,
                    mode,
                    "timeout",
                    None,
                    None,
                    Some(message),
                );
            }
            Err(GatewayError::Cancelled) => {
                self.queue.complete(
                    id,
                    QueueState::Cancelled,
                    None,
                    Some("cancelled".to_string()),
                );
                self.metrics.audit_execution(
                    id,
                    &item.tenant_id,
                    mode,
                    "cancelled",
                    None,
                    None,
                    Some("cancelled".to_string()),
                );
            }
            Err(GatewayError::CircuitOpen { scope, .. }) => {
                let message = format!("circuit '{scope}' is open");
                self.queue
                    .complete(id, QueueState::Failed, None, Some(message.clone()));
                self.metrics.record_failed();
                self.metrics.audit_execution(
                    id,
                    &item.tenant_id,
                    mode,
                    "failed",
                    None,
                    None,
                    Some(message),
                );
            }
            Err(e) => {
                let message = e.to_string();
                self.queue
                    .complete(id, QueueState::Failed, None, Some(message.clone()));
                self.metrics.record_failed();
                self.metrics.audit_execution(
                    id,
                    &item.tenant_id,
                    mode,
                    "failed",
                    None,
                    None,
                    Some(message),
                );
            }
        }
    }

    fn timeout_executor_in_flight(&self) -> &std::sync::atomic::AtomicUsize {
        self.queue.in_flight_counter()
    }

    /// Derives `LoadLevel` from current queue/concurrency saturation.
    /// This is derived state — never stored, always computed from counters
    /// plus the rolling admission window. The exact saturation thresholds
    /// are this crate's own choice, recorded as an Open Question decision
    /// in DESIGN.md.
    fn current_load_level(&self) -> LoadLevel {
        let in_flight = self.timeout_executor.in_flight_count();
        let queue_stats = self.queue.stats();
        let concurrency_ratio = in_flight as f64 / self.config.max_concurrent.max(1) as f64;
        let queue_ratio = queue_stats.queued as f64 / self.config.max_queue_size.max(1) as f64;
        let ratio = concurrency_ratio.max(queue_ratio);

        if ratio >= 0.9 {
            LoadLevel::Critical
        } else if ratio >= 0.7 {
            LoadLevel::High
        } else if ratio >= 0.4 {
            LoadLevel::Medium
        } else {
            LoadLevel::Low
        }
    }

    fn load_snapshot(&self, queue_stats: &QueueStats) -> LoadSnapshot {
        let in_flight = self.timeout_executor.in_flight_count();
        LoadSnapshot {
            in_flight,
            queued: queue_stats.queued,
            queries_in_last_minute: self.admission.window_len(std::time::Instant::now()),
            level: self.current_load_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost_estimator::DefaultTableStats;
    use crate::validator::AlwaysExistsUploadTable;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubDb {
        rows: Vec<Row>,
        fail: AtomicBool,
        delay_ms: u64,
    }

    #[async_trait]
    impl DatabaseExecutor for StubDb {
        async fn execute(
            &self,
            _sql: &str,
            _tenant_id: &str,
            _mode: WorkflowMode,
            cancel: CancellationToken,
        ) -> GatewayResult<DbExecutionResult> {
            if self.delay_ms > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                }
            }
            if self.fail.load(Ordering::Relaxed) {
                return Err(GatewayError::ExecutionFailed {
                    underlying: "stub failure".to_string(),
                });
            }
            Ok(DbExecutionResult {
                rows: self.rows.clone(),
                row_count: self.rows.len() as u64,
                execution_time_ms: 1.0,
            })
        }
    }

    fn gateway_with(db: StubDb) -> Arc<Gateway> {
        Gateway::new(
            GatewayConfig::default(),
            Arc::new(AlwaysExistsUploadTable),
            Arc::new(DefaultTableStats),
            Arc::new(db),
        )
    }

    #[tokio::test]
    async fn happy_audit_path_completes() {
        let gateway = gateway_with(StubDb {
            rows: vec![Row::new()],
            fail: AtomicBool::new(false),
            delay_ms: 0,
        });
        gateway.start().await;

        let result = gateway
            .submit(
                "SELECT a,b FROM upload_table_A WHERE client_id='T1'".to_string(),
                "T1".to_string(),
                WorkflowMode::Audit,
                5,
            )
            .await;

        let query_id = match result {
            SubmitResult::Accepted { query_id, .. } => query_id,
            other => panic!("expected Accepted, got {other:?}"),
        };

        let outcome = gateway.await_result(query_id, 2_000).await;
        assert_eq!(outcome.status, QueueState::Completed);
        assert_eq!(outcome.row_count, Some(1));
    }

    #[tokio::test]
    async fn missing_tenant_filter_is_rejected() {
        let gateway = gateway_with(StubDb {
            rows: vec![],
            fail: AtomicBool::new(false),
            delay_ms: 0,
        });
        let result = gateway
            .submit(
                "SELECT * FROM upload_table_A".to_string(),
                "T1".to_string(),
                WorkflowMode::Audit,
                5,
            )
            .await;
        match result {
            SubmitResult::Rejected {
                reason,
                violations,
                ..
            } => {
                assert_eq!(reason, RejectionReason::ValidationRejected);
                let kinds: Vec<_> = violations
                    .unwrap()
                    .into_iter()
                    .map(|v| v.kind)
                    .collect();
                use crate::validator::ViolationKind;
                assert!(kinds.contains(&ViolationKind::MissingTenantFilter));
                assert!(kinds.contains(&ViolationKind::WildcardSelect));
                assert!(kinds.contains(&ViolationKind::MissingRowLimit));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn injection_attempt_is_rejected() {
        let gateway = gateway_with(StubDb {
            rows: vec![],
            fail: AtomicBool::new(false),
            delay_ms: 0,
        });
        let result = gateway
            .submit(
                "SELECT * FROM upload_table_A WHERE client_id='T1' OR 1=1".to_string(),
                "T1".to_string(),
                WorkflowMode::Audit,
                5,
            )
            .await;
        assert!(matches!(
            result,
            SubmitResult::Rejected {
                reason: RejectionReason::ValidationRejected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn timeout_increments_counter_and_records_circuit_failure() {
        let mut config = GatewayConfig::default();
        config.execution_timeout_ms = 30;
        config.failure_threshold = 100;
        let queue = PriorityQueue::new(config.max_queue_size, config.max_concurrent);
        let gateway = Arc::new(Gateway {
            analyzer: Analyzer::new(&config),
            admission: AdmissionController::new(&config),
            circuits: CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: config.failure_threshold,
                recovery_timeout_ms: config.recovery_timeout_ms,
                half_open_max_probes: config.half_open_max_probes,
            }),
            metrics: Arc::new(MetricsRecorder::new(config.audit_buffer_capacity)),
            upload_check: Arc::new(AlwaysExistsUploadTable),
            table_stats: Arc::new(DefaultTableStats),
            db_executor: Arc::new(StubDb {
                rows: vec![],
                fail: AtomicBool::new(false),
                delay_ms: 200,
            }),
            timeout_executor: TimeoutExecutor::new(),
            scheduler_started: AsyncMutex::new(false),
            queue,
            config,
        });
        gateway.start().await;

        let result = gateway
            .submit(
                "SELECT a FROM upload_table_A WHERE client_id='T1' LIMIT 10".to_string(),
                "T1".to_string(),
                WorkflowMode::Audit,
                5,
            )
            .await;
        let query_id = match result {
            SubmitResult::Accepted { query_id, .. } => query_id,
            other => panic!("expected Accepted, got {other:?}"),
        };

        let outcome = gateway.await_result(query_id, 2_000).await;
        assert_eq!(outcome.status, QueueState::Timeout);
        assert_eq!(gateway.stats().metrics.total_timeouts, 1);
        assert_eq!(gateway.stats().metrics.total_completed, 0);
    }
}
