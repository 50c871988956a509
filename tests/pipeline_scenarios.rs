//! End-to-end scenarios exercising the full pipeline through the public
//! `Gateway` surface: submit -> await_result -> stats.

use async_trait::async_trait;
use safequery_gateway::common::WorkflowMode;
use safequery_gateway::cost_estimator::DefaultTableStats;
use safequery_gateway::orchestration::{DatabaseExecutor, DbExecutionResult, Row};
use safequery_gateway::queue::QueueState;
use safequery_gateway::validator::{AlwaysExistsUploadTable, ViolationKind};
use safequery_gateway::{Gateway, GatewayConfig, GatewayError, Result, SubmitResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct ConfigurableDb {
    fail: AtomicBool,
    delay_ms: AtomicU64,
}

impl ConfigurableDb {
    fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl DatabaseExecutor for ConfigurableDb {
    async fn execute(
        &self,
        _sql: &str,
        _tenant_id: &str,
        _mode: WorkflowMode,
        cancel: CancellationToken,
    ) -> Result<DbExecutionResult> {
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            }
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(GatewayError::ExecutionFailed {
                underlying: "stub configured to fail".to_string(),
            });
        }
        let mut row = Row::new();
        row.insert("a".to_string(), serde_json::json!(1));
        Ok(DbExecutionResult {
            rows: vec![row],
            row_count: 1,
            execution_time_ms: 1.0,
        })
    }
}

fn gateway_with(config: GatewayConfig, db: Arc<ConfigurableDb>) -> Arc<Gateway> {
    Gateway::new(
        config,
        Arc::new(AlwaysExistsUploadTable),
        Arc::new(DefaultTableStats),
        db,
    )
}

#[tokio::test]
async fn scenario_1_happy_audit_path() {
    let db = Arc::new(ConfigurableDb::new());
    let gateway = gateway_with(GatewayConfig::default(), db);
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
async fn scenario_2_missing_tenant_filter_rejected() {
    let db = Arc::new(ConfigurableDb::new());
    let gateway = gateway_with(GatewayConfig::default(), db);

    let result = gateway
        .submit(
            "SELECT * FROM upload_table_A".to_string(),
            "T1".to_string(),
            WorkflowMode::Audit,
            5,
        )
        .await;

    match result {
        SubmitResult::Rejected { violations, .. } => {
            let kinds: Vec<_> = violations.unwrap().into_iter().map(|v| v.kind).collect();
            assert!(kinds.contains(&ViolationKind::MissingTenantFilter));
            assert!(kinds.contains(&ViolationKind::WildcardSelect));
            assert!(kinds.contains(&ViolationKind::MissingRowLimit));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_3_injection_attempt_rejected() {
    let db = Arc::new(ConfigurableDb::new());
    let gateway = gateway_with(GatewayConfig::default(), db);

    let result = gateway
        .submit(
            "SELECT * FROM upload_table_A WHERE client_id='T1' OR 1=1".to_string(),
            "T1".to_string(),
            WorkflowMode::Audit,
            5,
        )
        .await;

    match result {
        SubmitResult::Rejected { violations, .. } => {
            let kinds: Vec<_> = violations.unwrap().into_iter().map(|v| v.kind).collect();
            assert!(kinds.contains(&ViolationKind::DangerousOperation));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_4_circuit_opens_then_recovers() {
    let mut config = GatewayConfig::default();
    config.failure_threshold = 5;
    config.recovery_timeout_ms = 50;
    config.half_open_max_probes = 2;
    config.max_per_minute = 1_000;

    let db = Arc::new(ConfigurableDb::new());
    db.fail.store(true, Ordering::Relaxed);
    let gateway = gateway_with(config, db.clone());
    gateway.start().await;

    let sql = "SELECT a FROM upload_table_A WHERE client_id='T1' LIMIT 10".to_string();

    for _ in 0..5 {
        let result = gateway
            .submit(sql.clone(), "T1".to_string(), WorkflowMode::Audit, 5)
            .await;
        let query_id = match result {
            SubmitResult::Accepted { query_id, .. } => query_id,
            other => panic!("expected Accepted, got {other:?}"),
        };
        let outcome = gateway.await_result(query_id, 2_000).await;
        assert_eq!(outcome.status, QueueState::Failed);
    }

    let stats = gateway.stats();
    let circuit = stats.circuits.get("default").expect("default circuit scope exists");
    assert_eq!(
        circuit.state,
        safequery_gateway::orchestration::circuit_breaker::CircuitStateKind::Open
    );

    tokio::time::sleep(Duration::from_millis(80)).await;
    db.fail.store(false, Ordering::Relaxed);

    for _ in 0..2 {
        let result = gateway
            .submit(sql.clone(), "T1".to_string(), WorkflowMode::Audit, 5)
            .await;
        let query_id = match result {
            SubmitResult::Accepted { query_id, .. } => query_id,
            other => panic!("expected Accepted, got {other:?}"),
        };
        let outcome = gateway.await_result(query_id, 2_000).await;
        assert_eq!(outcome.status, QueueState::Completed);
    }

    let stats = gateway.stats();
    let circuit = stats.circuits.get("default").unwrap();
    assert_eq!(
        circuit.state,
        safequery_gateway::orchestration::circuit_breaker::CircuitStateKind::Closed
    );
}

#[tokio::test]
async fn scenario_5_timeout_increments_counter_and_trips_circuit_failure() {
    let mut config = GatewayConfig::default();
    config.execution_timeout_ms = 50;
    config.failure_threshold = 100;

    let db = Arc::new(ConfigurableDb::new());
    db.delay_ms.store(200, Ordering::Relaxed);
    let gateway = gateway_with(config, db);
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

    let stats = gateway.stats();
    assert_eq!(stats.metrics.total_timeouts, 1);
    assert_eq!(stats.metrics.total_completed, 0);
    let circuit = stats.circuits.get("default").unwrap();
    assert_eq!(circuit.consecutive_failures, 1);
}

#[tokio::test]
async fn scenario_6_admission_rate_gate_rejects_fourth_request() {
    let mut config = GatewayConfig::default();
    config.max_per_minute = 3;

    let db = Arc::new(ConfigurableDb::new());
    let gateway = gateway_with(config, db);

    for _ in 0..3 {
        let result = gateway
            .submit(
                "SELECT a FROM upload_table_A WHERE client_id='T1' LIMIT 10".to_string(),
                "T1".to_string(),
                WorkflowMode::Audit,
                5,
            )
            .await;
        assert!(matches!(result, SubmitResult::Accepted { .. }));
    }

    let result = gateway
        .submit(
            "SELECT a FROM upload_table_A WHERE client_id='T1' LIMIT 10".to_string(),
            "T1".to_string(),
            WorkflowMode::Audit,
            5,
        )
        .await;
    match result {
        SubmitResult::Rejected {
            reason,
            retry_after_ms,
            ..
        } => {
            assert_eq!(
                reason,
                safequery_gateway::orchestration::RejectionReason::AdmissionRate
            );
            let retry_after_ms = retry_after_ms.expect("admission rejections carry retry_after_ms");
            assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn governor_rewrite_is_idempotent() {
    use safequery_gateway::analyzer::Analyzer;
    use safequery_gateway::governor::Governor;

    let config = GatewayConfig::default();
    let analyzer = Analyzer::new(&config);
    let governor = Governor::new(&config);

    let raw = "SELECT a,b FROM upload_table_A WHERE client_id='T1'";
    let shape = analyzer.analyze(raw).unwrap();
    let first = governor.govern_standard(raw, &shape, WorkflowMode::Audit, "T1", 5_000);
    assert!(first.allowed);
    let governed = first.modified_query.unwrap();

    let reshaped = analyzer.analyze(&governed).unwrap();
    let second = governor.govern_standard(&governed, &reshaped, WorkflowMode::Audit, "T1", 5_000);
    assert!(second.allowed);
    assert_eq!(second.modified_query.unwrap(), governed);

    assert!(governed.contains("TOP 1000"));
    assert!(governed.contains("OPTION (QUERY_GOVERNOR_COST_LIMIT 5)"));
}

#[tokio::test]
async fn no_audit_record_leaks_forbidden_substrings_end_to_end() {
    let db = Arc::new(ConfigurableDb::new());
    db.fail.store(true, Ordering::Relaxed);
    let mut config = GatewayConfig::default();
    config.failure_threshold = 100;
    let gateway = gateway_with(config, db);
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
    let _ = gateway.await_result(query_id, 2_000).await;

    for record in gateway.metrics().audit.recent(50) {
        let joined = format!("{record:?}").to_lowercase();
        assert!(!joined.contains("password"));
        assert!(!joined.contains("apikey"));
        assert!(!joined.contains("secret"));
    }
}
