//! # Safe-Query Gateway Server
//!
//! Process entry point: builds the `Gateway`, starts its scheduler and
//! periodic metrics-emitter tasks, and waits for a shutdown signal. Follows
//! the usual subsystem-initialization-sequence-plus-startup-banner shape,
//! trimmed to the subsystems this crate actually owns.

use safequery_gateway::{GatewayConfig, VERSION};
use safequery_gateway::cost_estimator::DefaultTableStats;
use safequery_gateway::orchestration::{DatabaseExecutor, DbExecutionResult};
use safequery_gateway::validator::AlwaysExistsUploadTable;
use safequery_gateway::{Gateway, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Placeholder execution backend until a real warehouse connector is
/// wired in. Returns zero rows for every query; callers integrating this
/// crate into their own data platform replace this with a real
/// `DatabaseExecutor`.
struct NullDatabaseExecutor;

#[async_trait]
impl DatabaseExecutor for NullDatabaseExecutor {
    async fn execute(
        &self,
        _governed_sql: &str,
        _tenant_id: &str,
        _mode: safequery_gateway::common::WorkflowMode,
        _cancel: CancellationToken,
    ) -> Result<DbExecutionResult> {
        Ok(DbExecutionResult {
            rows: Vec::new(),
            row_count: 0,
            execution_time_ms: 0.0,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let config = GatewayConfig::from_env();
    print_startup_info(&config);

    let gateway = Gateway::new(
        config,
        Arc::new(AlwaysExistsUploadTable),
        Arc::new(DefaultTableStats),
        Arc::new(NullDatabaseExecutor),
    );

    info!("starting scheduler and metrics emitter");
    gateway.start().await;

    println!();
    println!("╭─────────────────────────────────────────────────────────╮");
    println!("│  safequery-gateway is ready                              │");
    println!("│  Submit queries via Gateway::submit()                    │");
    println!("╰─────────────────────────────────────────────────────────╯");
    println!();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| safequery_gateway::GatewayError::Internal(e.to_string()))?;

    info!("shutdown signal received");
    let outcome = gateway.emergency_stop();
    info!(
        cancelled_executing = outcome.cancelled_executing,
        cancelled_queued = outcome.cancelled_queued,
        "shutdown complete"
    );

    Ok(())
}

fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║         Safe-Query Execution Gateway v{:<20}║", VERSION);
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}

fn print_startup_info(config: &GatewayConfig) {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ STARTUP CONFIGURATION                                       │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│   Max Concurrent:         {:<30} │", config.max_concurrent);
    println!("│   Max Per Minute:         {:<30} │", config.max_per_minute);
    println!("│   Max Queue Size:         {:<30} │", config.max_queue_size);
    println!(
        "│   Execution Timeout:      {:<30} │",
        format!("{} ms", config.execution_timeout_ms)
    );
    println!(
        "│   Failure Threshold:      {:<30} │",
        config.failure_threshold
    );
    println!(
        "│   Recovery Timeout:       {:<30} │",
        format!("{} ms", config.recovery_timeout_ms)
    );
    println!(
        "│   Half-Open Max Probes:   {:<30} │",
        config.half_open_max_probes
    );
    println!(
        "│   Audit Retention:        {:<30} │",
        format!("{} days", config.audit_retention_days)
    );
    println!("└─────────────────────────────────────────────────────────────┘");
    println!();
}
