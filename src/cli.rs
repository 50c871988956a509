//! # Safe-Query Gateway CLI
//!
//! Interactive driver for exercising the gateway without a network
//! listener: reads a tenant id, workflow mode, and SQL query from stdin,
//! submits it, and prints the outcome. A plain read-eval-print loop, minus
//! any wire protocol, since this binary talks to `Gateway` in-process.

use safequery_gateway::common::WorkflowMode;
use safequery_gateway::cost_estimator::DefaultTableStats;
use safequery_gateway::orchestration::{DatabaseExecutor, DbExecutionResult};
use safequery_gateway::validator::AlwaysExistsUploadTable;
use safequery_gateway::{Gateway, GatewayConfig, Result, SubmitResult, VERSION};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

struct EchoDatabaseExecutor;

#[async_trait]
impl DatabaseExecutor for EchoDatabaseExecutor {
    async fn execute(
        &self,
        _governed_sql: &str,
        _tenant_id: &str,
        _mode: WorkflowMode,
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
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║     Safe-Query Gateway CLI - interactive query driver    ║");
    println!("║                    Version {:<28}║", VERSION);
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();
    println!("Enter queries as: <tenant_id>|<audit|lending>|<sql>");
    println!("Type 'exit' to quit.");
    println!();

    let gateway = Gateway::new(
        GatewayConfig::from_env(),
        Arc::new(AlwaysExistsUploadTable),
        Arc::new(DefaultTableStats),
        Arc::new(EchoDatabaseExecutor),
    );
    gateway.start().await;

    let mut reader = BufReader::new(stdin());
    let mut input = String::new();

    loop {
        print!("gateway> ");
        std::io::Write::flush(&mut std::io::stdout()).unwrap();

        input.clear();
        let bytes_read = reader
            .read_line(&mut input)
            .await
            .map_err(|e| safequery_gateway::GatewayError::Internal(e.to_string()))?;
        if bytes_read == 0 {
            break;
        }

        let line = input.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            println!("Goodbye!");
            break;
        }

        let Some((tenant_id, rest)) = line.split_once('|') else {
            println!("ERROR: expected <tenant_id>|<audit|lending>|<sql>");
            continue;
        };
        let Some((mode_str, sql)) = rest.split_once('|') else {
            println!("ERROR: expected <tenant_id>|<audit|lending>|<sql>");
            continue;
        };
        let mode = match mode_str.trim().to_lowercase().as_str() {
            "audit" => WorkflowMode::Audit,
            "lending" => WorkflowMode::Lending,
            other => {
                println!("ERROR: unknown workflow mode '{other}'");
                continue;
            }
        };

        match gateway
            .submit(sql.trim().to_string(), tenant_id.trim().to_string(), mode, 5)
            .await
        {
            SubmitResult::Accepted {
                query_id,
                estimated_wait_ms,
            } => {
                println!("accepted: query_id={query_id} estimated_wait_ms={estimated_wait_ms}");
                let outcome = gateway.await_result(query_id, 10_000).await;
                println!("{:?}", outcome);
            }
            SubmitResult::Rejected {
                reason,
                violations,
                retry_after_ms,
            } => {
                println!("rejected: reason={:?} retry_after_ms={:?}", reason, retry_after_ms);
                if let Some(violations) = violations {
                    for v in violations {
                        println!("  - [{:?}] {}", v.severity, v.message);
                    }
                }
            }
        }
        println!();
    }

    Ok(())
}
