//! Error taxonomy for the safe-query execution gateway.
//!
//! Every variant here is surfaced to callers through `SubmitResult` or
//! `ExecutionOutcome` rather than thrown as a bare exception. Display
//! messages never carry SQL literals or tenant-sensitive values.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("query could not be classified: {0}")]
    AnalyzerMalformed(String),

    #[error("query rejected by validator ({count} violation(s))", count = .0.len())]
    ValidationRejected(Vec<crate::validator::Violation>),

    #[error("admission rejected: concurrency saturated, retry after {retry_after_ms}ms")]
    AdmissionConcurrency { retry_after_ms: u64 },

    #[error("admission rejected: rate limited, retry after {retry_after_ms}ms")]
    AdmissionRate { retry_after_ms: u64 },

    #[error("queue is full")]
    QueueFull,

    #[error("circuit '{scope}' is open until {open_until_unix_ms}")]
    CircuitOpen {
        scope: String,
        open_until_unix_ms: u64,
    },

    #[error("execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("execution failed: {underlying}")]
    ExecutionFailed { underlying: String },

    #[error("execution was cancelled")]
    Cancelled,

    #[error("query id not found")]
    NotFound,

    #[error("upload-table lookup failed: {0}")]
    UploadLookupFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// True when the breaker records this outcome as a failure: timeouts
    /// and execution failures count, cancellations and admission/validation
    /// rejections do not.
    pub fn is_circuit_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout { .. } | GatewayError::ExecutionFailed { .. }
        )
    }
}
