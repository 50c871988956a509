//! Safe-query execution gateway for multi-tenant financial analytics
//! uploads. A pipeline of analyzer, validator, governor, cost estimator,
//! admission controller, priority queue, circuit breaker, and timeout
//! executor, coordinated by the `orchestration::Gateway` composition
//! root. Result formatting, durable cross-restart queueing,
//! and full SQL parsing are explicitly out of scope.

pub mod admission;
pub mod analyzer;
pub mod audit;
pub mod common;
pub mod config;
pub mod cost_estimator;
pub mod error;
pub mod governor;
pub mod orchestration;
pub mod queue;
pub mod validator;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use orchestration::{
    DatabaseExecutor, DbExecutionResult, ExecutionOutcome, Gateway, GatewayStats, RejectionReason,
    SubmitResult,
};

/// Crate version, surfaced in startup logging.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
