//! Configuration surface.
//!
//! A single struct with a `Default` impl holding the documented defaults,
//! plus a `from_env` convenience constructor for deployment-time overrides.

use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Full policy/configuration surface for one gateway instance.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // admission + executor concurrency
    pub max_concurrent: usize,
    // admission rate gate
    pub max_per_minute: usize,
    // queue bound
    pub max_queue_size: usize,
    // deadline per execution
    pub execution_timeout_ms: u64,

    // validator gate (audit mode)
    pub enforce_tenant_filter: bool,
    pub enforce_upload_id: bool,
    // validator gate + governor cap
    pub max_row_limit: u32,
    // validator warning
    pub max_join_count: usize,
    // validator gate
    pub dangerous_functions: HashSet<String>,

    // analyzer & governor
    pub tenant_column: String,
    pub tenant_column_aliases: Vec<String>,
    // analyzer & validator
    pub upload_patterns: Vec<String>,

    // breaker
    pub failure_threshold: usize,
    pub recovery_timeout_ms: u64,
    pub half_open_max_probes: usize,

    // audit sink
    pub audit_retention_days: u32,
    pub audit_buffer_capacity: usize,

    // orchestrator
    pub reject_critical_risk: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_per_minute: 100,
            max_queue_size: 50,
            execution_timeout_ms: 5_000,

            enforce_tenant_filter: true,
            enforce_upload_id: true,
            max_row_limit: 5_000,
            max_join_count: 5,
            dangerous_functions: [
                "xp_cmdshell",
                "sp_configure",
                "sp_addlogin",
                "sp_droplogin",
                "xp_regread",
                "xp_regwrite",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),

            tenant_column: "client_id".to_string(),
            tenant_column_aliases: vec!["client_id".to_string(), "clientid".to_string()],
            upload_patterns: vec![
                r"^upload_table_".to_string(),
                r"_upload$".to_string(),
                r"^client_upload".to_string(),
                r"^temp_upload".to_string(),
                r"upload.*table".to_string(),
            ],

            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_probes: 3,

            audit_retention_days: 30,
            audit_buffer_capacity: 10_000,

            reject_critical_risk: true,
        }
    }
}

impl GatewayConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Overlay environment-variable overrides onto the defaults
    /// (`SQG_MAX_CONCURRENT`, `SQG_MAX_PER_MINUTE`, `SQG_MAX_QUEUE_SIZE`,
    /// `SQG_EXECUTION_TIMEOUT_MS`). Unset or unparsable variables are
    /// silently ignored in favor of the existing value.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("SQG_MAX_CONCURRENT") {
            if let Ok(n) = v.parse() {
                cfg.max_concurrent = n;
            }
        }
        if let Ok(v) = env::var("SQG_MAX_PER_MINUTE") {
            if let Ok(n) = v.parse() {
                cfg.max_per_minute = n;
            }
        }
        if let Ok(v) = env::var("SQG_MAX_QUEUE_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.max_queue_size = n;
            }
        }
        if let Ok(v) = env::var("SQG_EXECUTION_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.execution_timeout_ms = n;
            }
        }
        cfg
    }
}
