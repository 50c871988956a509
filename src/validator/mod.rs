//! # Query Validator
//!
//! Pure function over `QueryShape` plus tenant identity, workflow mode, and
//! an injected upload-table existence check. Injection-pattern checks use
//! the same tautology/dangerous-pattern blacklist approach as a dedicated
//! SQL-injection detector, trimmed to exactly the patterns this pipeline
//! needs to catch.

use crate::analyzer::{JoinKind, QueryShape, StatementKind};
use crate::common::WorkflowMode;
use crate::config::GatewayConfig;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DangerousOperation,
    MissingUploadEntry,
    MissingTenantFilter,
    MissingRowLimit,
    ExcessiveRowLimit,
    InefficientJoin,
    CartesianProduct,
    WildcardSelect,
    HighComplexity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub is_safe: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    /// 100 − 30·errors − 10·warnings, floored at 0.
    pub fn security_score(&self) -> u32 {
        let errors = self
            .violations
            .iter()
            .filter(|v| v.severity == Severity::Error)
            .count() as i64;
        let warnings = self
            .violations
            .iter()
            .filter(|v| v.severity == Severity::Warning)
            .count() as i64;
        (100 - 30 * errors - 10 * warnings).max(0) as u32
    }
}

/// External collaborator: side-effectful upload-table existence lookup
///.
#[async_trait]
pub trait UploadTableExists: Send + Sync {
    async fn exists(&self, table_name: &str, tenant_id: &str) -> Result<bool, String>;
}

/// Test/demo double that treats every upload-pattern table as existing.
pub struct AlwaysExistsUploadTable;

#[async_trait]
impl UploadTableExists for AlwaysExistsUploadTable {
    async fn exists(&self, _table_name: &str, _tenant_id: &str) -> Result<bool, String> {
        Ok(true)
    }
}

lazy_static! {
    static ref STACKED_STATEMENT: Regex =
        Regex::new(r"(?i);\s*(DROP|DELETE|UPDATE|INSERT|EXEC)").unwrap();
    static ref TRAILING_COMMENT: Regex = Regex::new(r"--\s*$").unwrap();
    static ref BLOCK_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").unwrap();
    static ref UNION_SELECT: Regex = Regex::new(r"(?i)\bUNION\s+SELECT\b").unwrap();
    static ref TAUTOLOGY_NUMERIC: Regex = Regex::new(r"(?i)\bOR\s+1\s*=\s*1\b").unwrap();
    static ref TAUTOLOGY_STRING: Regex = Regex::new(r"(?i)\bOR\s+'[^']*'\s*=\s*'[^']*'").unwrap();
    static ref SLEEP_CALL: Regex = Regex::new(r"(?i)\bSLEEP\s*\(").unwrap();
    static ref WAITFOR_DELAY: Regex = Regex::new(r"(?i)\bWAITFOR\s+DELAY\b").unwrap();
    static ref BENCHMARK_CALL: Regex = Regex::new(r"(?i)\bBENCHMARK\s*\(").unwrap();
}

fn injection_pattern_hit(raw: &str) -> bool {
    STACKED_STATEMENT.is_match(raw)
        || TRAILING_COMMENT.is_match(raw.trim_end())
        || BLOCK_COMMENT.is_match(raw)
        || UNION_SELECT.is_match(raw)
        || TAUTOLOGY_NUMERIC.is_match(raw)
        || TAUTOLOGY_STRING.is_match(raw)
        || SLEEP_CALL.is_match(raw)
        || WAITFOR_DELAY.is_match(raw)
        || BENCHMARK_CALL.is_match(raw)
}

/// Validator. Stateless apart from the policy it is
/// constructed with; `UploadTableExists` results are cached only for the
/// lifetime of a single `validate` call.
pub struct Validator<'a> {
    config: &'a GatewayConfig,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a GatewayConfig) -> Self {
        Self { config }
    }

    pub async fn validate(
        &self,
        shape: &QueryShape,
        tenant_id: &str,
        mode: WorkflowMode,
        upload_check: &dyn UploadTableExists,
    ) -> ValidationReport {
        let mut violations = Vec::new();

        if shape.statement_kind != StatementKind::Select {
            violations.push(err(
                ViolationKind::DangerousOperation,
                "statement is not a SELECT",
            ));
        }

        if self.config.enforce_upload_id {
            if !shape.has_upload_table {
                violations.push(err(
                    ViolationKind::MissingUploadEntry,
                    "no referenced table matches an upload-table pattern",
                ));
            } else {
                // Invoked once per distinct upload-pattern table, cached
                // only for this call.
                let mut checked = std::collections::HashSet::new();
                for table in &shape.tables {
                    if !self.looks_like_upload_table(table) || !checked.insert(table.clone()) {
                        continue;
                    }
                    match upload_check.exists(table, tenant_id).await {
                        Ok(true) => {}
                        Ok(false) => violations.push(err(
                            ViolationKind::MissingUploadEntry,
                            &format!("upload table '{table}' has no entry for this tenant"),
                        )),
                        Err(e) => violations.push(err(
                            ViolationKind::MissingUploadEntry,
                            &format!("upload-table lookup failed: {e}"),
                        )),
                    }
                }
            }
        }

        if self.config.enforce_tenant_filter
            && !shape.has_tenant_filter
            && mode == WorkflowMode::Audit
        {
            violations.push(err(
                ViolationKind::MissingTenantFilter,
                "audit-mode query is missing a tenant-column predicate",
            ));
        }

        if shape.limit == 0 {
            violations.push(err(ViolationKind::MissingRowLimit, "no row limit present"));
        } else if shape.limit > self.config.max_row_limit {
            violations.push(err(
                ViolationKind::ExcessiveRowLimit,
                &format!(
                    "limit {} exceeds policy maximum {}",
                    shape.limit, self.config.max_row_limit
                ),
            ));
        }

        if shape.joins.len() > self.config.max_join_count {
            violations.push(warn(
                ViolationKind::InefficientJoin,
                &format!(
                    "{} joins exceeds policy maximum {}",
                    shape.joins.len(),
                    self.config.max_join_count
                ),
            ));
        }
        for join in &shape.joins {
            if join.kind != JoinKind::Cross && join.predicate_columns.is_empty() {
                violations.push(err(
                    ViolationKind::InefficientJoin,
                    &format!("join on '{}' has no predicate columns", join.table),
                ));
            }
        }

        if shape.joins.iter().any(|j| j.kind == JoinKind::Cross) {
            violations.push(err(
                ViolationKind::CartesianProduct,
                "cross join produces a Cartesian product",
            ));
        }
        if shape.tables.len() > 1 && shape.joins.is_empty() {
            violations.push(err(
                ViolationKind::CartesianProduct,
                "multiple tables referenced with zero joins",
            ));
        }

        if shape.selects_wildcard {
            violations.push(warn(
                ViolationKind::WildcardSelect,
                "'*' used among selected columns",
            ));
        }

        let lower_raw = shape.raw_text.to_lowercase();
        if self
            .config
            .dangerous_functions
            .iter()
            .any(|f| lower_raw.contains(&f.to_lowercase()))
        {
            violations.push(err(
                ViolationKind::DangerousOperation,
                "query text references a disallowed function",
            ));
        }
        if injection_pattern_hit(&shape.raw_text) {
            violations.push(err(
                ViolationKind::DangerousOperation,
                "query text matches a known injection pattern",
            ));
        }

        if shape.complexity == crate::analyzer::Complexity::High {
            violations.push(warn(
                ViolationKind::HighComplexity,
                "query complexity score is high",
            ));
        }

        let is_valid = !violations.iter().any(|v| v.severity == Severity::Error);
        let is_safe = is_valid
            && !violations
                .iter()
                .any(|v| v.kind == ViolationKind::DangerousOperation);

        ValidationReport {
            is_valid,
            is_safe,
            violations,
        }
    }

    fn looks_like_upload_table(&self, table: &str) -> bool {
        self.config
            .upload_patterns
            .iter()
            .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
            .any(|re| re.is_match(table))
    }
}

fn err(kind: ViolationKind, message: &str) -> Violation {
    Violation {
        kind,
        severity: Severity::Error,
        message: message.to_string(),
        location: "query".to_string(),
    }
}

fn warn(kind: ViolationKind, message: &str) -> Violation {
    Violation {
        kind,
        severity: Severity::Warning,
        message: message.to_string(),
        location: "query".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;

    fn validate_sync(sql: &str, tenant: &str, mode: WorkflowMode) -> ValidationReport {
        let cfg = GatewayConfig::default();
        let analyzer = Analyzer::new(&cfg);
        let shape = analyzer.analyze(sql).unwrap();
        let validator = Validator::new(&cfg);
        tokio_test::block_on(validator.validate(&shape, tenant, mode, &AlwaysExistsUploadTable))
    }

    #[test]
    fn happy_audit_path_is_valid() {
        let report = validate_sync(
            "SELECT a,b FROM upload_table_A WHERE client_id='T1' LIMIT 1000",
            "T1",
            WorkflowMode::Audit,
        );
        assert!(report.is_valid);
        assert!(report.is_safe);
    }

    #[test]
    fn missing_tenant_filter_in_audit_mode() {
        let report = validate_sync(
            "SELECT * FROM upload_table_A",
            "T1",
            WorkflowMode::Audit,
        );
        assert!(!report.is_valid);
        let kinds: Vec<_> = report.violations.iter().map(|v| v.kind.clone()).collect();
        assert!(kinds.contains(&ViolationKind::MissingTenantFilter));
        assert!(kinds.contains(&ViolationKind::WildcardSelect));
        assert!(kinds.contains(&ViolationKind::MissingRowLimit));
    }

    #[test]
    fn injection_attempt_is_rejected() {
        let report = validate_sync(
            "SELECT * FROM upload_table_A WHERE client_id='T1' OR 1=1",
            "T1",
            WorkflowMode::Audit,
        );
        assert!(!report.is_valid);
        assert!(!report.is_safe);
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::DangerousOperation));
    }

    #[test]
    fn enforce_upload_id_false_skips_upload_table_check() {
        let mut cfg = GatewayConfig::default();
        cfg.enforce_upload_id = false;
        let analyzer = Analyzer::new(&cfg);
        let shape = analyzer
            .analyze("SELECT a FROM not_an_upload_table WHERE client_id='T1' LIMIT 10")
            .unwrap();
        let validator = Validator::new(&cfg);
        let report = tokio_test::block_on(validator.validate(
            &shape,
            "T1",
            WorkflowMode::Audit,
            &AlwaysExistsUploadTable,
        ));
        assert!(!report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::MissingUploadEntry));
    }

    #[test]
    fn cross_join_is_cartesian_product() {
        let report = validate_sync(
            "SELECT * FROM upload_table_A CROSS JOIN upload_table_B WHERE client_id='T1' LIMIT 10",
            "T1",
            WorkflowMode::Audit,
        );
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::CartesianProduct));
    }

    #[test]
    fn security_score_floors_at_zero() {
        let cfg = GatewayConfig::default();
        let report = ValidationReport {
            is_valid: false,
            is_safe: false,
            violations: (0..10)
                .map(|_| err(ViolationKind::DangerousOperation, "x"))
                .collect(),
        };
        let _ = cfg;
        assert_eq!(report.security_score(), 0);
    }
}
