//! # Query Governor
//!
//! Pure text rewriter with a load-sensitive mode, built the way a
//! complexity-aware query governor coordinates resource limits; generalized
//! here from per-user resource quotas to three rewrite modes (standard,
//! adaptive, emergency) over raw SQL text.

use crate::analyzer::{Complexity, QueryShape};
use crate::common::{LoadLevel, WorkflowMode};
use crate::config::GatewayConfig;
use lazy_static::lazy_static;
use regex::Regex;

#[derive(Debug, Clone)]
pub struct GovernanceResult {
    pub allowed: bool,
    pub modified_query: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

lazy_static! {
    static ref SELECT_KEYWORD: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref TOP_OR_LIMIT: Regex = Regex::new(r"(?i)\b(TOP\s+\d+|LIMIT\s+\d+)\b").unwrap();
    static ref OPTION_CLAUSE: Regex = Regex::new(r"(?i)\bOPTION\s*\(").unwrap();
    static ref QUERY_GOVERNOR_OPTION: Regex =
        Regex::new(r"(?i)OPTION\s*\(\s*QUERY_GOVERNOR_COST_LIMIT\s+\d+\s*\)").unwrap();
    static ref WHERE_KEYWORD: Regex = Regex::new(r"(?i)\bWHERE\b").unwrap();
    static ref CLAUSE_BOUNDARY: Regex =
        Regex::new(r"(?i)\b(GROUP BY|ORDER BY|HAVING)\b").unwrap();
}

/// Governor. Stateless apart from the policy it was
/// constructed with.
pub struct Governor<'a> {
    config: &'a GatewayConfig,
}

impl<'a> Governor<'a> {
    pub fn new(config: &'a GatewayConfig) -> Self {
        Self { config }
    }

    /// Standard rewrite: row cap injection, tenant-filter injection
    /// (audit mode), cost-limit option clause.
    pub fn govern_standard(
        &self,
        raw_query: &str,
        shape: &QueryShape,
        mode: WorkflowMode,
        tenant_id: &str,
        timeout_ms: u64,
    ) -> GovernanceResult {
        let cap = self.default_cap(mode);
        self.rewrite(raw_query, shape, mode, tenant_id, timeout_ms, cap)
    }

    /// Adaptive rewrite: cap and high-complexity admission vary with
    /// system load.
    pub fn govern_adaptive(
        &self,
        raw_query: &str,
        shape: &QueryShape,
        mode: WorkflowMode,
        tenant_id: &str,
        timeout_ms: u64,
        load: LoadLevel,
    ) -> GovernanceResult {
        let (cap, allow_high_complexity) = match load {
            LoadLevel::Low => (1000, true),
            LoadLevel::Medium => (500, true),
            LoadLevel::High => (100, false),
            LoadLevel::Critical => (10, false),
        };

        if !allow_high_complexity
            && (shape.complexity == Complexity::High || shape.tables.len() > 3)
        {
            return GovernanceResult {
                allowed: false,
                modified_query: None,
                warnings: Vec::new(),
                errors: vec![format!(
                    "query rejected under {load:?} load: high complexity or too many tables"
                )],
            };
        }

        self.rewrite(raw_query, shape, mode, tenant_id, timeout_ms, cap)
    }

    /// Emergency rewrite: force the most conservative cap and cost limit,
    /// overriding any existing clause.
    pub fn govern_emergency(&self, raw_query: &str, shape: &QueryShape) -> GovernanceResult {
        let mut warnings = Vec::new();
        let mut query = strip_existing_top_limit(raw_query);
        query = inject_top(&query, 10);
        warnings.push("emergency mode: row cap forced to 10".to_string());

        query = strip_existing_option(&query);
        query = format!("{} OPTION (QUERY_GOVERNOR_COST_LIMIT 5)", query.trim_end());
        warnings.push("emergency mode: cost limit forced to 5".to_string());

        let _ = shape;
        GovernanceResult {
            allowed: true,
            modified_query: Some(query),
            warnings,
            errors: Vec::new(),
        }
    }

    fn default_cap(&self, mode: WorkflowMode) -> u32 {
        let mode_default = match mode {
            WorkflowMode::Audit => 1000,
            WorkflowMode::Lending => 100,
        };
        mode_default.min(self.config.max_row_limit)
    }

    fn rewrite(
        &self,
        raw_query: &str,
        shape: &QueryShape,
        mode: WorkflowMode,
        tenant_id: &str,
        timeout_ms: u64,
        cap: u32,
    ) -> GovernanceResult {
        let mut warnings = Vec::new();
        let mut query = raw_query.to_string();

        if !TOP_OR_LIMIT.is_match(&query) {
            query = inject_top(&query, cap);
            warnings.push(format!("injected row cap TOP {cap}"));
        }

        if mode == WorkflowMode::Audit && !shape.has_tenant_filter {
            query = inject_tenant_filter(&query, &self.config.tenant_column, tenant_id);
            warnings.push(format!(
                "injected tenant filter on '{}'",
                self.config.tenant_column
            ));
        }

        if !OPTION_CLAUSE.is_match(&query) {
            let seconds = timeout_ms.div_ceil(1000);
            query = format!(
                "{} OPTION (QUERY_GOVERNOR_COST_LIMIT {seconds})",
                query.trim_end()
            );
            warnings.push(format!(
                "appended cost-limit option clause ({seconds}s)"
            ));
        }

        GovernanceResult {
            allowed: true,
            modified_query: Some(query),
            warnings,
            errors: Vec::new(),
        }
    }
}

fn inject_top(query: &str, cap: u32) -> String {
    if let Some(m) = SELECT_KEYWORD.find(query) {
        let insert_at = m.end();
        format!(
            "{} TOP {} {}",
            &query[..insert_at],
            cap,
            &query[insert_at..].trim_start()
        )
    } else {
        query.to_string()
    }
}

fn strip_existing_top_limit(query: &str) -> String {
    TOP_OR_LIMIT.replace(query, "").to_string()
}

fn strip_existing_option(query: &str) -> String {
    QUERY_GOVERNOR_OPTION.replace(query, "").trim_end().to_string()
}

/// Escapes a tenant id by doubling single quotes; see DESIGN.md for why
/// this literal-escape behaviour is preserved rather than parameterized.
fn sql_escape(literal: &str) -> String {
    literal.replace('\'', "''")
}

fn inject_tenant_filter(query: &str, tenant_column: &str, tenant_id: &str) -> String {
    let escaped = sql_escape(tenant_id);
    let predicate = format!("{tenant_column} = '{escaped}'");

    if let Some(m) = WHERE_KEYWORD.find(query) {
        let insert_at = m.end();
        format!(
            "{} {predicate} AND ({})",
            &query[..insert_at],
            &query[insert_at..].trim_start()
        )
    } else if let Some(m) = CLAUSE_BOUNDARY.find(query) {
        let insert_at = m.start();
        format!(
            "{}WHERE {predicate} {}",
            &query[..insert_at],
            &query[insert_at..]
        )
    } else {
        format!("{} WHERE {predicate}", query.trim_end())
    }
}
