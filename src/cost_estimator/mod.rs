//! # Cost Estimator
//!
//! Combines a `QueryShape` with externally supplied table statistics to
//! produce an estimated row count, estimated time, and risk level, in the
//! same advisory recommendation-generation style as a query-tuning
//! advisor.

use crate::analyzer::{Complexity, Operation, QueryShape};
use crate::config::GatewayConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEstimate {
    pub estimated_rows: u64,
    pub estimated_time_ms: f64,
    pub risk_level: RiskLevel,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    pub row_count: u64,
    pub index_count: u32,
    pub size_kb: u64,
}

/// External collaborator.
#[async_trait]
pub trait TableStatsProvider: Send + Sync {
    async fn stats(&self, table_name: &str) -> Option<TableStats>;
}

/// Test/demo double returning the documented default when no stats exist.
pub struct DefaultTableStats;

#[async_trait]
impl TableStatsProvider for DefaultTableStats {
    async fn stats(&self, _table_name: &str) -> Option<TableStats> {
        None
    }
}

const DEFAULT_ROW_COUNT: u64 = 1000;

pub struct CostEstimator;

impl CostEstimator {
    pub async fn estimate(
        shape: &QueryShape,
        stats: &dyn TableStatsProvider,
        config: &GatewayConfig,
    ) -> CostEstimate {
        let mut table_stats = Vec::with_capacity(shape.tables.len());
        for table in &shape.tables {
            let s = stats.stats(table).await.unwrap_or(TableStats {
                row_count: DEFAULT_ROW_COUNT,
                index_count: 1,
                size_kb: 0,
            });
            table_stats.push((table.clone(), s));
        }

        let rows = table_stats
            .iter()
            .map(|(_, s)| s.row_count)
            .max()
            .unwrap_or(DEFAULT_ROW_COUNT);

        let tenant_aliases: Vec<String> = config
            .tenant_column_aliases
            .iter()
            .map(|a| a.to_lowercase())
            .collect();
        let non_tenant_where_atoms = shape
            .where_atoms
            .iter()
            .filter(|a| {
                let c = a.column.to_lowercase().replace('-', "_");
                !tenant_aliases.iter().any(|alias| alias == &c)
            })
            .count();

        let mut selectivity = 1.0f64;
        if shape.has_tenant_filter {
            selectivity *= 0.01;
        }
        if non_tenant_where_atoms > 0 {
            selectivity *= 0.1;
        }
        selectivity *= 0.5f64.powi(shape.joins.len() as i32);
        if shape.operations.contains(&Operation::GroupBy) {
            selectivity *= 0.1;
        }

        let estimated_rows = ((rows as f64) * selectivity).ceil().max(0.0) as u64;

        let complexity_factor = match shape.complexity {
            Complexity::Low => 1.0,
            Complexity::Medium => 2.0,
            Complexity::High => 4.0,
        };
        let mut time_ms = 100.0 * complexity_factor;
        if estimated_rows > 1000 {
            time_ms += 50.0 * (estimated_rows as f64).log10();
        }
        for op in &shape.operations {
            time_ms += match op {
                Operation::Join => 200.0,
                Operation::Union => 150.0,
                Operation::Subquery => 300.0,
                Operation::GroupBy => 100.0,
                Operation::OrderBy => 100.0,
                Operation::Having => 50.0,
                Operation::Select | Operation::Where => 0.0,
            };
        }
        for (_, s) in &table_stats {
            if s.index_count == 0 {
                time_ms += 0.01 * s.row_count as f64;
            }
        }
        let table_count = shape.tables.len();
        if table_count > 1 {
            time_ms *= 0.5 * table_count as f64;
        }

        let risk_level = if time_ms > 30_000.0 || estimated_rows > 1_000_000 {
            RiskLevel::Critical
        } else if time_ms > 10_000.0
            || estimated_rows > 100_000
            || shape.complexity == Complexity::High
            || table_count > 5
        {
            RiskLevel::High
        } else if time_ms > 5_000.0
            || estimated_rows > 10_000
            || shape.complexity == Complexity::Medium
            || table_count > 2
        {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let mut recommendations = Vec::new();
        for (table, s) in &table_stats {
            if s.index_count == 0 {
                recommendations.push(format!("table '{table}' has no indexes; consider adding one"));
            }
        }
        if !shape.has_tenant_filter {
            recommendations.push("add a tenant-column predicate to improve selectivity".to_string());
        }
        if table_count > 5 {
            recommendations.push("query references many tables; consider narrowing scope".to_string());
        }
        if shape.complexity == Complexity::High {
            recommendations.push("query complexity is high; consider simplifying joins or subqueries".to_string());
        }

        CostEstimate {
            estimated_rows,
            estimated_time_ms: time_ms,
            risk_level,
            recommendations,
        }
    }
}
