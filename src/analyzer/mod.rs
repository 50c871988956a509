//! # Query Shape Analyzer
//!
//! A lexical, not grammatical, SQL shape extractor: deliberately shallow,
//! documented regex-driven pattern extraction rather than a full grammar.
//! Structured the way a parser wrapper usually is — a struct owning
//! compiled matchers, exposing a single `analyze` entry point that returns
//! a `Result` — but built on `regex` instead of `sqlparser`, since a real
//! grammar is out of scope here.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementKind {
    Select,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinDescriptor {
    pub kind: JoinKind,
    pub table: String,
    pub predicate_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhereAtom {
    pub column: String,
    pub operator: String,
    pub rhs: String,
    pub is_string_concat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Select,
    Where,
    Join,
    Union,
    Subquery,
    GroupBy,
    OrderBy,
    Having,
}

/// Product of the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryShape {
    pub statement_kind: StatementKind,
    pub tables: Vec<String>,
    pub has_tenant_filter: bool,
    pub has_upload_table: bool,
    pub limit: u32,
    pub joins: Vec<JoinDescriptor>,
    pub where_atoms: Vec<WhereAtom>,
    pub operations: Vec<Operation>,
    pub complexity: Complexity,
    pub selects_wildcard: bool,
    /// Raw query text, retained (pre comment-strip) for injection-pattern
    /// checks performed by the validator.
    pub raw_text: String,
}

lazy_static! {
    static ref LINE_COMMENT: Regex = Regex::new(r"--[^\n]*").unwrap();
    static ref BLOCK_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").unwrap();
    static ref FROM_JOIN_TABLE: Regex = Regex::new(
        r"(?i)\b(FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)(?:\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?"
    )
    .unwrap();
    static ref JOIN_KEYWORD: Regex = Regex::new(
        r"(?i)\b(INNER|LEFT|RIGHT|FULL|CROSS)?\s*JOIN\s+([A-Za-z_][A-Za-z0-9_.]*)(?:\s+(?:AS\s+)?[A-Za-z_][A-Za-z0-9_]*)?\s+ON\s+(.+?)(?=(?:\bINNER\b|\bLEFT\b|\bRIGHT\b|\bFULL\b|\bCROSS\b|\bJOIN\b|\bWHERE\b|\bGROUP BY\b|\bORDER BY\b|\bHAVING\b|$))"
    )
    .unwrap();
    static ref CROSS_JOIN: Regex = Regex::new(r"(?i)\bCROSS\s+JOIN\s+([A-Za-z_][A-Za-z0-9_.]*)").unwrap();
    static ref WHERE_CLAUSE: Regex = Regex::new(
        r"(?is)\bWHERE\b(.+?)(?=\bGROUP BY\b|\bHAVING\b|\bORDER BY\b|$)"
    )
    .unwrap();
    static ref TOP_LIMIT: Regex = Regex::new(r"(?i)\bTOP\s+(\d+)\b").unwrap();
    static ref LIMIT_CLAUSE: Regex = Regex::new(r"(?i)\bLIMIT\s+(\d+)\b").unwrap();
    static ref SUBQUERY: Regex = Regex::new(r"(?i)\(\s*SELECT\b").unwrap();
    static ref UNION: Regex = Regex::new(r"(?i)\bUNION\b").unwrap();
    static ref GROUP_BY: Regex = Regex::new(r"(?i)\bGROUP BY\b").unwrap();
    static ref ORDER_BY: Regex = Regex::new(r"(?i)\bORDER BY\b").unwrap();
    static ref HAVING: Regex = Regex::new(r"(?i)\bHAVING\b").unwrap();
    static ref FIRST_KEYWORD: Regex = Regex::new(r"(?i)^\s*([A-Za-z]+)").unwrap();
    static ref WILDCARD_SELECT: Regex = Regex::new(r"(?i)SELECT\s+(?:TOP\s+\d+\s+)?\*").unwrap();
    static ref WHERE_ATOM_OP: Regex =
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(=|<>|!=|<=|>=|<|>|LIKE|IN)\s*(.+?)\s*$")
            .unwrap();
}

/// Lexical SQL shape analyzer.
pub struct Analyzer {
    upload_patterns: Vec<Regex>,
    tenant_aliases: Vec<String>,
}

impl Analyzer {
    pub fn new(config: &GatewayConfig) -> Self {
        let upload_patterns = config
            .upload_patterns
            .iter()
            .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
            .collect();
        Self {
            upload_patterns,
            tenant_aliases: config
                .tenant_column_aliases
                .iter()
                .map(|a| a.to_lowercase())
                .collect(),
        }
    }

    pub fn analyze(&self, sql: &str) -> Result<QueryShape> {
        let stripped = strip_comments(sql);
        let trimmed = stripped.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::AnalyzerMalformed(
                "empty after comment stripping".to_string(),
            ));
        }
        if !balanced_parens(&stripped) {
            return Err(GatewayError::AnalyzerMalformed(
                "unbalanced parentheses".to_string(),
            ));
        }

        let statement_kind = match FIRST_KEYWORD.captures(trimmed) {
            Some(c) if c[1].eq_ignore_ascii_case("select") => StatementKind::Select,
            Some(_) => StatementKind::Other,
            None => {
                return Err(GatewayError::AnalyzerMalformed(
                    "no leading keyword".to_string(),
                ))
            }
        };

        let tables = self.extract_tables(&stripped);
        let joins = self.extract_joins(&stripped);
        let where_atoms = self.extract_where_atoms(&stripped);
        let limit = extract_limit(&stripped);
        let selects_wildcard = WILDCARD_SELECT.is_match(&stripped);

        let has_tenant_filter = where_atoms.iter().any(|a| {
            let c = a.column.to_lowercase().replace('-', "_");
            self.tenant_aliases.iter().any(|alias| alias == &c)
        });
        let has_upload_table = tables
            .iter()
            .any(|t| self.upload_patterns.iter().any(|re| re.is_match(t)));

        let operations = self.operations(&stripped, &joins, &where_atoms);
        let complexity = score_complexity(&stripped, &joins);

        Ok(QueryShape {
            statement_kind,
            tables,
            has_tenant_filter,
            has_upload_table,
            limit,
            joins,
            where_atoms,
            operations,
            complexity,
            selects_wildcard,
            raw_text: sql.to_string(),
        })
    }

    fn extract_tables(&self, sql: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for cap in FROM_JOIN_TABLE.captures_iter(sql) {
            let table = cap[2].to_string();
            if !seen.contains(&table) {
                seen.push(table);
            }
        }
        seen
    }

    fn extract_joins(&self, sql: &str) -> Vec<JoinDescriptor> {
        let mut joins = Vec::new();
        for cap in JOIN_KEYWORD.captures_iter(sql) {
            let kind = match cap.get(1).map(|m| m.as_str().to_uppercase()) {
                Some(ref s) if s == "INNER" => JoinKind::Inner,
                Some(ref s) if s == "LEFT" => JoinKind::Left,
                Some(ref s) if s == "RIGHT" => JoinKind::Right,
                Some(ref s) if s == "FULL" => JoinKind::Full,
                _ => JoinKind::Inner,
            };
            let table = cap[2].to_string();
            let predicate = cap[3].to_string();
            let predicate_columns = extract_identifiers(&predicate);
            joins.push(JoinDescriptor {
                kind,
                table,
                predicate_columns,
            });
        }
        for cap in CROSS_JOIN.captures_iter(sql) {
            joins.push(JoinDescriptor {
                kind: JoinKind::Cross,
                table: cap[1].to_string(),
                predicate_columns: Vec::new(),
            });
        }
        joins
    }

    fn extract_where_atoms(&self, sql: &str) -> Vec<WhereAtom> {
        let Some(cap) = WHERE_CLAUSE.captures(sql) else {
            return Vec::new();
        };
        let clause = cap[1].trim();
        split_top_level_and_or(clause)
            .into_iter()
            .filter_map(|atom| {
                WHERE_ATOM_OP.captures(atom.trim()).map(|c| WhereAtom {
                    column: c[1].to_string(),
                    operator: c[2].to_string(),
                    rhs: c[3].trim().to_string(),
                    is_string_concat: c[3].contains('+') || c[3].to_uppercase().contains("CONCAT"),
                })
            })
            .collect()
    }

    fn operations(
        &self,
        sql: &str,
        joins: &[JoinDescriptor],
        where_atoms: &[WhereAtom],
    ) -> Vec<Operation> {
        let mut ops = vec![Operation::Select];
        if !where_atoms.is_empty() {
            ops.push(Operation::Where);
        }
        for _ in joins {
            ops.push(Operation::Join);
        }
        for _ in UNION.find_iter(sql) {
            ops.push(Operation::Union);
        }
        for _ in SUBQUERY.find_iter(sql) {
            ops.push(Operation::Subquery);
        }
        if GROUP_BY.is_match(sql) {
            ops.push(Operation::GroupBy);
        }
        if ORDER_BY.is_match(sql) {
            ops.push(Operation::OrderBy);
        }
        if HAVING.is_match(sql) {
            ops.push(Operation::Having);
        }
        ops
    }
}

fn strip_comments(sql: &str) -> String {
    let no_block = BLOCK_COMMENT.replace_all(sql, " ");
    LINE_COMMENT.replace_all(&no_block, " ").to_string()
}

fn balanced_parens(sql: &str) -> bool {
    let mut depth = 0i32;
    for c in sql.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn extract_limit(sql: &str) -> u32 {
    if let Some(c) = TOP_LIMIT.captures(sql) {
        return c[1].parse().unwrap_or(0);
    }
    if let Some(c) = LIMIT_CLAUSE.captures(sql) {
        return c[1].parse().unwrap_or(0);
    }
    0
}

/// Weighted complexity score:
/// +2 per join beyond the first, +3 per subquery, +1 per GROUP BY/ORDER
/// BY/HAVING, +1 per union. <=3 low, <=7 medium, else high.
fn score_complexity(sql: &str, joins: &[JoinDescriptor]) -> Complexity {
    let mut score = 0i64;
    if joins.len() > 1 {
        score += 2 * (joins.len() as i64 - 1);
    }
    score += 3 * SUBQUERY.find_iter(sql).count() as i64;
    if GROUP_BY.is_match(sql) {
        score += 1;
    }
    if ORDER_BY.is_match(sql) {
        score += 1;
    }
    if HAVING.is_match(sql) {
        score += 1;
    }
    score += UNION.find_iter(sql).count() as i64;

    if score <= 3 {
        Complexity::Low
    } else if score <= 7 {
        Complexity::Medium
    } else {
        Complexity::High
    }
}

/// Splits a WHERE clause by top-level AND/OR, ignoring boolean keywords
/// nested inside parentheses.
fn split_top_level_and_or(clause: &str) -> Vec<String> {
    let mut atoms = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let chars: Vec<char> = clause.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '(' => {
                depth += 1;
                current.push(c);
                i += 1;
            }
            ')' => {
                depth -= 1;
                current.push(c);
                i += 1;
            }
            _ if depth == 0 && matches_keyword(&chars, i, "AND") => {
                atoms.push(current.trim().to_string());
                current.clear();
                i += 3;
            }
            _ if depth == 0 && matches_keyword(&chars, i, "OR") => {
                atoms.push(current.trim().to_string());
                current.clear();
                i += 2;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    if !current.trim().is_empty() {
        atoms.push(current.trim().to_string());
    }
    atoms.into_iter().filter(|a| !a.is_empty()).collect()
}

fn matches_keyword(chars: &[char], at: usize, kw: &str) -> bool {
    let kw_len = kw.len();
    if at + kw_len > chars.len() {
        return false;
    }
    let word: String = chars[at..at + kw_len].iter().collect();
    if !word.eq_ignore_ascii_case(kw) {
        return false;
    }
    let before_ok = at == 0 || chars[at - 1].is_whitespace();
    let after_ok = at + kw_len == chars.len() || chars[at + kw_len].is_whitespace();
    before_ok && after_ok
}

fn extract_identifiers(text: &str) -> Vec<String> {
    lazy_static! {
        static ref IDENT: Regex = Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*\b|\b[A-Za-z_][A-Za-z0-9_]*\b").unwrap();
    }
    const KEYWORDS: &[&str] = &["AND", "OR", "ON", "NOT", "NULL"];
    IDENT
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|s| !KEYWORDS.iter().any(|k| s.eq_ignore_ascii_case(k)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> Analyzer {
        Analyzer::new(&GatewayConfig::default())
    }

    #[test]
    fn classifies_select_vs_other() {
        let a = analyzer();
        let shape = a.analyze("SELECT * FROM upload_table_A").unwrap();
        assert_eq!(shape.statement_kind, StatementKind::Select);

        let shape = a.analyze("DELETE FROM upload_table_A").unwrap();
        assert_eq!(shape.statement_kind, StatementKind::Other);
    }

    #[test]
    fn extracts_tenant_filter_and_upload_table() {
        let a = analyzer();
        let shape = a
            .analyze("SELECT a,b FROM upload_table_A WHERE client_id='T1'")
            .unwrap();
        assert!(shape.has_tenant_filter);
        assert!(shape.has_upload_table);
        assert_eq!(shape.tables, vec!["upload_table_A"]);
    }

    #[test]
    fn extracts_top_limit() {
        let a = analyzer();
        let shape = a
            .analyze("SELECT TOP 1000 a FROM upload_table_A")
            .unwrap();
        assert_eq!(shape.limit, 1000);
    }

    #[test]
    fn detects_cross_join_as_cartesian_hint() {
        let a = analyzer();
        let shape = a
            .analyze("SELECT * FROM upload_table_A CROSS JOIN upload_table_B")
            .unwrap();
        assert_eq!(shape.joins.len(), 1);
        assert_eq!(shape.joins[0].kind, JoinKind::Cross);
    }

    #[test]
    fn fails_on_empty_comment_only_query() {
        let a = analyzer();
        let err = a.analyze("-- just a comment").unwrap_err();
        assert!(matches!(err, GatewayError::AnalyzerMalformed(_)));
    }

    #[test]
    fn fails_on_unbalanced_parens() {
        let a = analyzer();
        let err = a.analyze("SELECT * FROM upload_table_A WHERE (a=1").unwrap_err();
        assert!(matches!(err, GatewayError::AnalyzerMalformed(_)));
    }

    #[test]
    fn complexity_buckets() {
        let a = analyzer();
        let low = a.analyze("SELECT * FROM upload_table_A").unwrap();
        assert_eq!(low.complexity, Complexity::Low);

        let high = a
            .analyze(
                "SELECT * FROM upload_table_A a \
                 JOIN upload_table_B b ON a.id=b.id \
                 JOIN upload_table_C c ON b.id=c.id \
                 WHERE a.x IN (SELECT y FROM upload_table_D) \
                 GROUP BY a.x ORDER BY a.x HAVING COUNT(*) > 1",
            )
            .unwrap();
        assert_eq!(high.complexity, Complexity::High);
    }
}
