//! Statement validation: everything that must hold before a candidate SQL
//! string is allowed anywhere near a tenant connection.

use crate::{
    error::{Result, ServiceError},
    tenant::AllowList,
};
use sqlparser::{
    ast::{Expr, ObjectName, Query, SetExpr, Statement, TableFactor, TableWithJoins, Value, Visit, Visitor},
    dialect::PostgreSqlDialect,
    parser::Parser,
    tokenizer::{Token, Tokenizer},
};
use std::{collections::HashSet, ops::ControlFlow};

/// An accepted statement, rewritten with the tenant's row limit, plus any
/// low-confidence warnings gathered along the way.
#[derive(Debug, Clone)]
pub struct Validated {
    pub sql: String,
    pub warnings: Vec<String>,
}

/// Statement keywords that disqualify a candidate outright, wherever they
/// appear in the token stream. Word tokens only, so string literals never
/// trip the scan.
const BLOCKED_KEYWORDS: &[&str] = &[
    "INSERT",
    "UPDATE",
    "DELETE",
    "DROP",
    "ALTER",
    "TRUNCATE",
    "CREATE",
    "GRANT",
    "REVOKE",
    "MERGE",
    "COPY",
    "CALL",
    "LOCK",
    "PREPARE",
    "DEALLOCATE",
    "VACUUM",
    "REINDEX",
    "LISTEN",
    "NOTIFY",
];

/// Server-side functions that read files, open network connections, touch
/// roles, or administer the server. Rejected when they appear as a call.
const BLOCKED_FUNCTIONS: &[&str] = &[
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "lo_import",
    "lo_export",
    "dblink",
    "dblink_connect",
    "dblink_exec",
    "dblink_send_query",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "pg_promote",
    "pg_switch_wal",
    "set_config",
    "pg_sleep",
    "pg_sleep_for",
    "pg_sleep_until",
];

pub fn validate(sql: &str, allow_list: &AllowList, max_rows: u64) -> Result<Validated> {
    let dialect = PostgreSqlDialect {};

    let mut statements = Parser::parse_sql(&dialect, sql).map_err(|_| {
        ServiceError::Validation("statement could not be parsed as a single read-only query".into())
    })?;
    if statements.len() != 1 {
        return Err(ServiceError::Validation(
            "exactly one statement is allowed per query".into(),
        ));
    }
    scan_tokens(sql, &dialect)?;

    let mut query = match statements.remove(0) {
        Statement::Query(query) => query,
        _ => {
            return Err(ServiceError::Validation(
                "only read-only SELECT queries are allowed".into(),
            ))
        }
    };

    let mut warnings = Vec::new();
    check_relations(&query, allow_list, &mut warnings)?;
    apply_row_limit(&mut query, max_rows, &mut warnings);

    Ok(Validated {
        sql: query.to_string(),
        warnings,
    })
}

/// Token-level scan for blocked keywords and blocked function calls. Runs on
/// the raw text so keywords buried in subqueries or CTE bodies are caught
/// even where the AST shape alone would look legitimate.
fn scan_tokens(sql: &str, dialect: &PostgreSqlDialect) -> Result<()> {
    let tokens = Tokenizer::new(dialect, sql).tokenize().map_err(|_| {
        ServiceError::Validation("statement could not be parsed as a single read-only query".into())
    })?;

    let mut pending_call: Option<String> = None;
    for token in &tokens {
        match token {
            Token::Word(word) => {
                if word.quote_style.is_none() {
                    let upper = word.value.to_uppercase();
                    if BLOCKED_KEYWORDS.contains(&upper.as_str()) {
                        return Err(ServiceError::Validation(format!(
                            "data-modification or DDL keyword '{upper}' is not allowed"
                        )));
                    }
                }
                pending_call = Some(word.value.to_lowercase());
            }
            Token::Whitespace(_) => {}
            Token::LParen => {
                if let Some(name) = pending_call.take() {
                    if BLOCKED_FUNCTIONS.contains(&name.as_str()) {
                        return Err(ServiceError::Validation(format!(
                            "function '{name}' is not allowed"
                        )));
                    }
                }
            }
            _ => {
                pending_call = None;
            }
        }
    }

    Ok(())
}

#[derive(Default)]
struct RelationCollector {
    cte_names: HashSet<String>,
    relations: Vec<ObjectName>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<()> {
        self.relations.push(relation.clone());
        ControlFlow::Continue(())
    }
}

/// Counts FROM-clause sources that cannot be resolved to a plain table name:
/// derived tables, table functions, unnest, and friends.
fn count_opaque_sources(query: &Query) -> usize {
    fn walk_set_expr(set_expr: &SetExpr, count: &mut usize) {
        match set_expr {
            SetExpr::Select(select) => {
                for table in &select.from {
                    walk_table(table, count);
                }
            }
            SetExpr::Query(query) => walk_query(query, count),
            SetExpr::SetOperation { left, right, .. } => {
                walk_set_expr(left, count);
                walk_set_expr(right, count);
            }
            _ => {}
        }
    }

    fn walk_table(table: &TableWithJoins, count: &mut usize) {
        walk_factor(&table.relation, count);
        for join in &table.joins {
            walk_factor(&join.relation, count);
        }
    }

    fn walk_factor(factor: &TableFactor, count: &mut usize) {
        match factor {
            TableFactor::Table { .. } => {}
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => walk_table(table_with_joins, count),
            TableFactor::Derived { subquery, .. } => {
                *count += 1;
                walk_query(subquery, count);
            }
            _ => *count += 1,
        }
    }

    fn walk_query(query: &Query, count: &mut usize) {
        walk_set_expr(&query.body, count);
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                walk_query(&cte.query, count);
            }
        }
    }

    let mut count = 0;
    walk_query(query, &mut count);
    count
}

/// Resolves every referenced table against the tenant's allow-list. CTE names
/// are in scope and skipped; derived tables and table functions cannot be
/// resolved statically and only produce a warning, so dialect corners do not
/// turn into false rejections.
fn check_relations(
    query: &Query,
    allow_list: &AllowList,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let mut collector = RelationCollector::default();
    let _ = query.visit(&mut collector);

    for relation in &collector.relations {
        let idents = &relation.0;
        let Some(table) = idents.last() else {
            continue;
        };
        if idents.len() == 1 && collector.cte_names.contains(&table.value.to_lowercase()) {
            continue;
        }
        if !allow_list.admits(&table.value) {
            return Err(ServiceError::Validation(format!(
                "table '{}' is not accessible for this tenant",
                table.value
            )));
        }
    }

    let opaque = count_opaque_sources(query);
    if opaque > 0 {
        warnings.push(format!(
            "{opaque} table source(s) could not be statically resolved and will be checked by the database"
        ));
    }

    Ok(())
}

/// Injects or clamps the outermost row limit. A stricter caller-supplied
/// limit is never loosened; a missing or non-literal one becomes the tenant
/// maximum.
fn apply_row_limit(query: &mut Query, max_rows: u64, warnings: &mut Vec<String>) {
    let cap = Expr::Value(Value::Number(max_rows.to_string(), false));

    if let Some(fetch) = query.fetch.as_mut() {
        match fetch.quantity.as_ref() {
            Some(Expr::Value(Value::Number(n, _))) => {
                if n.parse::<u64>().map(|v| v > max_rows).unwrap_or(true) {
                    fetch.quantity = Some(cap);
                }
            }
            Some(_) => {
                fetch.quantity = Some(cap);
                warnings.push("non-literal fetch quantity replaced with the tenant maximum".into());
            }
            // FETCH FIRST ROW ONLY fetches a single row.
            None => {}
        }
        return;
    }

    match query.limit.as_ref() {
        None => query.limit = Some(cap),
        Some(Expr::Value(Value::Number(n, _))) => {
            if n.parse::<u64>().map(|v| v > max_rows).unwrap_or(true) {
                query.limit = Some(cap);
            }
        }
        Some(_) => {
            query.limit = Some(cap);
            warnings.push("non-literal limit replaced with the tenant maximum".into());
        }
    }
}

/// Effective row ceiling for an accepted statement, used by the executor to
/// flag truncation.
pub fn effective_limit(sql: &str, max_rows: u64) -> u64 {
    let dialect = PostgreSqlDialect {};
    if let Ok(statements) = Parser::parse_sql(&dialect, sql) {
        if let Some(Statement::Query(query)) = statements.first() {
            if let Some(Expr::Value(Value::Number(n, _))) = query.limit.as_ref() {
                if let Ok(value) = n.parse::<u64>() {
                    return value.min(max_rows);
                }
            }
        }
    }
    max_rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn open_list() -> AllowList {
        AllowList::default()
    }

    fn validate_ok(sql: &str, allow: &AllowList) -> Validated {
        validate(sql, allow, 500).expect("statement should validate")
    }

    fn validate_err(sql: &str, allow: &AllowList) -> String {
        match validate(sql, allow, 500) {
            Err(ServiceError::Validation(reason)) => reason,
            other => panic!("expected validation rejection, got {other:?}"),
        }
    }

    #[test]
    fn rejects_data_modification_keywords_in_any_position() {
        let allow = open_list();
        for sql in [
            "INSERT INTO orders VALUES (1)",
            "UpDaTe orders SET total = 0",
            "delete from orders",
            "DROP TABLE orders",
            "ALTER TABLE orders ADD COLUMN x int",
            "TRUNCATE orders",
            "SELECT * FROM orders WHERE id IN (DELETE FROM orders RETURNING id)",
            "WITH gone AS (DELETE FROM orders RETURNING id) SELECT * FROM gone",
            "  select 1;  drop table orders",
        ] {
            assert!(validate(sql, &allow, 500).is_err(), "accepted: {sql}");
        }
    }

    #[test]
    fn keywords_inside_string_literals_do_not_reject() {
        let allow = open_list();
        let validated = validate_ok("SELECT 'please do not DELETE me' FROM orders", &allow);
        assert!(validated.sql.contains("LIMIT 500"));
    }

    #[test]
    fn rejects_multiple_statements_but_allows_trailing_semicolon() {
        let allow = open_list();
        validate_err("SELECT 1; SELECT 2", &allow);
        validate_ok("SELECT 1;", &allow);
    }

    #[test]
    fn rejects_non_select_statements() {
        let allow = open_list();
        let reason = validate_err("EXPLAIN SELECT * FROM orders", &allow);
        assert!(reason.contains("read-only"), "reason: {reason}");
    }

    #[test]
    fn rejects_blocklisted_function_calls_case_insensitively() {
        let allow = open_list();
        for sql in [
            "SELECT pg_read_file('/etc/passwd')",
            "SELECT PG_SLEEP(30)",
            "SELECT * FROM orders WHERE dblink ('host=evil', 'SELECT 1') IS NOT NULL",
        ] {
            assert!(validate(sql, &allow, 500).is_err(), "accepted: {sql}");
        }
    }

    #[test]
    fn function_names_without_a_call_are_fine() {
        let allow = open_list();
        validate_ok("SELECT 'pg_read_file' FROM orders", &allow);
    }

    #[test]
    fn enforces_allow_list_membership() {
        let allow = AllowList::new(["orders", "customers"], Vec::<String>::new());
        validate_ok("SELECT * FROM orders", &allow);
        validate_ok("SELECT * FROM ORDERS o JOIN customers c ON c.id = o.customer_id", &allow);
        let reason = validate_err("SELECT * FROM products", &allow);
        assert!(reason.contains("products"), "reason: {reason}");
    }

    #[test]
    fn allow_list_applies_inside_subqueries() {
        let allow = AllowList::new(["orders"], Vec::<String>::new());
        validate_err(
            "SELECT * FROM orders WHERE id IN (SELECT order_id FROM products)",
            &allow,
        );
    }

    #[test]
    fn exclusion_wins_over_membership() {
        let allow = AllowList::new(["orders"], ["orders"]);
        validate_err("SELECT * FROM orders", &allow);
    }

    #[test]
    fn cte_names_are_not_tables() {
        let allow = AllowList::new(["orders"], Vec::<String>::new());
        let validated = validate_ok(
            "WITH recent AS (SELECT * FROM orders) SELECT * FROM recent",
            &allow,
        );
        assert!(validated.warnings.is_empty());
    }

    #[test]
    fn derived_tables_warn_instead_of_rejecting() {
        let allow = AllowList::new(["orders"], Vec::<String>::new());
        let validated = validate_ok("SELECT * FROM (SELECT 1 AS one) t", &allow);
        assert_eq!(validated.warnings.len(), 1);
    }

    #[test]
    fn injects_limit_when_absent() {
        let validated = validate_ok("SELECT COUNT(*) FROM orders", &open_list());
        assert_eq!(validated.sql, "SELECT COUNT(*) FROM orders LIMIT 500");
    }

    #[test]
    fn clamps_oversized_limit_to_tenant_maximum() {
        let validated = validate_ok("SELECT * FROM orders LIMIT 100000", &open_list());
        assert!(validated.sql.ends_with("LIMIT 500"), "sql: {}", validated.sql);
    }

    #[test]
    fn preserves_stricter_limit() {
        let validated = validate_ok("SELECT * FROM orders LIMIT 10", &open_list());
        assert!(validated.sql.ends_with("LIMIT 10"), "sql: {}", validated.sql);
    }

    #[test]
    fn clamps_fetch_first_quantities() {
        let validated = validate_ok(
            "SELECT * FROM orders FETCH FIRST 100000 ROWS ONLY",
            &open_list(),
        );
        assert!(validated.sql.contains("500"), "sql: {}", validated.sql);
        assert!(!validated.sql.contains("100000"), "sql: {}", validated.sql);
    }

    #[test]
    fn effective_limit_tracks_the_rewritten_statement() {
        assert_eq!(effective_limit("SELECT * FROM orders LIMIT 10", 500), 10);
        assert_eq!(effective_limit("SELECT * FROM orders LIMIT 500", 500), 500);
        assert_eq!(effective_limit("SELECT * FROM orders", 500), 500);
    }
}
