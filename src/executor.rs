//! One query attempt: rate limit, validate, check out a tenant connection,
//! run the statement, shape rows, classify failures. Error classification
//! happens here exactly once; the correction loop relies on it.

use crate::{
    error::{Result, ServiceError},
    pool::PoolManager,
    ratelimit::RateLimiter,
    tenant::{AllowList, ConnectionDescriptor},
    validator,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_postgres::{error::SqlState, types::Type, Client, Row};
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub executed_sql: String,
}

/// Everything one attempt needs, passed explicitly: no ambient tenant state
/// anywhere in the pipeline.
#[derive(Clone)]
pub struct ExecutionContext {
    pub descriptor: Arc<ConnectionDescriptor>,
    pub allow_list: AllowList,
    pub identity: String,
}

#[async_trait]
pub trait ExecuteQuery: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, sql: &str) -> Result<QueryResult>;
}

#[derive(Clone)]
pub struct QueryExecutor {
    pools: Arc<PoolManager>,
    limiter: Arc<RateLimiter>,
}

impl QueryExecutor {
    pub fn new(pools: Arc<PoolManager>, limiter: Arc<RateLimiter>) -> Self {
        Self { pools, limiter }
    }
}

#[async_trait]
impl ExecuteQuery for QueryExecutor {
    async fn execute(&self, ctx: &ExecutionContext, sql: &str) -> Result<QueryResult> {
        // Quota is consumed before validation so rejected statements still
        // count against the caller.
        self.limiter
            .check_and_increment(&ctx.identity, &ctx.descriptor.tenant_id)?;

        let validated = validator::validate(sql, &ctx.allow_list, ctx.descriptor.max_rows)?;
        for warning in &validated.warnings {
            debug!(tenant = %ctx.descriptor.tenant_id, warning, "validation warning");
        }

        let conn = self.pools.acquire(&ctx.descriptor).await?;
        let outcome = run_statement(
            conn.client(),
            &validated.sql,
            ctx.descriptor.statement_timeout_secs,
        )
        .await;
        conn.release().await;

        let (columns, rows) = outcome?;
        let effective = validator::effective_limit(&validated.sql, ctx.descriptor.max_rows);
        let truncated = effective > 0 && rows.len() as u64 >= effective;

        Ok(QueryResult {
            columns,
            row_count: rows.len(),
            rows,
            truncated,
            executed_sql: validated.sql,
        })
    }
}

async fn run_statement(
    client: &Client,
    sql: &str,
    timeout_secs: u64,
) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let statement = client
        .prepare(sql)
        .await
        .map_err(|err| classify_pg_error(err, timeout_secs))?;
    let columns: Vec<String> = statement
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();

    let rows = client
        .query(&statement, &[])
        .await
        .map_err(|err| classify_pg_error(err, timeout_secs))?;

    let shaped = rows.iter().map(row_to_values).collect();
    Ok((columns, shaped))
}

/// Maps a database failure into the service taxonomy. The correctable set is
/// the contract the correction loop depends on: mistakes a regenerated
/// statement could plausibly fix.
pub(crate) fn classify_pg_error(err: tokio_postgres::Error, timeout_secs: u64) -> ServiceError {
    let Some(db) = err.as_db_error() else {
        // No server response at all: network, TLS, or protocol trouble.
        // The raw message may name hosts, so it stays out of the public text.
        return ServiceError::Connection(err.to_string());
    };

    let code = db.code();
    if is_correctable_state(code) {
        return ServiceError::Correctable {
            message: db.message().to_string(),
        };
    }
    if *code == SqlState::QUERY_CANCELED {
        return ServiceError::Timeout {
            seconds: timeout_secs,
        };
    }
    if *code == SqlState::INSUFFICIENT_PRIVILEGE {
        return ServiceError::Permission(
            "the read-only role lacks access to the referenced objects".into(),
        );
    }

    match &code.code()[..2] {
        "08" | "28" | "57" => ServiceError::Connection(db.message().to_string()),
        // Parse and data-shape classes name schema objects, not
        // infrastructure; their message is safe to surface.
        "22" | "42" => ServiceError::Execution {
            message: db.message().to_string(),
        },
        _ => ServiceError::Execution {
            message: "the database rejected the query".into(),
        },
    }
}

fn is_correctable_state(code: &SqlState) -> bool {
    [
        SqlState::UNDEFINED_COLUMN,
        SqlState::UNDEFINED_TABLE,
        SqlState::UNDEFINED_FUNCTION,
        SqlState::UNDEFINED_OBJECT,
        SqlState::AMBIGUOUS_COLUMN,
        SqlState::AMBIGUOUS_FUNCTION,
        SqlState::DATATYPE_MISMATCH,
        SqlState::INVALID_TEXT_REPRESENTATION,
        SqlState::SYNTAX_ERROR,
        SqlState::GROUPING_ERROR,
        SqlState::INVALID_COLUMN_REFERENCE,
        SqlState::DIVISION_BY_ZERO,
    ]
    .contains(code)
}

pub(crate) fn row_to_values(row: &Row) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| cell_to_json(row, idx, col.type_()))
        .collect()
}

fn cell_to_json(row: &Row, idx: usize, ty: &Type) -> Value {
    if *ty == Type::BOOL {
        scalar(row, idx, Value::Bool)
    } else if *ty == Type::INT2 {
        scalar(row, idx, |v: i16| json!(v))
    } else if *ty == Type::INT4 {
        scalar(row, idx, |v: i32| json!(v))
    } else if *ty == Type::INT8 {
        scalar(row, idx, |v: i64| json!(v))
    } else if *ty == Type::OID {
        scalar(row, idx, |v: u32| json!(v))
    } else if *ty == Type::FLOAT4 {
        scalar(row, idx, |v: f32| json!(v))
    } else if *ty == Type::FLOAT8 {
        scalar(row, idx, |v: f64| json!(v))
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
    {
        scalar(row, idx, Value::String)
    } else if *ty == Type::TIMESTAMPTZ {
        scalar(row, idx, |v: chrono::DateTime<chrono::Utc>| {
            Value::String(v.to_rfc3339())
        })
    } else if *ty == Type::TIMESTAMP {
        scalar(row, idx, |v: chrono::NaiveDateTime| {
            Value::String(v.to_string())
        })
    } else if *ty == Type::DATE {
        scalar(row, idx, |v: chrono::NaiveDate| Value::String(v.to_string()))
    } else if *ty == Type::TIME {
        scalar(row, idx, |v: chrono::NaiveTime| Value::String(v.to_string()))
    } else if *ty == Type::UUID {
        scalar(row, idx, |v: uuid::Uuid| Value::String(v.to_string()))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        scalar(row, idx, |v: Value| v)
    } else {
        debug!(column_type = %ty, "unsupported column type rendered as null");
        Value::Null
    }
}

fn scalar<T, F>(row: &Row, idx: usize, to_value: F) -> Value
where
    T: for<'a> tokio_postgres::types::FromSql<'a>,
    F: FnOnce(T) -> Value,
{
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(value)) => to_value(value),
        Ok(None) => Value::Null,
        Err(err) => {
            debug!(error = %err, column = idx, "failed to decode column value");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correctable_states_cover_wrong_guess_failures() {
        for state in [
            SqlState::UNDEFINED_COLUMN,
            SqlState::UNDEFINED_TABLE,
            SqlState::DATATYPE_MISMATCH,
            SqlState::AMBIGUOUS_COLUMN,
            SqlState::SYNTAX_ERROR,
        ] {
            assert!(is_correctable_state(&state), "{state:?} should be correctable");
        }
    }

    #[test]
    fn fatal_states_are_not_correctable() {
        for state in [
            SqlState::INSUFFICIENT_PRIVILEGE,
            SqlState::QUERY_CANCELED,
            SqlState::CONNECTION_FAILURE,
            SqlState::ADMIN_SHUTDOWN,
        ] {
            assert!(!is_correctable_state(&state), "{state:?} must be fatal");
        }
    }
}
