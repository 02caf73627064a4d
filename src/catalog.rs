//! Read-only schema metadata for a tenant, filtered through the same
//! allow/exclude rules the validator applies. Used both by the tool surface
//! and to build schema context for the generation step.

use crate::{
    error::{Result, ServiceError},
    executor::{classify_pg_error, row_to_values},
    pool::PoolManager,
    tenant::{AllowList, ConnectionDescriptor},
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio_postgres::Client;

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub kind: &'static str,
    pub estimated_rows: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub sample_values: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDescription {
    pub name: String,
    pub columns: Vec<ColumnDescription>,
}

const SAMPLE_ROWS: usize = 3;

pub async fn list_tables(
    pools: &PoolManager,
    descriptor: &ConnectionDescriptor,
    allow_list: &AllowList,
) -> Result<Vec<TableSummary>> {
    let conn = pools.acquire(descriptor).await?;
    let outcome = fetch_tables(conn.client(), descriptor).await;
    conn.release().await;

    Ok(outcome?
        .into_iter()
        .filter(|summary| allow_list.admits(&summary.name))
        .collect())
}

async fn fetch_tables(
    client: &Client,
    descriptor: &ConnectionDescriptor,
) -> Result<Vec<TableSummary>> {
    let rows = client
        .query(
            "SELECT c.relname, c.relkind::text, GREATEST(c.reltuples, 0)::bigint \
             FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relkind IN ('r', 'p', 'v', 'm') \
             ORDER BY c.relname",
            &[&descriptor.schema],
        )
        .await
        .map_err(|err| classify_pg_error(err, descriptor.statement_timeout_secs))?;

    Ok(rows
        .iter()
        .map(|row| TableSummary {
            name: row.get(0),
            kind: match row.get::<_, String>(1).as_str() {
                "v" => "view",
                "m" => "materialized view",
                _ => "table",
            },
            estimated_rows: row.get(2),
        })
        .collect())
}

pub async fn describe_table(
    pools: &PoolManager,
    descriptor: &ConnectionDescriptor,
    allow_list: &AllowList,
    qualified_name: &str,
) -> Result<TableDescription> {
    let (schema, table) = split_qualified_name(qualified_name, &descriptor.schema)?;
    if !allow_list.admits(&table) {
        return Err(ServiceError::Validation(format!(
            "table '{table}' is not accessible for this tenant"
        )));
    }

    let conn = pools.acquire(descriptor).await?;
    let outcome = fetch_description(conn.client(), descriptor, &schema, &table).await;
    conn.release().await;
    outcome
}

async fn fetch_description(
    client: &Client,
    descriptor: &ConnectionDescriptor,
    schema: &str,
    table: &str,
) -> Result<TableDescription> {
    let timeout = descriptor.statement_timeout_secs;

    let columns = client
        .query(
            "SELECT column_name, data_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[&schema, &table],
        )
        .await
        .map_err(|err| classify_pg_error(err, timeout))?;
    if columns.is_empty() {
        return Err(ServiceError::InvalidRequest(format!(
            "table '{table}' was not found"
        )));
    }

    let key_rows = client
        .query(
            "SELECT a.attname \
             FROM pg_catalog.pg_index i \
             JOIN pg_catalog.pg_attribute a \
               ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             JOIN pg_catalog.pg_class c ON c.oid = i.indrelid \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary",
            &[&schema, &table],
        )
        .await
        .map_err(|err| classify_pg_error(err, timeout))?;
    let keys: Vec<String> = key_rows.iter().map(|row| row.get(0)).collect();

    let samples = fetch_samples(client, schema, table, timeout).await?;

    Ok(TableDescription {
        name: table.to_string(),
        columns: columns
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let sample_values = samples.get(&name).cloned().unwrap_or_default();
                ColumnDescription {
                    primary_key: keys.contains(&name),
                    data_type: row.get(1),
                    nullable: row.get::<_, String>(2) == "YES",
                    sample_values,
                    name,
                }
            })
            .collect(),
    })
}

async fn fetch_samples(
    client: &Client,
    schema: &str,
    table: &str,
    timeout: u64,
) -> Result<HashMap<String, Vec<Value>>> {
    let sql = format!(
        "SELECT * FROM {}.{} LIMIT {SAMPLE_ROWS}",
        quote_ident(schema),
        quote_ident(table),
    );
    let statement = client
        .prepare(&sql)
        .await
        .map_err(|err| classify_pg_error(err, timeout))?;
    let names: Vec<String> = statement
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();
    let rows = client
        .query(&statement, &[])
        .await
        .map_err(|err| classify_pg_error(err, timeout))?;

    let mut samples: HashMap<String, Vec<Value>> = HashMap::new();
    for row in &rows {
        for (idx, value) in row_to_values(row).into_iter().enumerate() {
            if value.is_null() {
                continue;
            }
            if let Some(name) = names.get(idx) {
                samples.entry(name.clone()).or_default().push(value);
            }
        }
    }
    Ok(samples)
}

/// Compact `table(column type, ...)` context for the generation prompt,
/// covering every table the allow-list admits.
pub async fn schema_context(
    pools: &PoolManager,
    descriptor: &ConnectionDescriptor,
    allow_list: &AllowList,
) -> Result<String> {
    let conn = pools.acquire(descriptor).await?;
    let outcome = conn
        .client()
        .query(
            "SELECT table_name, column_name, data_type \
             FROM information_schema.columns \
             WHERE table_schema = $1 \
             ORDER BY table_name, ordinal_position",
            &[&descriptor.schema],
        )
        .await
        .map_err(|err| classify_pg_error(err, descriptor.statement_timeout_secs));
    conn.release().await;

    let mut tables: Vec<(String, Vec<String>)> = Vec::new();
    for row in &outcome? {
        let table: String = row.get(0);
        if !allow_list.admits(&table) {
            continue;
        }
        let column = format!("{} {}", row.get::<_, String>(1), row.get::<_, String>(2));
        match tables.last_mut() {
            Some((name, columns)) if *name == table => columns.push(column),
            _ => tables.push((table, vec![column])),
        }
    }

    Ok(tables
        .into_iter()
        .map(|(name, columns)| format!("{name}({})", columns.join(", ")))
        .collect::<Vec<_>>()
        .join("\n"))
}

fn split_qualified_name(qualified: &str, default_schema: &str) -> Result<(String, String)> {
    let mut parts = qualified.split('.');
    let (schema, table) = match (parts.next(), parts.next(), parts.next()) {
        (Some(table), None, _) => (default_schema.to_string(), table.to_string()),
        (Some(schema), Some(table), None) => (schema.to_string(), table.to_string()),
        _ => {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid table name '{qualified}'"
            )))
        }
    };

    for part in [&schema, &table] {
        if part.is_empty()
            || !part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid table name '{qualified}'"
            )));
        }
    }

    Ok((schema, table))
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn qualified_names_split_against_the_default_schema() {
        let (schema, table) = split_qualified_name("orders", "public").expect("valid");
        assert_eq!((schema.as_str(), table.as_str()), ("public", "orders"));

        let (schema, table) = split_qualified_name("sales.orders", "public").expect("valid");
        assert_eq!((schema.as_str(), table.as_str()), ("sales", "orders"));
    }

    #[test]
    fn hostile_table_names_are_rejected() {
        for name in ["a.b.c", "orders; drop table x", "\"orders\"", "", "a b"] {
            assert!(
                split_qualified_name(name, "public").is_err(),
                "accepted: {name}"
            );
        }
    }
}
