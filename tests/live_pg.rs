//! Properties that need a real PostgreSQL server: limit injection on the
//! wire, truncation, pool-busy behavior, role switching, and SQLSTATE
//! classification. The harness skips itself unless the SQLGATE_TEST_DB_*
//! environment variables point at a disposable database.
//!
//! Required: SQLGATE_TEST_DB_HOST, SQLGATE_TEST_DB_PASSWORD. Optional:
//! SQLGATE_TEST_DB_PORT (5432), SQLGATE_TEST_DB_NAME (postgres),
//! SQLGATE_TEST_DB_USER (postgres), SQLGATE_TEST_DB_ROLE (defaults to the
//! user, which every session may SET ROLE to).

use serial_test::serial;
use sqlgate::{
    error::ServiceError,
    executor::{ExecuteQuery, ExecutionContext, QueryExecutor},
    pool::{PoolManager, PoolSettings},
    ratelimit::{RateLimitSettings, RateLimiter},
    tenant::{AllowList, ConnectionDescriptor, EnvCredentialStore},
};
use std::{env, sync::Arc, time::Duration};
use tokio_postgres::NoTls;

struct Fixture {
    host: String,
    port: u16,
    database: String,
    user: String,
    password: String,
    role: String,
}

impl Fixture {
    fn from_env() -> Option<Self> {
        let host = env::var("SQLGATE_TEST_DB_HOST").ok()?;
        let password = env::var("SQLGATE_TEST_DB_PASSWORD").ok()?;
        let user = env::var("SQLGATE_TEST_DB_USER").unwrap_or_else(|_| "postgres".into());
        Some(Self {
            host,
            port: env::var("SQLGATE_TEST_DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: env::var("SQLGATE_TEST_DB_NAME").unwrap_or_else(|_| "postgres".into()),
            role: env::var("SQLGATE_TEST_DB_ROLE").unwrap_or_else(|_| user.clone()),
            user,
            password,
        })
    }

    fn descriptor(&self, tenant_id: &str, max_rows: u64) -> ConnectionDescriptor {
        ConnectionDescriptor {
            tenant_id: tenant_id.into(),
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            schema: "public".into(),
            user: self.user.clone(),
            credential_ref: "SQLGATE_TEST_DB_PASSWORD".into(),
            read_only_role: self.role.clone(),
            max_rows,
            statement_timeout_secs: 30,
            pool_size: Some(2),
        }
    }

    async fn seed(&self) {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .password(&self.password);
        let (client, connection) = config.connect(NoTls).await.expect("fixture connect");
        tokio::spawn(async move {
            let _ = connection.await;
        });

        client
            .batch_execute(
                "DROP TABLE IF EXISTS sqlgate_live_orders; \
                 CREATE TABLE sqlgate_live_orders (id bigint PRIMARY KEY, total double precision, placed_at timestamptz); \
                 INSERT INTO sqlgate_live_orders (id, total, placed_at) \
                 SELECT g, g * 10.5, now() FROM generate_series(1, 5) g",
            )
            .await
            .expect("fixture seed");
    }
}

fn pools(settings: PoolSettings) -> Arc<PoolManager> {
    Arc::new(PoolManager::new(settings, None, Arc::new(EnvCredentialStore)))
}

fn executor(pools: Arc<PoolManager>) -> QueryExecutor {
    QueryExecutor::new(
        pools,
        Arc::new(RateLimiter::new(RateLimitSettings {
            window: Duration::from_secs(60),
            identity_limit: 1000,
            tenant_limit: 1000,
        })),
    )
}

fn context(descriptor: ConnectionDescriptor) -> ExecutionContext {
    ExecutionContext {
        descriptor: Arc::new(descriptor),
        allow_list: AllowList::default(),
        identity: "live-test".into(),
    }
}

macro_rules! require_fixture {
    () => {
        match Fixture::from_env() {
            Some(fixture) => fixture,
            None => {
                eprintln!(
                    "[sqlgate-test] skipping live harness: SQLGATE_TEST_DB_HOST and SQLGATE_TEST_DB_PASSWORD are not set"
                );
                return;
            }
        }
    };
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn injects_the_row_limit_and_flags_truncation() {
    let fixture = require_fixture!();
    fixture.seed().await;

    let executor = executor(pools(PoolSettings::default()));
    let ctx = context(fixture.descriptor("live-limit", 3));

    let result = executor
        .execute(&ctx, "SELECT id, total FROM sqlgate_live_orders ORDER BY id")
        .await
        .expect("query should run");

    assert!(result.executed_sql.ends_with("LIMIT 3"), "sql: {}", result.executed_sql);
    assert_eq!(result.columns, vec!["id".to_string(), "total".to_string()]);
    assert_eq!(result.row_count, 3);
    assert!(result.truncated, "5 rows behind a LIMIT 3 must flag truncation");
    assert_eq!(result.rows[0][0], serde_json::json!(1));

    // A stricter caller limit is preserved and not flagged as truncation
    // when the table runs out first.
    let result = executor
        .execute(&ctx, "SELECT id FROM sqlgate_live_orders WHERE id = 1 LIMIT 2")
        .await
        .expect("query should run");
    assert_eq!(result.row_count, 1);
    assert!(!result.truncated);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn count_star_scenario_returns_a_single_cell() {
    let fixture = require_fixture!();
    fixture.seed().await;

    let executor = executor(pools(PoolSettings::default()));
    let ctx = context(fixture.descriptor("live-count", 500));

    let result = executor
        .execute(&ctx, "SELECT COUNT(*) FROM sqlgate_live_orders")
        .await
        .expect("query should run");

    assert!(result.executed_sql.ends_with("LIMIT 500"));
    assert_eq!(result.row_count, 1);
    assert_eq!(result.columns.len(), 1);
    assert_eq!(result.rows[0][0], serde_json::json!(5));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn unknown_columns_classify_as_correctable() {
    let fixture = require_fixture!();
    fixture.seed().await;

    let executor = executor(pools(PoolSettings::default()));
    let ctx = context(fixture.descriptor("live-classify", 500));

    let err = executor
        .execute(&ctx, "SELECT amt FROM sqlgate_live_orders")
        .await
        .expect_err("unknown column should fail");

    assert!(err.is_correctable(), "got: {err:?}");
    assert!(err.public_message().contains("amt"));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn exhausted_pools_fail_distinctly_instead_of_hanging() {
    let fixture = require_fixture!();

    let pools = pools(PoolSettings {
        acquire_timeout: Duration::from_millis(300),
        ..PoolSettings::default()
    });
    let mut descriptor = fixture.descriptor("live-busy", 500);
    descriptor.pool_size = Some(1);

    let held = pools.acquire(&descriptor).await.expect("first checkout");
    let err = pools
        .acquire(&descriptor)
        .await
        .expect_err("second checkout must not wait forever");
    assert!(matches!(err, ServiceError::PoolBusy), "got: {err:?}");

    // After release the pool serves again.
    held.release().await;
    let conn = pools.acquire(&descriptor).await.expect("checkout after release");
    conn.release().await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn unswitchable_roles_are_a_hard_permission_error() {
    let fixture = require_fixture!();

    let pools = pools(PoolSettings::default());
    let mut descriptor = fixture.descriptor("live-role", 500);
    descriptor.read_only_role = "sqlgate_role_that_does_not_exist".into();

    let err = pools
        .acquire(&descriptor)
        .await
        .expect_err("role switch must fail hard");
    assert!(matches!(err, ServiceError::Permission(_)), "got: {err:?}");
}
