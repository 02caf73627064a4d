//! Per-tenant connection pooling. One bb8 pool of tokio-postgres clients per
//! tenant database, created lazily and reused across requests. Every checkout
//! switches the session to the tenant's read-only role and applies its
//! statement timeout before the executor sees the connection.

use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    tenant::{ConnectionDescriptor, CredentialStore},
};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection, RunError};
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use secrecy::ExposeSecret;
use std::{collections::HashMap, fs::File, io::BufReader, sync::Arc, time::Duration};
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Hard cap per tenant pool; kept in low single digits to protect the
    /// target database.
    pub default_max_size: u32,
    /// Bounded wait for a free connection before failing with pool-busy.
    pub acquire_timeout: Duration,
    /// Idle clients beyond this age are closed by the pool reaper.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            default_max_size: 4,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub type PgPool = Pool<PgClientManager>;

/// A pooled client plus the flag tracking whether tenant session state
/// (role, timeout, search path) is still applied. Dirty clients are refused
/// back into the pool.
pub struct SessionClient {
    client: Client,
    dirty: bool,
}

#[derive(Clone)]
pub struct PgClientManager {
    config: PgConfig,
    tls: PgTls,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

#[async_trait]
impl ManageConnection for PgClientManager {
    type Connection = SessionClient;
    type Error = anyhow::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.config.clone();
        let client = match &self.tls {
            PgTls::None => {
                let (client, connection) = config.connect(NoTls).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        debug!(error = %err, "postgres connection task ended");
                    }
                });
                client
            }
            PgTls::Rustls(connector) => {
                let (client, connection) = config.connect(connector.clone()).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        debug!(error = %err, "postgres connection task ended");
                    }
                });
                client
            }
        };

        Ok(SessionClient {
            client,
            dirty: false,
        })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.client.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.dirty || conn.client.is_closed()
    }
}

/// A checked-out connection scoped to one query attempt. Obtain it through
/// [`PoolManager::acquire`]; hand it back through [`ScopedConnection::release`].
pub struct ScopedConnection {
    guard: PooledConnection<'static, PgClientManager>,
}

impl std::fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedConnection").finish_non_exhaustive()
    }
}

impl ScopedConnection {
    pub fn client(&self) -> &Client {
        &self.guard.client
    }

    /// Resets session state and returns the client to the pool. A guard
    /// dropped without release (cancellation, panic) stays dirty, so the
    /// pool discards the connection instead of reusing leaked session state.
    pub async fn release(mut self) {
        let reset = self
            .guard
            .client
            .batch_execute("RESET ROLE; RESET statement_timeout; RESET search_path")
            .await;
        match reset {
            Ok(()) => self.guard.dirty = false,
            Err(err) => debug!(error = %err, "session reset failed; discarding connection"),
        }
    }
}

pub struct PoolManager {
    settings: PoolSettings,
    tls: PgTls,
    credentials: Arc<dyn CredentialStore>,
    pools: RwLock<HashMap<String, PgPool>>,
}

impl PoolManager {
    pub fn new(
        settings: PoolSettings,
        tls: Option<MakeRustlsConnect>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            settings,
            tls: match tls {
                Some(connector) => PgTls::Rustls(connector),
                None => PgTls::None,
            },
            credentials,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AppConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let tls = match config.pg_ssl_root_cert.as_deref() {
            Some(root) => Some(build_tls(
                root,
                config.pg_ssl_cert.as_deref(),
                config.pg_ssl_key.as_deref(),
            )?),
            None => None,
        };
        Ok(Self::new(config.pool.clone(), tls, credentials))
    }

    /// Checks out a connection for one attempt against the tenant database,
    /// with the read-only role and statement timeout already applied.
    pub async fn acquire(&self, descriptor: &ConnectionDescriptor) -> Result<ScopedConnection> {
        let pool = self.pool_for(descriptor).await?;

        let mut guard = match pool.get_owned().await {
            Ok(guard) => guard,
            Err(RunError::TimedOut) => {
                warn!(tenant = %descriptor.tenant_id, "connection pool busy");
                return Err(ServiceError::PoolBusy);
            }
            Err(RunError::User(err)) => {
                return Err(ServiceError::Connection(err.to_string()));
            }
        };

        // Anything that fails from here on leaves the guard dirty and the
        // connection is discarded on drop.
        guard.dirty = true;

        let setup = format!(
            "SET ROLE {}; SET statement_timeout = {}; SET search_path TO {}",
            quote_ident(&descriptor.read_only_role),
            descriptor.statement_timeout_secs.max(1) * 1000,
            quote_ident(&descriptor.schema),
        );
        if let Err(err) = guard.client.batch_execute(&setup).await {
            warn!(
                tenant = %descriptor.tenant_id,
                error = %err,
                "failed to apply tenant session state"
            );
            return Err(ServiceError::Permission(format!(
                "could not assume read-only role '{}'",
                descriptor.read_only_role
            )));
        }

        Ok(ScopedConnection { guard })
    }

    async fn pool_for(&self, descriptor: &ConnectionDescriptor) -> Result<PgPool> {
        if let Some(pool) = self.pools.read().get(&descriptor.tenant_id) {
            return Ok(pool.clone());
        }

        let manager = PgClientManager {
            config: self.pg_config(descriptor)?,
            tls: self.tls.clone(),
        };
        let max_size = descriptor
            .pool_size
            .unwrap_or(self.settings.default_max_size)
            .clamp(1, 8);
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(self.settings.acquire_timeout)
            .idle_timeout(Some(self.settings.idle_timeout))
            .build(manager)
            .await
            .map_err(|err| ServiceError::Connection(err.to_string()))?;

        info!(tenant = %descriptor.tenant_id, max_size, "created tenant connection pool");

        // A concurrent request may have created the pool first; keep that one.
        let mut pools = self.pools.write();
        Ok(pools
            .entry(descriptor.tenant_id.clone())
            .or_insert(pool)
            .clone())
    }

    fn pg_config(&self, descriptor: &ConnectionDescriptor) -> Result<PgConfig> {
        let secret = self.credentials.resolve(&descriptor.credential_ref)?;
        let mut config = PgConfig::new();
        config
            .host(&descriptor.host)
            .port(descriptor.port)
            .dbname(&descriptor.database)
            .user(&descriptor.user)
            .password(secret.expose_secret())
            .application_name("sqlgate")
            .connect_timeout(self.settings.connect_timeout);
        Ok(config)
    }
}

/// Double-quote an identifier for interpolation into session commands.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn build_tls(
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<MakeRustlsConnect> {
    let mut root_store = RootCertStore::empty();
    for cert in read_certs(root_cert)? {
        root_store.add(cert).map_err(|_| {
            ServiceError::Config(format!("invalid certificate in '{root_cert}'"))
        })?;
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let client_config = match (client_cert, client_key) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(read_certs(cert)?, read_key(key)?)
            .map_err(|err| ServiceError::Config(format!("client TLS config rejected: {err}")))?,
        _ => {
            return Err(ServiceError::Config(
                "SQLGATE_PG_SSL_CERT and SQLGATE_PG_SSL_KEY must both be set (or neither)".into(),
            ))
        }
    };

    Ok(MakeRustlsConnect::new(client_config))
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|err| ServiceError::Config(format!("failed to open '{path}': {err}")))?;
    let mut reader = BufReader::new(file);

    let mut chain = Vec::new();
    for cert in certs(&mut reader) {
        chain.push(cert.map_err(|_| {
            ServiceError::Config(format!("failed to parse certificates in '{path}'"))
        })?);
    }
    if chain.is_empty() {
        return Err(ServiceError::Config(format!(
            "'{path}' contained no certificates"
        )));
    }
    Ok(chain)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|err| ServiceError::Config(format!("failed to open '{path}': {err}")))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| ServiceError::Config(format!("failed to parse private key in '{path}'")))?
        .ok_or_else(|| ServiceError::Config(format!("'{path}' contained no private keys")))
}
