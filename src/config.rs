use crate::{pool::PoolSettings, ratelimit::RateLimitSettings};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub tenants_file: PathBuf,
    pub api_key: Option<String>,
    pub rate_limit: RateLimitSettings,
    pub pool: PoolSettings,
    pub generator_url: Option<String>,
    pub generator_timeout: Duration,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    sqlgate_listen_addr: Option<String>,
    #[serde(default)]
    sqlgate_listen_host: Option<String>,
    #[serde(default)]
    sqlgate_listen_port: Option<u16>,
    sqlgate_tenants_file: Option<String>,
    #[serde(default)]
    sqlgate_api_key: Option<String>,
    #[serde(default = "default_rate_window_secs")]
    sqlgate_rate_window_secs: u64,
    #[serde(default = "default_identity_limit")]
    sqlgate_identity_limit: u32,
    #[serde(default = "default_tenant_limit")]
    sqlgate_tenant_limit: u32,
    #[serde(default = "default_pool_size")]
    sqlgate_pool_size: u32,
    #[serde(default = "default_pool_acquire_ms")]
    sqlgate_pool_acquire_ms: u64,
    #[serde(default = "default_pool_idle_secs")]
    sqlgate_pool_idle_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    sqlgate_connect_timeout_secs: u64,
    #[serde(default)]
    sqlgate_generator_url: Option<String>,
    #[serde(default = "default_generator_timeout_ms")]
    sqlgate_generator_timeout_ms: u64,
    #[serde(default)]
    sqlgate_pg_ssl_root_cert: Option<String>,
    #[serde(default)]
    sqlgate_pg_ssl_cert: Option<String>,
    #[serde(default)]
    sqlgate_pg_ssl_key: Option<String>,
}

const fn default_rate_window_secs() -> u64 {
    60
}

const fn default_identity_limit() -> u32 {
    30
}

const fn default_tenant_limit() -> u32 {
    120
}

const fn default_pool_size() -> u32 {
    4
}

const fn default_pool_acquire_ms() -> u64 {
    5_000
}

const fn default_pool_idle_secs() -> u64 {
    300
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_generator_timeout_ms() -> u64 {
    20_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse SQLGATE_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.sqlgate_listen_addr,
            raw.sqlgate_listen_host,
            raw.sqlgate_listen_port,
        )?;

        let tenants_file = raw
            .sqlgate_tenants_file
            .context("SQLGATE_TENANTS_FILE must be set")?;

        Ok(Self {
            listen_addr,
            tenants_file: PathBuf::from(tenants_file),
            api_key: raw.sqlgate_api_key,
            rate_limit: RateLimitSettings {
                window: Duration::from_secs(raw.sqlgate_rate_window_secs.max(1)),
                identity_limit: raw.sqlgate_identity_limit.max(1),
                tenant_limit: raw.sqlgate_tenant_limit.max(raw.sqlgate_identity_limit),
            },
            pool: PoolSettings {
                default_max_size: raw.sqlgate_pool_size.clamp(1, 8),
                acquire_timeout: Duration::from_millis(raw.sqlgate_pool_acquire_ms.max(100)),
                idle_timeout: Duration::from_secs(raw.sqlgate_pool_idle_secs.max(1)),
                connect_timeout: Duration::from_secs(raw.sqlgate_connect_timeout_secs.max(1)),
            },
            generator_url: raw.sqlgate_generator_url,
            generator_timeout: Duration::from_millis(raw.sqlgate_generator_timeout_ms.max(100)),
            pg_ssl_root_cert: raw.sqlgate_pg_ssl_root_cert,
            pg_ssl_cert: raw.sqlgate_pg_ssl_cert,
            pg_ssl_key: raw.sqlgate_pg_ssl_key,
        })
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid SQLGATE_LISTEN_ADDR value")?
            .next()
            .context("SQLGATE_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid sqlgate listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
