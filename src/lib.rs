pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod generate;
pub mod knowledge;
pub mod pool;
pub mod ratelimit;
pub mod server;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod tenant;
pub mod validator;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the sqlgate service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
