use crate::{
    catalog,
    config::AppConfig,
    error::{ErrorDetail, Result, ServiceError},
    executor::{ExecutionContext, QueryExecutor},
    generate::{GenerationRequest, HttpSqlGenerator, SqlGenerator},
    knowledge::KnowledgeItem,
    pool::PoolManager,
    ratelimit::RateLimiter,
    session::{CorrectionLoop, MemoryLearningSink},
    state::AppState,
    tenant::{EnvCredentialStore, FileTenantResolver, TenantHandle},
};
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let tenants = Arc::new(FileTenantResolver::load(&config.tenants_file)?);
        let credentials = Arc::new(EnvCredentialStore);
        let pools = Arc::new(PoolManager::from_config(&config, credentials)?);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let executor = Arc::new(QueryExecutor::new(Arc::clone(&pools), limiter));

        let generator: Arc<dyn SqlGenerator> = match &config.generator_url {
            Some(url) => Arc::new(HttpSqlGenerator::new(url.clone(), config.generator_timeout)?),
            None => Arc::new(UnconfiguredGenerator),
        };
        let correction = Arc::new(CorrectionLoop::new(
            generator,
            Arc::new(MemoryLearningSink::default()),
        ));

        let config = Arc::new(config);
        let state = AppState {
            config: Arc::clone(&config),
            tenants,
            pools,
            executor,
            correction,
        };

        Ok(Self { config, state })
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "sqlgate listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/ask", post(ask))
        .route("/api/query", post(query))
        .route("/api/tables", get(list_tables))
        .route("/api/tables/describe", post(describe_table))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryToolRequest {
    pub tenant_id: String,
    #[serde(default = "default_identity")]
    pub identity: String,
    pub sql: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub tenant_id: String,
    #[serde(default = "default_identity")]
    pub identity: String,
    pub question: String,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeItem>,
    /// Schema context from the external metadata provider; built from the
    /// live catalog when absent.
    #[serde(default)]
    pub schema_metadata: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DescribeRequest {
    pub tenant_id: String,
    pub table: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListTablesParams {
    pub tenant_id: String,
}

fn default_identity() -> String {
    "api".to_string()
}

async fn query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryToolRequest>,
) -> Result<Response> {
    enforce_api_key(&headers, &state.config)?;
    let started = Instant::now();
    let tenant_id = request.tenant_id.clone();

    let outcome = async {
        let tenant = state.tenants.resolve(&request.tenant_id)?;
        let ctx = execution_context(tenant, request.identity);
        let result = state.executor.execute(&ctx, &request.sql).await?;
        serde_json::to_value(&result).map_err(|err| ServiceError::Internal(err.into()))
    }
    .await;

    Ok(respond(tenant_id, started, outcome))
}

async fn ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AskRequest>,
) -> Result<Response> {
    enforce_api_key(&headers, &state.config)?;
    let started = Instant::now();
    let tenant_id = request.tenant_id.clone();

    let outcome = async {
        let tenant = state.tenants.resolve(&request.tenant_id)?;
        let schema_metadata = match request.schema_metadata {
            Some(metadata) => metadata,
            None => {
                catalog::schema_context(&state.pools, &tenant.descriptor, &tenant.allow_list)
                    .await?
            }
        };
        let ctx = execution_context(tenant, request.identity);

        let outcome = state
            .correction
            .answer(
                state.executor.as_ref(),
                &ctx,
                &request.question,
                &schema_metadata,
                &request.knowledge,
            )
            .await;

        let result = outcome.result?;
        let mut data =
            serde_json::to_value(&result).map_err(|err| ServiceError::Internal(err.into()))?;
        data["attempts"] = serde_json::to_value(&outcome.attempts)
            .map_err(|err| ServiceError::Internal(err.into()))?;
        data["corrected"] = Value::Bool(outcome.corrected);
        Ok(data)
    }
    .await;

    Ok(respond(tenant_id, started, outcome))
}

async fn list_tables(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListTablesParams>,
) -> Result<Response> {
    enforce_api_key(&headers, &state.config)?;
    let started = Instant::now();
    let tenant_id = params.tenant_id.clone();

    let outcome = async {
        let tenant = state.tenants.resolve(&params.tenant_id)?;
        let tables =
            catalog::list_tables(&state.pools, &tenant.descriptor, &tenant.allow_list).await?;
        serde_json::to_value(json!({ "tables": tables }))
            .map_err(|err| ServiceError::Internal(err.into()))
    }
    .await;

    Ok(respond(tenant_id, started, outcome))
}

async fn describe_table(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DescribeRequest>,
) -> Result<Response> {
    enforce_api_key(&headers, &state.config)?;
    let started = Instant::now();
    let tenant_id = request.tenant_id.clone();

    let outcome = async {
        let tenant = state.tenants.resolve(&request.tenant_id)?;
        let description = catalog::describe_table(
            &state.pools,
            &tenant.descriptor,
            &tenant.allow_list,
            &request.table,
        )
        .await?;
        serde_json::to_value(&description).map_err(|err| ServiceError::Internal(err.into()))
    }
    .await;

    Ok(respond(tenant_id, started, outcome))
}

fn execution_context(tenant: TenantHandle, identity: String) -> ExecutionContext {
    ExecutionContext {
        descriptor: tenant.descriptor,
        allow_list: tenant.allow_list,
        identity,
    }
}

/// Shapes every tool response the same way: success or sanitized error, the
/// tenant scope it executed against, and wall-clock timing.
fn respond(tenant_id: String, started: Instant, outcome: Result<Value>) -> Response {
    let timing_ms = started.elapsed().as_millis();
    match outcome {
        Ok(data) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": data,
                "tenant_id": tenant_id,
                "timing_ms": timing_ms,
            })),
        )
            .into_response(),
        Err(err) => {
            let status = err.status();
            let retry_after = err.retry_after();
            let body = json!({
                "success": false,
                "error": ErrorDetail {
                    code: err.code(),
                    message: err.public_message(),
                },
                "tenant_id": tenant_id,
                "timing_ms": timing_ms,
            });
            let mut response = (status, Json(body)).into_response();
            if let Some(retry_after) = retry_after {
                if let Ok(value) = retry_after.as_secs().max(1).to_string().parse() {
                    response
                        .headers_mut()
                        .insert(http::header::RETRY_AFTER, value);
                }
            }
            response
        }
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}

/// Stands in when no generation endpoint is configured; direct SQL execution
/// keeps working, natural-language questions do not.
struct UnconfiguredGenerator;

#[async_trait]
impl SqlGenerator for UnconfiguredGenerator {
    async fn generate(&self, _request: &GenerationRequest<'_>) -> Result<String> {
        Err(ServiceError::Config(
            "SQLGATE_GENERATOR_URL is not configured".into(),
        ))
    }
}
