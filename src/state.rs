use crate::{
    config::AppConfig, executor::ExecuteQuery, pool::PoolManager, session::CorrectionLoop,
    tenant::TenantResolver,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub tenants: Arc<dyn TenantResolver>,
    pub pools: Arc<PoolManager>,
    pub executor: Arc<dyn ExecuteQuery>,
    pub correction: Arc<CorrectionLoop>,
}
