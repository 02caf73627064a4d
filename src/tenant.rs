use crate::error::{Result, ServiceError};
use secrecy::SecretString;
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    env, fs,
    path::Path,
    sync::Arc,
};
use tracing::info;

/// Everything the core needs to reach one tenant's database. Immutable once
/// resolved; the credential itself stays behind an opaque reference until the
/// pool manager asks the [`CredentialStore`] for it.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDescriptor {
    pub tenant_id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub user: String,
    pub credential_ref: String,
    pub read_only_role: String,
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    #[serde(default)]
    pub pool_size: Option<u32>,
}

const fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "public".to_string()
}

const fn default_max_rows() -> u64 {
    500
}

const fn default_statement_timeout_secs() -> u64 {
    30
}

/// Per-tenant table visibility. Exclusion always wins over membership; an
/// empty allowed set admits every table that is not excluded.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    allowed: HashSet<String>,
    excluded: HashSet<String>,
}

impl AllowList {
    pub fn new<I, J>(allowed: I, excluded: J) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        J: IntoIterator,
        J::Item: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|t| t.as_ref().to_lowercase())
                .collect(),
            excluded: excluded
                .into_iter()
                .map(|t| t.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn admits(&self, table: &str) -> bool {
        let normalized = table.to_lowercase();
        if self.excluded.contains(&normalized) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.contains(&normalized)
    }
}

#[derive(Clone)]
pub struct TenantHandle {
    pub descriptor: Arc<ConnectionDescriptor>,
    pub allow_list: AllowList,
}

/// Maps a tenant id to its connection descriptor and allow-list. The CRUD
/// that maintains tenants lives outside this service; sqlgate only reads.
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, tenant_id: &str) -> Result<TenantHandle>;
}

/// Resolves an opaque credential reference to the actual secret.
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, credential_ref: &str) -> Result<SecretString>;
}

/// Reads credentials from process environment variables named by the
/// reference. Resolution failures are configuration errors, not connection
/// errors: the tenant database was never contacted.
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn resolve(&self, credential_ref: &str) -> Result<SecretString> {
        env::var(credential_ref)
            .map(SecretString::new)
            .map_err(|_| {
                ServiceError::Config(format!(
                    "credential reference '{credential_ref}' is not resolvable"
                ))
            })
    }
}

#[derive(Debug, Deserialize)]
struct TenantEntry {
    #[serde(flatten)]
    descriptor: ConnectionDescriptor,
    #[serde(default)]
    allowed_tables: Vec<String>,
    #[serde(default)]
    excluded_tables: Vec<String>,
}

/// Tenant directory loaded once from a JSON file at startup.
pub struct FileTenantResolver {
    tenants: HashMap<String, TenantHandle>,
}

impl FileTenantResolver {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            ServiceError::Config(format!("failed to read tenants file {path:?}: {err}"))
        })?;
        let entries: Vec<TenantEntry> = serde_json::from_str(&raw).map_err(|err| {
            ServiceError::Config(format!("failed to parse tenants file {path:?}: {err}"))
        })?;

        let mut tenants = HashMap::new();
        for entry in entries {
            let handle = TenantHandle {
                allow_list: AllowList::new(&entry.allowed_tables, &entry.excluded_tables),
                descriptor: Arc::new(entry.descriptor),
            };
            tenants.insert(handle.descriptor.tenant_id.clone(), handle);
        }

        info!(count = tenants.len(), "loaded tenant directory");
        Ok(Self { tenants })
    }

    pub fn from_handles(handles: impl IntoIterator<Item = TenantHandle>) -> Self {
        Self {
            tenants: handles
                .into_iter()
                .map(|h| (h.descriptor.tenant_id.clone(), h))
                .collect(),
        }
    }
}

impl TenantResolver for FileTenantResolver {
    fn resolve(&self, tenant_id: &str) -> Result<TenantHandle> {
        self.tenants.get(tenant_id).cloned().ok_or_else(|| {
            ServiceError::InvalidRequest(format!("unknown tenant '{tenant_id}'"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn allow_list_exclusion_wins() {
        let list = AllowList::new(["orders", "customers"], ["customers"]);
        assert!(list.admits("orders"));
        assert!(list.admits("ORDERS"));
        assert!(!list.admits("customers"));
        assert!(!list.admits("products"));
    }

    #[test]
    fn empty_allowed_set_admits_everything_not_excluded() {
        let list = AllowList::new(Vec::<String>::new(), ["audit_log"]);
        assert!(list.admits("orders"));
        assert!(!list.admits("Audit_Log"));
    }

    #[test]
    fn unresolvable_credential_is_a_config_error() {
        let err = EnvCredentialStore
            .resolve("SQLGATE_TEST_MISSING_CREDENTIAL")
            .expect_err("credential should not resolve");
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(matches!(err, ServiceError::Config(_)));
    }
}
