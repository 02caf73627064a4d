//! Fixed-window query quotas. Checked before validation so a statement the
//! validator rejects still consumes quota.

use crate::error::{Result, ServiceError};
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration, time::Instant};

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window: Duration,
    /// Queries allowed per (identity, tenant) pair per window.
    pub identity_limit: u32,
    /// Queries allowed per tenant per window across all identities.
    pub tenant_limit: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            identity_limit: 30,
            tenant_limit: 120,
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    settings: RateLimitSettings,
    identities: Mutex<HashMap<(String, String), Window>>,
    tenants: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            identities: Mutex::new(HashMap::new()),
            tenants: Mutex::new(HashMap::new()),
        }
    }

    /// Admits or denies one query. Both counters move together on admission;
    /// a denial reports the longer remaining window of the two so the caller
    /// backs off far enough to actually get through.
    pub fn check_and_increment(&self, identity: &str, tenant: &str) -> Result<()> {
        let now = Instant::now();
        let window = self.settings.window;

        let mut identities = self.identities.lock();
        let mut tenants = self.tenants.lock();

        let identity_window = identities
            .entry((identity.to_string(), tenant.to_string()))
            .or_insert_with(|| Window { started: now, count: 0 });
        reset_if_elapsed(identity_window, now, window);

        let tenant_window = tenants
            .entry(tenant.to_string())
            .or_insert_with(|| Window { started: now, count: 0 });
        reset_if_elapsed(tenant_window, now, window);

        let identity_blocked = identity_window.count >= self.settings.identity_limit;
        let tenant_blocked = tenant_window.count >= self.settings.tenant_limit;

        if identity_blocked || tenant_blocked {
            let mut retry_after = Duration::ZERO;
            if identity_blocked {
                retry_after = retry_after.max(remaining(identity_window, now, window));
            }
            if tenant_blocked {
                retry_after = retry_after.max(remaining(tenant_window, now, window));
            }
            return Err(ServiceError::RateLimited { retry_after });
        }

        identity_window.count += 1;
        tenant_window.count += 1;
        Ok(())
    }
}

fn reset_if_elapsed(window: &mut Window, now: Instant, span: Duration) {
    if now.duration_since(window.started) >= span {
        window.started = now;
        window.count = 0;
    }
}

fn remaining(window: &Window, now: Instant, span: Duration) -> Duration {
    span.saturating_sub(now.duration_since(window.started))
}
