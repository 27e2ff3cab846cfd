use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::dispatch::Dispatch;
use crate::engine::{BookingPolicy, Engine};
use crate::limits::*;
use crate::sweeper;

/// Settings shared by every tenant's engine and background tasks.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub policy: BookingPolicy,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            policy: BookingPolicy::default(),
            compact_threshold: 1_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// sweeper + compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
    dispatch: Dispatch,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings, dispatch: Dispatch) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
            dispatch,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Holding the entry serializes concurrent first connections to one tenant.
        let entry = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(e) => e,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            self.settings.policy.clone(),
            self.dispatch.clone(),
        )?);

        tokio::spawn(sweeper::run_sweeper(engine.clone(), self.settings.sweep_interval));
        tokio::spawn(sweeper::run_compactor(engine.clone(), self.settings.compact_threshold));

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant = %safe_name, "tenant loaded");
        Ok(engine)
    }
}
