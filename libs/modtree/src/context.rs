use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

use crate::unit::ModuleUnit;

/// Per-call view of a unit handed to every hook.
#[derive(Clone)]
pub struct ModuleCtx {
    pub(crate) unit: Weak<ModuleUnit>,
    pub(crate) module_name: Arc<str>,
    pub(crate) module_path: Arc<str>,
    pub(crate) cancellation_token: CancellationToken,
}

impl ModuleCtx {
    pub(crate) fn for_unit(unit: &Arc<ModuleUnit>) -> Self {
        Self {
            unit: Arc::downgrade(unit),
            module_name: Arc::from(unit.name()),
            module_path: Arc::from(unit.path()),
            cancellation_token: unit.cancellation_token(),
        }
    }

    // ---- public read-only API for modules ----

    /// The unit this context belongs to, while it is alive.
    pub fn unit(&self) -> Option<Arc<ModuleUnit>> {
        self.unit.upgrade()
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// Cancelled when the unit stops.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn base_path(&self) -> Option<PathBuf> {
        self.unit().map(|u| u.base_path().to_path_buf())
    }

    pub fn is_enabled(&self) -> bool {
        self.unit().is_some_and(|u| u.is_enabled())
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<serde_json::Value> {
        self.unit()
            .map(|u| u.config())
            .unwrap_or_else(|| Arc::new(serde_json::Value::Null))
    }

    /// Best-effort: deserialize the unit's config into `T`, fallback to `T::default()`
    /// if the config is missing or invalid.
    pub fn module_config<T: DeserializeOwned + Default>(&self) -> T {
        serde_json::from_value::<T>(self.config().as_ref().clone()).unwrap_or_default()
    }

    /// Strict: deserialize the unit's config into `T`, returning a pathful error on failure.
    pub fn module_config_required<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let unit = self
            .unit()
            .ok_or_else(|| anyhow::anyhow!("unit '{}' is gone", self.module_name))?;
        let cfg = unit.config();
        serde_json::from_value(cfg.as_ref().clone())
            .map_err(|e| anyhow::anyhow!("invalid {} config: {}", self.module_path_or_name(), e))
    }

    /// Spawn background work owned by this unit. A failure is logged under the
    /// unit's name and goes no further.
    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = self.module_name.clone();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::error!(module = %name, error = %format!("{e:#}"), "background task failed");
            }
        })
    }

    fn module_path_or_name(&self) -> &str {
        if self.module_path.is_empty() {
            &self.module_name
        } else {
            &self.module_path
        }
    }
}

impl std::fmt::Debug for ModuleCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCtx")
            .field("module_name", &self.module_name)
            .field("module_path", &self.module_path)
            .finish()
    }
}
