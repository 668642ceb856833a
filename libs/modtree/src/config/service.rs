use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use super::{ConfigBackend, ConfigEvent};
use crate::context::ModuleCtx;
use crate::contracts::{Interface, Module};
use crate::dependencies::Dependencies;
use crate::error::{error_chain, ModuleError};
use crate::lifecycle::TaskLifecycle;
use crate::unit::ModuleUnit;

/// Registered name of the built-in configuration service.
pub const CONFIGURATION_SERVICE: &str = "Configuration";

const PUMP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Service that exposes a [`ConfigBackend`] to the tree.
///
/// Its loader loads it before every other service and uses its backend for the rest of
/// the pass. When it sits directly under the root it also pumps backend events to the
/// addressed units.
pub struct ConfigurationService {
    backend: Arc<dyn ConfigBackend>,
    pump: TaskLifecycle,
}

impl ConfigurationService {
    pub fn new(backend: Arc<dyn ConfigBackend>) -> Self {
        Self {
            backend,
            pump: TaskLifecycle::new(),
        }
    }

    pub fn backend(&self) -> Arc<dyn ConfigBackend> {
        self.backend.clone()
    }

    /// Whether the event pump is currently running.
    pub fn is_pumping(&self) -> bool {
        self.pump.is_running()
    }
}

#[async_trait]
impl Module for ConfigurationService {
    /// Dependants get `Arc<Arc<dyn ConfigBackend>>` via `Dependencies::get`.
    fn interface(&self) -> Option<Interface> {
        Some(Arc::new(self.backend.clone()))
    }

    fn as_config_backend(&self) -> Option<Arc<dyn ConfigBackend>> {
        Some(self.backend.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn start(&self, ctx: &ModuleCtx, _deps: &Dependencies) -> anyhow::Result<()> {
        let Some(unit) = ctx.unit() else {
            return Ok(());
        };
        let Some(root) = unit.parent().filter(|p| p.parent().is_none()) else {
            tracing::debug!(path = %unit.path(), "not attached to the root; event pump disabled");
            return Ok(());
        };

        let root: Weak<ModuleUnit> = Arc::downgrade(&root);
        let mut events = self.backend.subscribe();
        self.pump
            .start(ctx.cancellation_token().child_token(), move |cancel| async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        ev = events.recv() => ev,
                    };
                    match event {
                        Ok(event) => {
                            let Some(root) = root.upgrade() else {
                                return Ok(());
                            };
                            if let Err(e) = dispatch_event(&root, event).await {
                                tracing::error!(error = %error_chain(&e), "config event dispatch failed");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "config event pump lagged");
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }
            })?;
        tracing::info!("configuration event pump started");
        Ok(())
    }

    async fn stop(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.pump.stop(PUMP_STOP_TIMEOUT).await;
        Ok(())
    }
}

/// Route one backend notification to the unit at `event.path()` below `root`.
pub async fn dispatch_event(root: &Arc<ModuleUnit>, event: ConfigEvent) -> Result<(), ModuleError> {
    let Some(unit) = root.find(event.path()) else {
        tracing::warn!(path = %event.path(), "config event for unknown module dropped");
        return Ok(());
    };
    tracing::debug!(path = %unit.path(), ?event, "dispatching config event");
    match event {
        ConfigEvent::NewConfig { configuration, .. }
        | ConfigEvent::UpdateConfig { configuration, .. } => unit.reconfigure(configuration).await,
        ConfigEvent::DeleteConfig { .. } => {
            unit.replace_config(Value::Object(Default::default()))
                .await
        }
        ConfigEvent::UpdateState { enabled, .. } => unit.change_state(enabled).await,
    }
}
