use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::config::ConfigBackend;
use crate::context::ModuleCtx;
use crate::dependencies::Dependencies;
use crate::unit::ModuleUnit;

/// What a unit hands to its dependants.
pub type Interface = Arc<dyn Any + Send + Sync>;

/// Behaviour of a node in the module tree.
///
/// The framework owns the lifecycle: it resolves configuration, drives children in
/// kind order, wires dependencies and propagates reconfigure / state-change messages.
/// Implementors only add their own work through these hooks; every hook defaults to
/// a no-op.
///
/// `load`, `initialize` and `start` run after the unit's children completed the same
/// verb. `stop`, `uninitialize` and `unload` run before the children are torn down.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Statically declared dependency names (sibling or ancestor services).
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Object handed to dependants. `None` exposes the module itself.
    fn interface(&self) -> Option<Interface> {
        None
    }

    /// AND-gate: when any dependency changes state, this unit's own enabled flag is
    /// set to "every dependency enabled".
    fn gated_on_dependencies(&self) -> bool {
        true
    }

    /// Configuration services return the backend they serve.
    fn as_config_backend(&self) -> Option<Arc<dyn ConfigBackend>> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    async fn load(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn initialize(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &ModuleCtx, _deps: &Dependencies) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn uninitialize(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unload(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// An ancestor's configuration changed.
    async fn on_parent_reconfigure(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// A resolved dependency's configuration changed.
    async fn on_dependency_reconfigure(
        &self,
        _ctx: &ModuleCtx,
        _dependency: &Arc<ModuleUnit>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A direct child's configuration changed.
    async fn on_submodule_reconfigure(
        &self,
        _ctx: &ModuleCtx,
        _sub: &Arc<ModuleUnit>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// An ancestor was enabled or disabled.
    async fn on_parent_state_change(&self, _ctx: &ModuleCtx, _enabled: bool) -> anyhow::Result<()> {
        Ok(())
    }

    /// A resolved dependency was enabled or disabled. Runs before the AND-gate.
    async fn on_dependency_state_change(
        &self,
        _ctx: &ModuleCtx,
        _dependency: &Arc<ModuleUnit>,
        _enabled: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A direct child was enabled or disabled. Runs before the child is started or
    /// stopped.
    async fn on_submodule_state_change(
        &self,
        _ctx: &ModuleCtx,
        _sub: &Arc<ModuleUnit>,
        _enabled: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Module behind the root unit when the host has nothing of its own to add.
#[derive(Debug, Default)]
pub struct Application;

impl Module for Application {
    fn as_any(&self) -> &dyn Any {
        self
    }
}
