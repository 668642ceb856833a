//! A node of the module tree.
//!
//! The unit owns the framework side of the lifecycle: its phase register,
//! configuration snapshot, enabled flag, dependency bindings and its loader (which
//! owns the children). The [`Module`] it wraps only contributes hooks.

use arc_swap::ArcSwap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::catalog::{Catalog, Constructed};
use crate::config::{deep_merge, ConfigBackend};
use crate::context::ModuleCtx;
use crate::contracts::{Application, Interface, Module};
use crate::dependencies::{Dependencies, DependencyList};
use crate::error::{LoaderError, ModuleError, Stage};
use crate::kind::ModuleKind;
use crate::loader::{resolve_dependencies, LoaderProfile, ModuleLoader};
use crate::phase::{Phase, PhaseState, Transition, TransitionDenied, Verb};
use crate::status::PhaseReport;

type VerbResult = Result<PhaseReport, ModuleError>;

/// Initialize / start outcomes of a self-bootstrapping unit, replayed once.
#[derive(Default)]
struct BootstrapCache {
    initialize: Option<PhaseReport>,
    start: Option<PhaseReport>,
}

pub struct ModuleUnit {
    name: String,
    kind: Option<ModuleKind>,
    path: String,
    base_path: PathBuf,
    parent: Weak<ModuleUnit>,
    catalog: Arc<Catalog>,
    module: Arc<dyn Module>,
    interface: Interface,
    initial_config: Value,
    config: ArcSwap<Value>,
    enabled: AtomicBool,
    configured: AtomicBool,
    dependency_names: RwLock<IndexSet<String>>,
    dependants: RwLock<Vec<Weak<ModuleUnit>>>,
    dependencies: Dependencies,
    backend: RwLock<Option<Arc<dyn ConfigBackend>>>,
    loader: ModuleLoader,
    phase: PhaseState,
    bootstrap: Mutex<BootstrapCache>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for ModuleUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleUnit")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("phase", &self.phase())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl ModuleUnit {
    /// Root of a tree. `config` is the root's initial configuration; its `paths`
    /// section names the directories (under `base_path`) holding each kind.
    pub fn root(catalog: Arc<Catalog>, base_path: impl Into<PathBuf>, config: Value) -> Arc<Self> {
        Self::root_with(
            "Application",
            Arc::new(Application),
            catalog,
            base_path,
            config,
        )
    }

    /// Root backed by a host-supplied module.
    pub fn root_with(
        name: impl Into<String>,
        module: Arc<dyn Module>,
        catalog: Arc<Catalog>,
        base_path: impl Into<PathBuf>,
        config: Value,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            Weak::new(),
            None,
            name.into(),
            String::new(),
            Constructed::new(module),
            catalog,
            base_path.into(),
            config,
            Vec::new(),
        ))
    }

    pub(crate) fn child(
        parent: &Arc<ModuleUnit>,
        kind: ModuleKind,
        name: String,
        constructed: Constructed,
        base_path: PathBuf,
        initial_config: Value,
        dependencies: Vec<String>,
    ) -> Arc<Self> {
        let path = if parent.path.is_empty() {
            format!("{}/{}", kind.collection(), name)
        } else {
            format!("{}/{}/{}", parent.path, kind.collection(), name)
        };
        Arc::new(Self::build(
            Arc::downgrade(parent),
            Some(kind),
            name,
            path,
            constructed,
            parent.catalog.clone(),
            base_path,
            initial_config,
            dependencies,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        parent: Weak<ModuleUnit>,
        kind: Option<ModuleKind>,
        name: String,
        path: String,
        constructed: Constructed,
        catalog: Arc<Catalog>,
        base_path: PathBuf,
        initial_config: Value,
        extra_dependencies: Vec<String>,
    ) -> Self {
        let mut dependency_names: IndexSet<String> =
            constructed.module.dependencies().into_iter().collect();
        dependency_names.extend(extra_dependencies);
        Self {
            loader: ModuleLoader::new(LoaderProfile::for_unit(kind, &name)),
            name,
            kind,
            path,
            base_path,
            parent,
            catalog,
            module: constructed.module,
            interface: constructed.interface,
            config: ArcSwap::from_pointee(initial_config.clone()),
            initial_config,
            enabled: AtomicBool::new(true),
            configured: AtomicBool::new(true),
            dependency_names: RwLock::new(dependency_names),
            dependants: RwLock::new(Vec::new()),
            dependencies: Dependencies::default(),
            backend: RwLock::new(None),
            phase: PhaseState::new(),
            bootstrap: Mutex::new(BootstrapCache::default()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    // ---- accessors -------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` for the root.
    pub fn kind(&self) -> Option<ModuleKind> {
        self.kind
    }

    /// Slash-separated address from the root; empty for the root itself.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn parent(&self) -> Option<Arc<ModuleUnit>> {
        self.parent.upgrade()
    }

    /// Walk up to the root of the tree.
    pub fn tree_root(self: &Arc<Self>) -> Arc<ModuleUnit> {
        let mut cur = self.clone();
        while let Some(p) = cur.parent() {
            cur = p;
        }
        cur
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    /// The wrapped module as its concrete type.
    pub fn module_as<T: Any>(&self) -> Option<&T> {
        self.module.as_any().downcast_ref::<T>()
    }

    pub fn interface(&self) -> Interface {
        self.interface.clone()
    }

    pub fn config(&self) -> Arc<Value> {
        self.config.load_full()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enabled flag as last set by the backend or an explicit
    /// [`change_state`](Self::change_state). [`is_enabled`](Self::is_enabled) can
    /// only be lower: a disabled parent or dependency switches the unit off too.
    pub fn is_configured_enabled(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> Phase {
        self.phase.current()
    }

    /// Whether a lifecycle verb is currently running on this unit.
    pub fn is_busy(&self) -> bool {
        self.phase.is_busy()
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    pub fn dependency_names(&self) -> Vec<String> {
        self.dependency_names.read().iter().cloned().collect()
    }

    /// Units that resolved this one as a dependency and are still alive.
    pub fn dependants(&self) -> Vec<Arc<ModuleUnit>> {
        self.dependants
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    /// Backend this unit was loaded with.
    pub fn backend(&self) -> Option<Arc<dyn ConfigBackend>> {
        self.backend.read().clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// `locale` from this unit's configuration, else the nearest ancestor's.
    pub fn locale(&self) -> Option<String> {
        if let Some(l) = self.config().get("locale").and_then(Value::as_str) {
            return Some(l.to_string());
        }
        self.parent().and_then(|p| p.locale())
    }

    pub fn children(&self, kind: ModuleKind) -> Option<Vec<Arc<ModuleUnit>>> {
        self.loader.collection(kind)
    }

    /// Descendant at `path` (`services/Foo/utilities/Bar`), relative to this unit.
    pub fn find(self: &Arc<Self>, path: &str) -> Option<Arc<ModuleUnit>> {
        let mut cur = self.clone();
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        while let Some(collection) = segments.next() {
            let kind = ModuleKind::from_collection(collection)?;
            let name = segments.next()?;
            cur = cur.loader.child(kind, name)?;
        }
        Some(cur)
    }

    /// Accumulate dependency names; duplicates are ignored.
    pub fn add_dependencies(&self, names: impl Into<DependencyList>) {
        let names = names.into().names();
        self.dependency_names.write().extend(names);
    }

    pub(crate) fn kind_root(&self, kind: ModuleKind) -> Option<PathBuf> {
        let config = self.config();
        let rel = config.get("paths")?.get(kind.collection())?.as_str()?;
        Some(self.base_path.join(rel))
    }

    pub(crate) fn add_dependant(&self, unit: &Arc<ModuleUnit>) {
        let mut dependants = self.dependants.write();
        dependants.retain(|w| w.strong_count() > 0);
        if !dependants
            .iter()
            .any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(unit)))
        {
            dependants.push(Arc::downgrade(unit));
        }
    }

    // ---- lifecycle verbs -------------------------------------------------------

    /// Resolve configuration through `backend`, load the children, then run the
    /// module's `load` hook.
    ///
    /// A self-bootstrapping unit binds its dependencies up front, since it starts
    /// before its siblings exist: only services of its ancestors can be found.
    pub fn load(
        self: &Arc<Self>,
        backend: Option<Arc<dyn ConfigBackend>>,
    ) -> BoxFuture<'_, VerbResult> {
        let span = tracing::debug_span!("load", module = %self.name, path = %self.path);
        Box::pin(
            async move {
                if self.loader.profile().self_bootstraps() && self.phase() == Phase::Unloaded {
                    if let Some(parent) = self.parent() {
                        resolve_dependencies(&parent, self)?;
                    }
                }
                let result = {
                    let Some(guard) = self.claim(Verb::Load)? else {
                        return Ok(PhaseReport::default());
                    };
                    self.resolve_config(backend.as_ref()).await?;
                    *self.backend.write() = backend.clone();

                    let report = self
                        .loader
                        .load(self, backend)
                        .await
                        .map_err(|e| ModuleError::loader(&self.name, Verb::Load, e))?;

                    let ctx = ModuleCtx::for_unit(self);
                    if let Err(e) = self.invoke(Verb::Load.as_str(), self.module.load(&ctx)).await {
                        self.loader.unload(self).await;
                        return Err(e);
                    }
                    guard.commit();
                    self.finish(Verb::Load, report)
                };

                if self.loader.profile().self_bootstraps() {
                    if let Err(e) = &result {
                        if !e.is_partial() {
                            return result;
                        }
                    }
                    self.bootstrap().await?;
                }
                result
            }
            .instrument(span),
        )
    }

    pub fn initialize(self: &Arc<Self>) -> BoxFuture<'_, VerbResult> {
        let span = tracing::debug_span!("initialize", module = %self.name, path = %self.path);
        Box::pin(
            async move {
                if let Some(replayed) = self.replay(Verb::Initialize) {
                    return replayed;
                }
                let Some(guard) = self.claim(Verb::Initialize)? else {
                    return Ok(PhaseReport::default());
                };
                let report = self.loader.initialize(self).await;

                let ctx = ModuleCtx::for_unit(self);
                if let Err(e) = self
                    .invoke(Verb::Initialize.as_str(), self.module.initialize(&ctx))
                    .await
                {
                    self.loader.uninitialize(self).await;
                    return Err(e);
                }
                guard.commit();
                self.finish(Verb::Initialize, report)
            }
            .instrument(span),
        )
    }

    /// Start the children, then the module with its bound dependencies.
    ///
    /// The unit is forced enabled while it starts. If it should not be running
    /// (disabled itself, under a disabled parent or gated by a disabled
    /// dependency) the flag is lowered afterwards through the state-change path,
    /// so its parent stops it again.
    pub fn start(self: &Arc<Self>) -> BoxFuture<'_, VerbResult> {
        let span = tracing::debug_span!("start", module = %self.name, path = %self.path);
        Box::pin(
            async move {
                if let Some(replayed) = self.replay(Verb::Start) {
                    return replayed;
                }
                let result = {
                    let Some(guard) = self.claim(Verb::Start)? else {
                        return Ok(PhaseReport::default());
                    };
                    let actual = self.enabled.swap(true, Ordering::SeqCst);
                    self.renew_cancellation();

                    let report = self.loader.start(self).await;

                    let ctx = ModuleCtx::for_unit(self);
                    if let Err(e) = self
                        .invoke(
                            Verb::Start.as_str(),
                            self.module.start(&ctx, &self.dependencies),
                        )
                        .await
                    {
                        self.loader.stop(self).await;
                        self.enabled.store(actual, Ordering::SeqCst);
                        return Err(e);
                    }
                    guard.commit();
                    tracing::info!(module = %self.name, path = %self.path, "module started");
                    self.finish(Verb::Start, report)
                };

                if !self.desired_state() {
                    self.propagate_state(false).await?;
                }
                result
            }
            .instrument(span),
        )
    }

    /// Run the module's `stop` hook, then stop the children in reverse start order.
    pub fn stop(self: &Arc<Self>) -> BoxFuture<'_, VerbResult> {
        let span = tracing::debug_span!("stop", module = %self.name, path = %self.path);
        Box::pin(
            async move {
                let Some(guard) = self.claim(Verb::Stop)? else {
                    return Ok(PhaseReport::default());
                };
                let ctx = ModuleCtx::for_unit(self);
                let hook = self.invoke(Verb::Stop.as_str(), self.module.stop(&ctx)).await;
                self.cancel.lock().cancel();
                let report = self.loader.stop(self).await;
                guard.commit();
                tracing::info!(module = %self.name, path = %self.path, "module stopped");
                hook?;
                self.finish(Verb::Stop, report)
            }
            .instrument(span),
        )
    }

    pub fn uninitialize(self: &Arc<Self>) -> BoxFuture<'_, VerbResult> {
        let span = tracing::debug_span!("uninitialize", module = %self.name, path = %self.path);
        Box::pin(
            async move {
                let Some(guard) = self.claim(Verb::Uninitialize)? else {
                    return Ok(PhaseReport::default());
                };
                let ctx = ModuleCtx::for_unit(self);
                let hook = self
                    .invoke(Verb::Uninitialize.as_str(), self.module.uninitialize(&ctx))
                    .await;
                let report = self.loader.uninitialize(self).await;
                guard.commit();
                hook?;
                self.finish(Verb::Uninitialize, report)
            }
            .instrument(span),
        )
    }

    /// Tear down the children, drop the collections, bindings and configuration.
    pub fn unload(self: &Arc<Self>) -> BoxFuture<'_, VerbResult> {
        let span = tracing::debug_span!("unload", module = %self.name, path = %self.path);
        Box::pin(
            async move {
                let Some(guard) = self.claim(Verb::Unload)? else {
                    return Ok(PhaseReport::default());
                };
                let ctx = ModuleCtx::for_unit(self);
                let hook = self.invoke(Verb::Unload.as_str(), self.module.unload(&ctx)).await;
                let report = self.loader.unload(self).await;

                self.config.store(Arc::new(Value::Object(Default::default())));
                self.dependencies.clear();
                self.dependants.write().clear();
                *self.backend.write() = None;
                *self.bootstrap.lock() = BootstrapCache::default();
                guard.commit();
                hook?;
                self.finish(Verb::Unload, report)
            }
            .instrument(span),
        )
    }

    // ---- state change ----------------------------------------------------------

    /// Record `enabled` as this unit's configured state and propagate the resulting
    /// flag: parent first, then every child recursively, then every dependant. A
    /// repeated call with the same value does nothing.
    ///
    /// Enabling only takes effect while the parent is enabled and, for a gated
    /// unit, every bound dependency is.
    pub fn change_state(self: &Arc<Self>, enabled: bool) -> BoxFuture<'_, Result<(), ModuleError>> {
        self.configured.store(enabled, Ordering::SeqCst);
        let effective = enabled && self.desired_state();
        self.propagate_state(effective)
    }

    /// Whether this unit should be running right now.
    fn desired_state(&self) -> bool {
        self.is_configured_enabled()
            && self.parent().map_or(true, |p| p.is_enabled())
            && (!self.module.gated_on_dependencies() || self.dependencies.all_enabled())
    }

    fn propagate_state(self: &Arc<Self>, enabled: bool) -> BoxFuture<'_, Result<(), ModuleError>> {
        Box::pin(async move {
            if self.enabled.swap(enabled, Ordering::SeqCst) == enabled {
                return Ok(());
            }
            tracing::info!(module = %self.name, path = %self.path, enabled, "module state changed");

            if let Some(parent) = self.parent() {
                parent
                    .submodule_state_changed(self, enabled)
                    .await
                    .map_err(|e| self.change_state_error(Stage::Parent, e))?;
            }

            let children = self.loader.all_children();
            first_error(join_all(children.iter().map(|c| c.parent_state_changed(enabled))).await)
                .map_err(|e| self.change_state_error(Stage::SubModules, e))?;

            let dependants = self.dependants();
            first_error(
                join_all(
                    dependants
                        .iter()
                        .map(|d| d.dependency_state_changed(self, enabled)),
                )
                .await,
            )
            .map_err(|e| self.change_state_error(Stage::Dependants, e))
        })
    }

    async fn parent_state_changed(self: &Arc<Self>, enabled: bool) -> Result<(), ModuleError> {
        let ctx = ModuleCtx::for_unit(self);
        self.invoke(
            "parentStateChange",
            self.module.on_parent_state_change(&ctx, enabled),
        )
        .await?;
        self.propagate_state(enabled && self.desired_state()).await
    }

    /// AND-gate: a gated unit runs only while all its dependencies are enabled. It
    /// never comes back on when its configured state is off.
    async fn dependency_state_changed(
        self: &Arc<Self>,
        dependency: &Arc<ModuleUnit>,
        enabled: bool,
    ) -> Result<(), ModuleError> {
        let ctx = ModuleCtx::for_unit(self);
        self.invoke(
            "dependencyStateChange",
            self.module
                .on_dependency_state_change(&ctx, dependency, enabled),
        )
        .await?;
        if self.module.gated_on_dependencies() {
            self.propagate_state(self.desired_state()).await?;
        }
        Ok(())
    }

    async fn submodule_state_changed(
        self: &Arc<Self>,
        sub: &Arc<ModuleUnit>,
        enabled: bool,
    ) -> Result<(), ModuleError> {
        let ctx = ModuleCtx::for_unit(self);
        self.invoke(
            "subModuleStateChange",
            self.module.on_submodule_state_change(&ctx, sub, enabled),
        )
        .await?;
        self.loader.apply_child_state(self, sub, enabled).await
    }

    fn change_state_error(&self, stage: Stage, source: ModuleError) -> ModuleError {
        ModuleError::ChangeState {
            unit: self.name.clone(),
            stage,
            source: Box::new(source),
        }
    }

    // ---- reconfiguration -------------------------------------------------------

    /// Deep-merge `delta` into the configuration and propagate the change: parent
    /// first, then every descendant, then every dependant. Nothing happens when the
    /// merge leaves the configuration unchanged.
    pub fn reconfigure(self: &Arc<Self>, delta: Value) -> BoxFuture<'_, Result<(), ModuleError>> {
        Box::pin(async move {
            let merged = deep_merge(&self.config(), &delta);
            self.apply_config(merged).await
        })
    }

    /// Swap in `config` wholesale and propagate like [`reconfigure`](Self::reconfigure).
    pub(crate) fn replace_config(
        self: &Arc<Self>,
        config: Value,
    ) -> BoxFuture<'_, Result<(), ModuleError>> {
        Box::pin(self.apply_config(config))
    }

    async fn apply_config(self: &Arc<Self>, next: Value) -> Result<(), ModuleError> {
        if *self.config() == next {
            return Ok(());
        }
        self.config.store(Arc::new(next));
        tracing::info!(module = %self.name, path = %self.path, "module reconfigured");

        if let Some(parent) = self.parent() {
            let ctx = ModuleCtx::for_unit(&parent);
            parent
                .invoke(
                    "subModuleReconfigure",
                    parent.module.on_submodule_reconfigure(&ctx, self),
                )
                .await
                .map_err(|e| self.reconfigure_error(Stage::Parent, e))?;
        }

        let children = self.loader.all_children();
        first_error(join_all(children.iter().map(|c| c.parent_reconfigured())).await)
            .map_err(|e| self.reconfigure_error(Stage::SubModules, e))?;

        let dependants = self.dependants();
        first_error(
            join_all(dependants.iter().map(|d| async move {
                let ctx = ModuleCtx::for_unit(d);
                d.invoke(
                    "dependencyReconfigure",
                    d.module.on_dependency_reconfigure(&ctx, self),
                )
                .await
            }))
            .await,
        )
        .map_err(|e| self.reconfigure_error(Stage::Dependants, e))
    }

    fn parent_reconfigured(self: &Arc<Self>) -> BoxFuture<'_, Result<(), ModuleError>> {
        Box::pin(async move {
            let ctx = ModuleCtx::for_unit(self);
            self.invoke(
                "parentReconfigure",
                self.module.on_parent_reconfigure(&ctx),
            )
            .await?;
            let children = self.loader.all_children();
            first_error(join_all(children.iter().map(|c| c.parent_reconfigured())).await)
                .map_err(|e| self.reconfigure_error(Stage::SubModules, e))
        })
    }

    fn reconfigure_error(&self, stage: Stage, source: ModuleError) -> ModuleError {
        ModuleError::Reconfigure {
            unit: self.name.clone(),
            stage,
            source: Box::new(source),
        }
    }

    // ---- persistence -----------------------------------------------------------

    /// Persist `config` through the backend. The backend's change notification is
    /// what eventually reconfigures the unit.
    pub async fn save_config(&self, config: &Value) -> Result<(), ModuleError> {
        let backend = self.require_backend("saveConfig")?;
        backend
            .save_config(self, config)
            .await
            .map_err(|source| self.backend_error("saveConfig", source))
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ModuleError> {
        let backend = self.require_backend("setModuleState")?;
        backend
            .set_module_state(self, enabled)
            .await
            .map_err(|source| self.backend_error("setModuleState", source))
    }

    /// Enabled flag as the backend currently stores it.
    pub async fn stored_state(&self) -> Result<bool, ModuleError> {
        let backend = self.require_backend("getModuleState")?;
        backend
            .get_module_state(self)
            .await
            .map_err(|source| self.backend_error("getModuleState", source))
    }

    fn require_backend(&self, verb: &'static str) -> Result<Arc<dyn ConfigBackend>, ModuleError> {
        self.backend().ok_or_else(|| ModuleError::NoBackend {
            unit: self.name.clone(),
            verb,
        })
    }

    fn backend_error(&self, verb: &'static str, source: anyhow::Error) -> ModuleError {
        ModuleError::Backend {
            unit: self.name.clone(),
            verb,
            source,
        }
    }

    // ---- internals -------------------------------------------------------------

    fn claim(&self, verb: Verb) -> Result<Option<Transition<'_>>, ModuleError> {
        match self.phase.begin(verb) {
            Ok(t) => Ok(Some(t)),
            Err(TransitionDenied::Satisfied) => {
                tracing::trace!(module = %self.name, %verb, "already satisfied");
                Ok(None)
            }
            Err(TransitionDenied::InFlight) => Err(ModuleError::PhaseInProgress {
                unit: self.name.clone(),
                verb,
            }),
            Err(TransitionDenied::NotAllowed(phase)) => Err(ModuleError::InvalidTransition {
                unit: self.name.clone(),
                verb,
                phase,
            }),
        }
    }

    async fn resolve_config(
        &self,
        backend: Option<&Arc<dyn ConfigBackend>>,
    ) -> Result<(), ModuleError> {
        let (configuration, enabled) = match backend {
            Some(b) => {
                let loaded = b
                    .load_config(self)
                    .await
                    .map_err(|source| ModuleError::ConfigLoad {
                        unit: self.name.clone(),
                        source,
                    })?;
                (
                    deep_merge(&self.initial_config, &loaded.configuration),
                    loaded.enabled,
                )
            }
            None => (self.initial_config.clone(), true),
        };
        self.config.store(Arc::new(configuration));
        self.enabled.store(enabled, Ordering::SeqCst);
        self.configured.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    /// Run initialize and start right away and keep their reports for the normal
    /// fan-out to pick up.
    async fn bootstrap(self: &Arc<Self>) -> Result<(), ModuleError> {
        let initialize = accept_partial(self.initialize().await)?;
        let start = accept_partial(self.start().await)?;
        tracing::debug!(module = %self.name, "bootstrapped during load");
        *self.bootstrap.lock() = BootstrapCache {
            initialize: Some(initialize),
            start: Some(start),
        };
        Ok(())
    }

    fn replay(&self, verb: Verb) -> Option<VerbResult> {
        let report = {
            let mut cache = self.bootstrap.lock();
            match verb {
                Verb::Initialize => cache.initialize.take(),
                Verb::Start => cache.start.take(),
                _ => None,
            }
        }?;
        tracing::debug!(module = %self.name, %verb, "replaying bootstrap outcome");
        Some(self.finish(verb, report))
    }

    fn renew_cancellation(&self) {
        let mut token = self.cancel.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    fn finish(&self, verb: Verb, report: PhaseReport) -> VerbResult {
        if report.has_failures() {
            tracing::warn!(
                module = %self.name,
                %verb,
                summary = %report.summary_json(),
                "completed with failed sub-modules"
            );
            return Err(ModuleError::loader(
                &self.name,
                verb,
                LoaderError::Children { report },
            ));
        }
        tracing::debug!(module = %self.name, %verb, "completed");
        Ok(report)
    }

    /// Run a module hook at the isolation boundary: errors are wrapped with the unit
    /// and hook name, panics are caught and logged.
    async fn invoke<F>(&self, verb: &'static str, hook: F) -> Result<(), ModuleError>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        match AssertUnwindSafe(hook).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => {
                tracing::error!(
                    module = %self.name,
                    verb,
                    error = %format!("{source:#}"),
                    "module callback failed"
                );
                Err(ModuleError::Callback {
                    unit: self.name.clone(),
                    verb,
                    source,
                })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(module = %self.name, verb, %message, "module callback panicked");
                Err(ModuleError::Panicked {
                    unit: self.name.clone(),
                    verb,
                    message,
                })
            }
        }
    }
}

fn accept_partial(res: VerbResult) -> VerbResult {
    match res {
        Err(e) => match e.report().cloned() {
            Some(report) => Ok(report),
            None => Err(e),
        },
        ok => ok,
    }
}

fn first_error(results: Vec<Result<(), ModuleError>>) -> Result<(), ModuleError> {
    results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
