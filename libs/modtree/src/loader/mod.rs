//! Per-unit engine that discovers, constructs and drives a unit's children.
//!
//! Kinds are driven in [`ModuleKind::LOAD_ORDER`] for load / initialize / start and in
//! the exact reverse for teardown. Within a kind every child runs concurrently, except
//! services on start / stop: those run one at a time in dependency order.

mod order;
mod profile;

pub use profile::LoaderProfile;

use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;

use crate::config::{ConfigBackend, CONFIGURATION_SERVICE};
use crate::discovery::{discover, DiscoveredModule};
use crate::error::{LoaderError, ModuleError};
use crate::kind::ModuleKind;
use crate::phase::{Phase, Verb};
use crate::status::{Outcome, PhaseReport, StatusRecord};
use crate::unit::ModuleUnit;

type Collection = IndexMap<String, Arc<ModuleUnit>>;

pub struct ModuleLoader {
    profile: LoaderProfile,
    /// `None` outside `load`..`unload`. A kind without children has no entry.
    children: RwLock<Option<IndexMap<ModuleKind, Collection>>>,
    /// Service names in the order they were last started.
    start_order: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("profile", &self.profile)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl ModuleLoader {
    pub(crate) fn new(profile: LoaderProfile) -> Self {
        Self {
            profile,
            children: RwLock::new(None),
            start_order: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn profile(&self) -> LoaderProfile {
        self.profile
    }

    pub fn is_loaded(&self) -> bool {
        self.children.read().is_some()
    }

    pub fn child(&self, kind: ModuleKind, name: &str) -> Option<Arc<ModuleUnit>> {
        self.children
            .read()
            .as_ref()
            .and_then(|c| c.get(&kind))
            .and_then(|m| m.get(name))
            .cloned()
    }

    /// Children of one kind, or `None` when the collection is absent.
    pub fn collection(&self, kind: ModuleKind) -> Option<Vec<Arc<ModuleUnit>>> {
        self.children
            .read()
            .as_ref()
            .and_then(|c| c.get(&kind))
            .map(|m| m.values().cloned().collect())
    }

    /// Every child, in load order.
    pub fn all_children(&self) -> Vec<Arc<ModuleUnit>> {
        ModuleKind::LOAD_ORDER
            .into_iter()
            .filter_map(|k| self.collection(k))
            .flatten()
            .collect()
    }

    pub fn service_start_order(&self) -> Vec<String> {
        self.start_order.lock().clone()
    }

    fn insert(&self, kind: ModuleKind, unit: Arc<ModuleUnit>) {
        let mut guard = self.children.write();
        guard
            .get_or_insert_with(IndexMap::new)
            .entry(kind)
            .or_default()
            .insert(unit.name().to_string(), unit);
    }

    // ---- load ----------------------------------------------------------------

    pub(crate) async fn load(
        &self,
        owner: &Arc<ModuleUnit>,
        backend: Option<Arc<dyn ConfigBackend>>,
    ) -> Result<PhaseReport, LoaderError> {
        let mut backend = backend;
        *self.children.write() = Some(IndexMap::new());
        self.start_order.lock().clear();

        let mut discovered: IndexMap<ModuleKind, Vec<DiscoveredModule>> = IndexMap::new();
        for kind in self.profile.load_order() {
            if let Some(root) = owner.kind_root(kind) {
                discovered.insert(kind, discover(kind, &root));
            }
        }

        // The configuration service comes up before anything else: every other unit
        // resolves its configuration through it.
        let mut config_entry = None;
        if let Some(services) = discovered.get_mut(&ModuleKind::Service) {
            if let Some(pos) = services
                .iter()
                .position(|d| d.module_name() == CONFIGURATION_SERVICE)
            {
                let found = services.remove(pos);
                if let Some(unit) = self.construct(owner, &found) {
                    let outcome = match unit.load(backend.clone()).await {
                        Err(e) if !e.is_partial() => {
                            *self.children.write() = None;
                            return Err(LoaderError::ConfigurationService {
                                name: unit.name().to_string(),
                                source: Box::new(e),
                            });
                        }
                        res => Outcome::from_result(res),
                    };
                    if backend.is_none() {
                        backend = unit.module().as_config_backend();
                    }
                    tracing::info!(
                        owner = %owner.name(),
                        service = %unit.name(),
                        "configuration service ready"
                    );
                    self.insert(ModuleKind::Service, unit.clone());
                    config_entry = Some((unit.name().to_string(), outcome));
                }
            }
        }

        let mut records = Vec::new();
        for kind in self.profile.load_order() {
            let Some(found) = discovered.shift_remove(&kind) else {
                records.push(StatusRecord::empty(kind));
                continue;
            };

            let mut entries = IndexMap::new();
            if kind == ModuleKind::Service {
                if let Some((name, outcome)) = config_entry.take() {
                    entries.insert(name, outcome);
                }
            }

            let mut units: Vec<Arc<ModuleUnit>> = Vec::new();
            for d in &found {
                let Some(unit) = self.construct(owner, d) else {
                    continue;
                };
                if self.child(kind, unit.name()).is_some()
                    || units.iter().any(|u| u.name() == unit.name())
                {
                    tracing::warn!(
                        owner = %owner.name(),
                        %kind,
                        name = %unit.name(),
                        dir = %d.dir.display(),
                        "duplicate module name skipped"
                    );
                    continue;
                }
                units.push(unit);
            }

            let results = join_all(units.iter().map(|u| u.load(backend.clone()))).await;
            for (unit, res) in units.into_iter().zip(results) {
                let outcome = Outcome::from_result(res);
                if let Outcome::Failed(e) = &outcome {
                    tracing::error!(module = %unit.name(), error = %e, "module failed to load");
                } else {
                    self.insert(kind, unit.clone());
                }
                entries.insert(unit.name().to_string(), outcome);
            }
            records.push(StatusRecord::entries(kind, entries));
        }

        Ok(PhaseReport::new(records))
    }

    fn construct(&self, owner: &Arc<ModuleUnit>, found: &DiscoveredModule) -> Option<Arc<ModuleUnit>> {
        let name = found.module_name();
        let Some(constructed) = owner.catalog().construct(found.kind, &name) else {
            tracing::debug!(
                owner = %owner.name(),
                kind = %found.kind,
                %name,
                marker = %found.marker_path.display(),
                "no registered module for marker; skipped"
            );
            return None;
        };
        let dependencies = found
            .marker
            .dependencies
            .as_ref()
            .map(|d| d.names())
            .unwrap_or_default();
        let initial = found
            .marker
            .config
            .clone()
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| Value::Object(Default::default()));
        Some(ModuleUnit::child(
            owner,
            found.kind,
            name,
            constructed,
            found.dir.clone(),
            initial,
            dependencies,
        ))
    }

    // ---- initialize / start --------------------------------------------------

    pub(crate) async fn initialize(&self, _owner: &Arc<ModuleUnit>) -> PhaseReport {
        let mut records = Vec::new();
        for kind in self.profile.load_order() {
            let Some(units) = self.collection(kind) else {
                records.push(StatusRecord::empty(kind));
                continue;
            };
            let results = join_all(units.iter().map(|u| u.initialize())).await;
            records.push(StatusRecord::entries(kind, collect(&units, results)));
        }
        PhaseReport::new(records)
    }

    pub(crate) async fn start(&self, owner: &Arc<ModuleUnit>) -> PhaseReport {
        let mut records = Vec::new();
        for kind in self.profile.load_order() {
            if kind == ModuleKind::Service {
                records.push(self.start_services(owner).await);
                continue;
            }
            let Some(units) = self.collection(kind) else {
                records.push(StatusRecord::empty(kind));
                continue;
            };
            let results = join_all(units.iter().map(|u| self.start_child(owner, u))).await;
            records.push(StatusRecord::entries(kind, collect(&units, results)));
        }
        PhaseReport::new(records)
    }

    async fn start_services(&self, owner: &Arc<ModuleUnit>) -> StatusRecord {
        let Some(units) = self.collection(ModuleKind::Service) else {
            return StatusRecord::empty(ModuleKind::Service);
        };
        let names: Vec<String> = units.iter().map(|u| u.name().to_string()).collect();
        let deps: Vec<Vec<String>> = units.iter().map(|u| u.dependency_names()).collect();
        let order = match order::service_order(&names, &deps) {
            Ok(order) => order,
            Err(path) => {
                tracing::error!(owner = %owner.name(), cycle = ?path, "service dependency cycle");
                return StatusRecord::error(ModuleKind::Service, LoaderError::CycleDetected { path });
            }
        };
        *self.start_order.lock() = order.iter().map(|&i| names[i].clone()).collect();
        tracing::debug!(owner = %owner.name(), order = ?self.service_start_order(), "starting services");

        // Sequential: a later service may resolve an earlier one.
        let mut entries = IndexMap::new();
        for i in order {
            let unit = &units[i];
            let res = self.start_child(owner, unit).await;
            entries.insert(unit.name().to_string(), Outcome::from_result(res));
        }
        StatusRecord::entries(ModuleKind::Service, entries)
    }

    /// Bind `child`'s dependencies, then start it.
    pub(crate) async fn start_child(
        &self,
        owner: &Arc<ModuleUnit>,
        child: &Arc<ModuleUnit>,
    ) -> Result<PhaseReport, ModuleError> {
        resolve_dependencies(owner, child)?;
        child.start().await
    }

    /// Start or stop one child after its enabled flag changed, as far as the phases
    /// of both allow it.
    pub(crate) async fn apply_child_state(
        &self,
        owner: &Arc<ModuleUnit>,
        child: &Arc<ModuleUnit>,
        enabled: bool,
    ) -> Result<(), ModuleError> {
        let res = match (enabled, child.phase()) {
            (true, Phase::Initialized | Phase::Stopped) if owner.phase() == Phase::Started => {
                self.start_child(owner, child).await
            }
            (false, Phase::Started) => child.stop().await,
            _ => return Ok(()),
        };
        match res {
            Ok(_) => Ok(()),
            Err(e) if e.is_partial() => {
                tracing::warn!(module = %child.name(), error = %e, "sub-module toggled with failures");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ---- teardown ------------------------------------------------------------

    pub(crate) async fn stop(&self, owner: &Arc<ModuleUnit>) -> PhaseReport {
        let mut records = Vec::new();
        for kind in self.profile.teardown_order() {
            if kind == ModuleKind::Service {
                records.push(self.stop_services(owner).await);
                continue;
            }
            records.push(self.teardown(kind, Verb::Stop).await);
        }
        PhaseReport::new(records)
    }

    async fn stop_services(&self, owner: &Arc<ModuleUnit>) -> StatusRecord {
        let Some(units) = self.collection(ModuleKind::Service) else {
            return StatusRecord::empty(ModuleKind::Service);
        };
        let mut order = self.service_start_order();
        if order.is_empty() {
            let names: Vec<String> = units.iter().map(|u| u.name().to_string()).collect();
            let deps: Vec<Vec<String>> = units.iter().map(|u| u.dependency_names()).collect();
            match order::service_order(&names, &deps) {
                Ok(o) => order = o.into_iter().map(|i| names[i].clone()).collect(),
                Err(path) => {
                    tracing::error!(owner = %owner.name(), cycle = ?path, "service dependency cycle");
                    return StatusRecord::error(
                        ModuleKind::Service,
                        LoaderError::CycleDetected { path },
                    );
                }
            }
        }

        let mut entries = IndexMap::new();
        for name in order.iter().rev() {
            let Some(unit) = units.iter().find(|u| u.name() == name) else {
                continue;
            };
            let res = descend(unit, Verb::Stop).await;
            entries.insert(name.clone(), Outcome::from_result(res));
        }
        StatusRecord::entries(ModuleKind::Service, entries)
    }

    pub(crate) async fn uninitialize(&self, _owner: &Arc<ModuleUnit>) -> PhaseReport {
        let mut records = Vec::new();
        for kind in self.profile.teardown_order() {
            records.push(self.teardown(kind, Verb::Uninitialize).await);
        }
        PhaseReport::new(records)
    }

    /// Unload every child, then drop the collections.
    pub(crate) async fn unload(&self, _owner: &Arc<ModuleUnit>) -> PhaseReport {
        let mut records = Vec::new();
        for kind in self.profile.teardown_order() {
            records.push(self.teardown(kind, Verb::Unload).await);
        }
        *self.children.write() = None;
        self.start_order.lock().clear();
        PhaseReport::new(records)
    }

    async fn teardown(&self, kind: ModuleKind, verb: Verb) -> StatusRecord {
        let Some(units) = self.collection(kind) else {
            return StatusRecord::empty(kind);
        };
        let results = join_all(units.iter().map(|u| descend(u, verb))).await;
        StatusRecord::entries(kind, collect(&units, results))
    }
}

/// Drive `unit` down to `verb`'s target through whatever verbs its phase still
/// needs. Children that ran ahead of their owner (the configuration service starts
/// itself during load) are walked down step by step; children that never got far
/// enough are left alone. Every step runs; the first failure is reported.
async fn descend(unit: &Arc<ModuleUnit>, verb: Verb) -> Result<PhaseReport, ModuleError> {
    let mut outcome = Ok(PhaseReport::default());
    for step in descent(verb, unit.phase()) {
        let res = match step {
            Verb::Stop => unit.stop().await,
            Verb::Uninitialize => unit.uninitialize().await,
            _ => unit.unload().await,
        };
        outcome = match outcome {
            Err(e) => Err(e),
            Ok(_) => res,
        };
    }
    outcome
}

fn descent(verb: Verb, phase: Phase) -> &'static [Verb] {
    use Phase::*;
    match (verb, phase) {
        (Verb::Stop, Started) => &[Verb::Stop],
        (Verb::Uninitialize, Started) => &[Verb::Stop, Verb::Uninitialize],
        (Verb::Uninitialize, Initialized | Stopped) => &[Verb::Uninitialize],
        (Verb::Unload, Started) => &[Verb::Stop, Verb::Uninitialize, Verb::Unload],
        (Verb::Unload, Initialized | Stopped) => &[Verb::Uninitialize, Verb::Unload],
        (Verb::Unload, Loaded | Uninitialized) => &[Verb::Unload],
        _ => &[],
    }
}

fn collect(
    units: &[Arc<ModuleUnit>],
    results: Vec<Result<PhaseReport, ModuleError>>,
) -> IndexMap<String, Outcome> {
    units
        .iter()
        .zip(results)
        .map(|(u, r)| (u.name().to_string(), Outcome::from_result(r)))
        .collect()
}

/// Bind every declared dependency of `unit` to the nearest service of that name,
/// searching `owner`'s services first and then each ancestor's.
///
/// Services must resolve everything; other kinds silently omit what is missing.
pub(crate) fn resolve_dependencies(
    owner: &Arc<ModuleUnit>,
    unit: &Arc<ModuleUnit>,
) -> Result<(), ModuleError> {
    let strict = unit.kind() == Some(ModuleKind::Service);
    for name in unit.dependency_names() {
        match find_service(owner, &name, unit) {
            Some(target) => {
                unit.dependencies().bind(&name, &target);
                target.add_dependant(unit);
                tracing::trace!(module = %unit.name(), dependency = %target.path(), "dependency bound");
            }
            None if strict => {
                return Err(ModuleError::DependencyNotFound {
                    unit: unit.name().to_string(),
                    dependency: name,
                });
            }
            None => {
                tracing::debug!(module = %unit.name(), dependency = %name, "optional dependency not found");
            }
        }
    }
    Ok(())
}

fn find_service(
    start: &Arc<ModuleUnit>,
    name: &str,
    exclude: &Arc<ModuleUnit>,
) -> Option<Arc<ModuleUnit>> {
    let mut level = Some(start.clone());
    while let Some(current) = level {
        if let Some(found) = current
            .loader()
            .child(ModuleKind::Service, name)
            .filter(|s| !Arc::ptr_eq(s, exclude))
        {
            return Some(found);
        }
        level = current.parent();
    }
    None
}
