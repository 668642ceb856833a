//! Shared fixtures: on-disk trees and call-recording modules.
#![allow(dead_code)]

use async_trait::async_trait;
use modtree::{Catalog, CatalogBuilder, Dependencies, Interface, Module, ModuleCtx, ModuleKind, ModuleUnit};
use serde_json::{json, Value};
use std::any::Any;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub type Log = Arc<Mutex<Vec<String>>>;

/// What a probe's dependants receive.
#[derive(Debug)]
pub struct ProbeApi {
    pub name: String,
}

/// Module that records every hook as `"<name>:<hook>"` and can be told to fail or
/// panic in one of them.
pub struct Probe {
    name: String,
    deps: Vec<String>,
    gated: bool,
    fail: Option<&'static str>,
    panic: Option<&'static str>,
    log: Log,
}

impl Probe {
    fn hit(&self, event: &str) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, event));
        let hook = event.split('(').next().unwrap_or(event);
        if self.panic == Some(hook) {
            panic!("{} blew up in {}", self.name, hook);
        }
        if self.fail == Some(hook) {
            anyhow::bail!("{} refused {}", self.name, hook);
        }
        Ok(())
    }
}

#[async_trait]
impl Module for Probe {
    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn interface(&self) -> Option<Interface> {
        Some(Arc::new(ProbeApi {
            name: self.name.clone(),
        }))
    }

    fn gated_on_dependencies(&self) -> bool {
        self.gated
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn load(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.hit("load")
    }

    async fn initialize(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.hit("initialize")
    }

    async fn start(&self, _ctx: &ModuleCtx, _deps: &Dependencies) -> anyhow::Result<()> {
        self.hit("start")
    }

    async fn stop(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.hit("stop")
    }

    async fn uninitialize(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.hit("uninitialize")
    }

    async fn unload(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.hit("unload")
    }

    async fn on_parent_reconfigure(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.hit("parentReconfigure")
    }

    async fn on_dependency_reconfigure(
        &self,
        _ctx: &ModuleCtx,
        dependency: &Arc<ModuleUnit>,
    ) -> anyhow::Result<()> {
        self.hit(&format!("dependencyReconfigure({})", dependency.name()))
    }

    async fn on_submodule_reconfigure(
        &self,
        _ctx: &ModuleCtx,
        sub: &Arc<ModuleUnit>,
    ) -> anyhow::Result<()> {
        self.hit(&format!("subModuleReconfigure({})", sub.name()))
    }

    async fn on_parent_state_change(&self, _ctx: &ModuleCtx, enabled: bool) -> anyhow::Result<()> {
        self.hit(&format!("parentStateChange({enabled})"))
    }

    async fn on_dependency_state_change(
        &self,
        _ctx: &ModuleCtx,
        dependency: &Arc<ModuleUnit>,
        enabled: bool,
    ) -> anyhow::Result<()> {
        self.hit(&format!("dependencyStateChange({},{enabled})", dependency.name()))
    }

    async fn on_submodule_state_change(
        &self,
        _ctx: &ModuleCtx,
        sub: &Arc<ModuleUnit>,
        enabled: bool,
    ) -> anyhow::Result<()> {
        self.hit(&format!("subModuleStateChange({},{enabled})", sub.name()))
    }
}

/// Builder for one probe registration.
#[derive(Clone)]
pub struct ProbeDef {
    pub kind: ModuleKind,
    pub name: String,
    deps: Vec<String>,
    gated: bool,
    fail: Option<&'static str>,
    panic: Option<&'static str>,
}

pub fn probe(kind: ModuleKind, name: &str) -> ProbeDef {
    ProbeDef {
        kind,
        name: name.to_string(),
        deps: Vec::new(),
        gated: true,
        fail: None,
        panic: None,
    }
}

impl ProbeDef {
    pub fn deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn ungated(mut self) -> Self {
        self.gated = false;
        self
    }

    pub fn failing(mut self, hook: &'static str) -> Self {
        self.fail = Some(hook);
        self
    }

    pub fn panicking(mut self, hook: &'static str) -> Self {
        self.panic = Some(hook);
        self
    }

    pub fn build(&self, log: &Log) -> Probe {
        Probe {
            name: self.name.clone(),
            deps: self.deps.clone(),
            gated: self.gated,
            fail: self.fail,
            panic: self.panic,
            log: log.clone(),
        }
    }
}

/// Every kind collection under its conventional directory name.
pub fn all_paths() -> Value {
    json!({
        "paths": {
            "utilities": "utilities",
            "services": "services",
            "middlewares": "middlewares",
            "components": "components",
            "templates": "templates"
        }
    })
}

/// A module tree on disk plus the catalog of probes it is built from.
pub struct Fixture {
    pub dir: TempDir,
    pub log: Log,
    builder: CatalogBuilder,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            log: Arc::new(Mutex::new(Vec::new())),
            builder: Catalog::builder(),
        }
    }

    /// Register a probe and drop its marker at `rel` (relative to the tree root, e.g.
    /// `services/Foo`). `marker_body` is written verbatim.
    pub fn unit(&mut self, rel: &str, spec: ProbeDef, marker_body: &str) -> &mut Self {
        self.marker(rel, spec.kind, marker_body);
        self.register(spec)
    }

    /// Register a probe without creating a marker.
    pub fn register(&mut self, spec: ProbeDef) -> &mut Self {
        let log = self.log.clone();
        let kind = spec.kind;
        let name = spec.name.clone();
        self.builder.register_named(kind, name, move || {
            Arc::new(spec.build(&log)) as Arc<dyn Module>
        });
        self
    }

    pub fn marker(&self, rel: &str, kind: ModuleKind, body: &str) {
        let dir = self.dir.path().join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(kind.marker()), body).unwrap();
    }

    pub fn register_with<F>(&mut self, kind: ModuleKind, name: &str, ctor: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Module> + Send + Sync + 'static,
    {
        self.builder.register_named(kind, name, ctor);
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Root unit over the tree, with every collection configured.
    pub fn root(&mut self) -> Arc<ModuleUnit> {
        let catalog = std::mem::take(&mut self.builder).build().unwrap();
        ModuleUnit::root(Arc::new(catalog), self.dir.path(), all_paths())
    }

    /// Root backed by a probe of its own.
    pub fn probe_root(&mut self, name: &str) -> Arc<ModuleUnit> {
        let catalog = std::mem::take(&mut self.builder).build().unwrap();
        let module = probe(ModuleKind::Service, name).build(&self.log);
        ModuleUnit::root_with(name, Arc::new(module), Arc::new(catalog), self.dir.path(), all_paths())
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Events ending in `:<hook>` (exact hook, no arguments), in order.
    pub fn hook_order(&self, hook: &str) -> Vec<String> {
        let suffix = format!(":{hook}");
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {event} not recorded: {:?}", self.events()))
    }

    /// Poll until `event` shows up (background pumps deliver asynchronously).
    pub async fn wait_for(&self, event: &str) {
        let found = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if self.events().iter().any(|e| e == event) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(found.is_ok(), "event {event} never arrived: {:?}", self.events());
    }
}

/// load + initialize + start, all expected to succeed.
pub async fn bring_up(root: &Arc<ModuleUnit>) {
    root.load(None).await.unwrap();
    root.initialize().await.unwrap();
    root.start().await.unwrap();
}

/// stop + uninitialize + unload, all expected to succeed.
pub async fn tear_down(root: &Arc<ModuleUnit>) {
    root.stop().await.unwrap();
    root.uninitialize().await.unwrap();
    root.unload().await.unwrap();
}
