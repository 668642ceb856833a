//! Live dependency bindings.
//!
//! A unit never captures a dependency's Interface directly. It holds a
//! [`DependencyHandle`] per name and asks it at use time; the handle answers
//! `None` while the dependency is disabled (or gone), so dependants always see
//! the current state without being re-wired.

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Deserialize;
use std::any::Any;
use std::sync::{Arc, Weak};

use crate::contracts::Interface;
use crate::unit::ModuleUnit;

/// Dependency names as written in markers and configuration: either
/// `"A, B"` or `["A", "B"]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DependencyList {
    Csv(String),
    List(Vec<String>),
}

impl DependencyList {
    pub fn names(&self) -> Vec<String> {
        match self {
            DependencyList::Csv(s) => s
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            DependencyList::List(v) => v
                .iter()
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl From<&str> for DependencyList {
    fn from(s: &str) -> Self {
        DependencyList::Csv(s.to_string())
    }
}

impl From<Vec<String>> for DependencyList {
    fn from(v: Vec<String>) -> Self {
        DependencyList::List(v)
    }
}

impl From<&[&str]> for DependencyList {
    fn from(v: &[&str]) -> Self {
        DependencyList::List(v.iter().map(|s| s.to_string()).collect())
    }
}

/// Capability handle to one resolved dependency.
#[derive(Clone)]
pub struct DependencyHandle {
    name: String,
    target: Weak<ModuleUnit>,
}

impl std::fmt::Debug for DependencyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyHandle")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl DependencyHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Option<Arc<ModuleUnit>> {
        self.target.upgrade()
    }

    pub fn is_enabled(&self) -> bool {
        self.target.upgrade().is_some_and(|u| u.is_enabled())
    }

    /// The dependency's Interface, or `None` while it is disabled.
    pub fn resolve(&self) -> Option<Interface> {
        let unit = self.target.upgrade()?;
        unit.is_enabled().then(|| unit.interface())
    }
}

/// Per-unit set of dependency bindings, keyed by dependency name.
#[derive(Default)]
pub struct Dependencies {
    bindings: RwLock<IndexMap<String, DependencyHandle>>,
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.bindings.read().values()).finish()
    }
}

impl Dependencies {
    /// Typed access: the dependency's Interface downcast to `T`.
    pub fn get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get_raw(name)?.downcast::<T>().ok()
    }

    pub fn get_raw(&self, name: &str) -> Option<Interface> {
        let handle = self.bindings.read().get(name).cloned()?;
        handle.resolve()
    }

    pub fn handle(&self, name: &str) -> Option<DependencyHandle> {
        self.bindings.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// AND over every bound dependency's enabled flag.
    pub fn all_enabled(&self) -> bool {
        self.bindings.read().values().all(DependencyHandle::is_enabled)
    }

    pub(crate) fn bind(&self, name: &str, target: &Arc<ModuleUnit>) {
        self.bindings.write().insert(
            name.to_string(),
            DependencyHandle {
                name: name.to_string(),
                target: Arc::downgrade(target),
            },
        );
    }

    pub(crate) fn clear(&self) {
        self.bindings.write().clear();
    }
}
