use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a child unit. Determines which collection the unit lives in and
/// where it sits in the per-phase ordering relative to its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Utility,
    Service,
    Middleware,
    Component,
    Template,
}

impl ModuleKind {
    /// Order used by load / initialize / start.
    pub const LOAD_ORDER: [ModuleKind; 5] = [
        ModuleKind::Utility,
        ModuleKind::Service,
        ModuleKind::Middleware,
        ModuleKind::Component,
        ModuleKind::Template,
    ];

    /// Order used by stop / uninitialize / unload.
    pub const TEARDOWN_ORDER: [ModuleKind; 5] = [
        ModuleKind::Template,
        ModuleKind::Component,
        ModuleKind::Middleware,
        ModuleKind::Service,
        ModuleKind::Utility,
    ];

    /// Name of the children collection, also the key under `paths` in a unit's config
    /// and the path segment used in unit addresses.
    #[inline]
    pub const fn collection(self) -> &'static str {
        match self {
            ModuleKind::Utility => "utilities",
            ModuleKind::Service => "services",
            ModuleKind::Middleware => "middlewares",
            ModuleKind::Component => "components",
            ModuleKind::Template => "templates",
        }
    }

    /// Marker file whose presence turns a directory into a unit root.
    #[inline]
    pub const fn marker(self) -> &'static str {
        match self {
            ModuleKind::Utility => "utility.yaml",
            ModuleKind::Service => "service.yaml",
            ModuleKind::Middleware => "middleware.yaml",
            ModuleKind::Component => "component.yaml",
            ModuleKind::Template => "template.yaml",
        }
    }

    pub fn from_collection(s: &str) -> Option<Self> {
        Self::LOAD_ORDER.into_iter().find(|k| k.collection() == s)
    }

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Utility => "utility",
            ModuleKind::Service => "service",
            ModuleKind::Middleware => "middleware",
            ModuleKind::Component => "component",
            ModuleKind::Template => "template",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
