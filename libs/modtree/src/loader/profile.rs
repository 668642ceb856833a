use crate::config::CONFIGURATION_SERVICE;
use crate::kind::ModuleKind;

/// Which child kinds a loader drives, and how it bootstraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderProfile {
    /// Root and utilities: every kind.
    Generic,
    /// Utilities and services only.
    Service,
    /// Utilities, services and nested middlewares.
    Middleware,
    Component,
    Template,
    /// Service profile that also initializes and starts its own unit during `load`.
    ConfigurationService,
}

impl LoaderProfile {
    pub fn for_unit(kind: Option<ModuleKind>, name: &str) -> Self {
        match kind {
            None | Some(ModuleKind::Utility) => LoaderProfile::Generic,
            Some(ModuleKind::Service) if name == CONFIGURATION_SERVICE => {
                LoaderProfile::ConfigurationService
            }
            Some(ModuleKind::Service) => LoaderProfile::Service,
            Some(ModuleKind::Middleware) => LoaderProfile::Middleware,
            Some(ModuleKind::Component) => LoaderProfile::Component,
            Some(ModuleKind::Template) => LoaderProfile::Template,
        }
    }

    pub fn drives(self, kind: ModuleKind) -> bool {
        match self {
            LoaderProfile::Service | LoaderProfile::ConfigurationService => {
                matches!(kind, ModuleKind::Utility | ModuleKind::Service)
            }
            LoaderProfile::Middleware => matches!(
                kind,
                ModuleKind::Utility | ModuleKind::Service | ModuleKind::Middleware
            ),
            LoaderProfile::Generic | LoaderProfile::Component | LoaderProfile::Template => true,
        }
    }

    #[inline]
    pub fn self_bootstraps(self) -> bool {
        self == LoaderProfile::ConfigurationService
    }

    pub(crate) fn load_order(self) -> impl Iterator<Item = ModuleKind> {
        ModuleKind::LOAD_ORDER
            .into_iter()
            .filter(move |k| self.drives(*k))
    }

    pub(crate) fn teardown_order(self) -> impl Iterator<Item = ModuleKind> {
        ModuleKind::TEARDOWN_ORDER
            .into_iter()
            .filter(move |k| self.drives(*k))
    }
}
