use std::fmt;
use thiserror::Error;

use crate::kind::ModuleKind;
use crate::phase::{Phase, Verb};
use crate::status::PhaseReport;

/// Stage of a reconfigure / state-change propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Notifying the owning parent.
    Parent,
    /// Recursing into children.
    SubModules,
    /// Notifying registered dependants.
    Dependants,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Parent => "parent notification failed",
            Stage::SubModules => "sub-module propagation failed",
            Stage::Dependants => "dependant notification failed",
        })
    }
}

/// Per-unit error. Every variant names the unit and the verb (or protocol message)
/// it came from; inner causes are preserved as `source`.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("{unit}::load: failed to load configuration")]
    ConfigLoad {
        unit: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{unit}::load: failed to load sub-modules")]
    LoaderLoad {
        unit: String,
        #[source]
        source: LoaderError,
    },
    #[error("{unit}::initialize: failed to initialize sub-modules")]
    LoaderInitialize {
        unit: String,
        #[source]
        source: LoaderError,
    },
    #[error("{unit}::start: failed to start sub-modules")]
    LoaderStart {
        unit: String,
        #[source]
        source: LoaderError,
    },
    #[error("{unit}::stop: failed to stop sub-modules")]
    LoaderStop {
        unit: String,
        #[source]
        source: LoaderError,
    },
    #[error("{unit}::uninitialize: failed to uninitialize sub-modules")]
    LoaderUninitialize {
        unit: String,
        #[source]
        source: LoaderError,
    },
    #[error("{unit}::unload: failed to unload sub-modules")]
    LoaderUnload {
        unit: String,
        #[source]
        source: LoaderError,
    },
    #[error("{unit}::start: dependency '{dependency}' not found")]
    DependencyNotFound { unit: String, dependency: String },
    #[error("{unit}::{verb}: module callback failed")]
    Callback {
        unit: String,
        verb: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("{unit}::{verb}: module callback panicked: {message}")]
    Panicked {
        unit: String,
        verb: &'static str,
        message: String,
    },
    #[error("{unit}::changeState: {stage}")]
    ChangeState {
        unit: String,
        stage: Stage,
        #[source]
        source: Box<ModuleError>,
    },
    #[error("{unit}::reconfigure: {stage}")]
    Reconfigure {
        unit: String,
        stage: Stage,
        #[source]
        source: Box<ModuleError>,
    },
    #[error("{unit}::{verb}: configuration backend call failed")]
    Backend {
        unit: String,
        verb: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("{unit}::{verb}: no configuration backend attached")]
    NoBackend { unit: String, verb: &'static str },
    #[error("{unit}::{verb}: not allowed while {phase}")]
    InvalidTransition {
        unit: String,
        verb: Verb,
        phase: Phase,
    },
    #[error("{unit}::{verb}: another phase call is still in flight")]
    PhaseInProgress { unit: String, verb: Verb },
}

impl ModuleError {
    pub(crate) fn loader(unit: &str, verb: Verb, source: LoaderError) -> Self {
        let unit = unit.to_string();
        match verb {
            Verb::Load => ModuleError::LoaderLoad { unit, source },
            Verb::Initialize => ModuleError::LoaderInitialize { unit, source },
            Verb::Start => ModuleError::LoaderStart { unit, source },
            Verb::Stop => ModuleError::LoaderStop { unit, source },
            Verb::Uninitialize => ModuleError::LoaderUninitialize { unit, source },
            Verb::Unload => ModuleError::LoaderUnload { unit, source },
        }
    }

    /// The partial-status report carried by a loader error, if this error only
    /// reports failed children (the unit itself completed the verb).
    pub fn report(&self) -> Option<&PhaseReport> {
        match self {
            ModuleError::LoaderLoad { source, .. }
            | ModuleError::LoaderInitialize { source, .. }
            | ModuleError::LoaderStart { source, .. }
            | ModuleError::LoaderStop { source, .. }
            | ModuleError::LoaderUninitialize { source, .. }
            | ModuleError::LoaderUnload { source, .. } => match source {
                LoaderError::Children { report } => Some(report),
                _ => None,
            },
            _ => None,
        }
    }

    /// `true` when the unit reached the verb's phase but some children failed.
    #[inline]
    pub fn is_partial(&self) -> bool {
        self.report().is_some()
    }
}

/// Loader-level failure for one unit's children.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("configuration service '{name}' failed to come up")]
    ConfigurationService {
        name: String,
        #[source]
        source: Box<ModuleError>,
    },
    #[error("cyclic service dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("one or more sub-modules failed: {}", report.summary_json())]
    Children { report: PhaseReport },
    #[error("no {kind} named '{name}'")]
    UnknownChild { kind: ModuleKind, name: String },
}

/// Catalog construction errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid catalog configuration:\n{errors:#?}")]
    InvalidCatalogConfiguration { errors: Vec<String> },
}

/// Render an error with its full `source` chain, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(e) = cur {
        out.push_str(": ");
        out.push_str(&e.to_string());
        cur = e.source();
    }
    out
}
