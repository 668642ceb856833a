//! # modtree - hierarchical module runtime
//!
//! A tree of composable units (utilities, services, middlewares, components,
//! templates) brought up and torn down in dependency-correct order, with runtime
//! enable/disable of any subtree and live configuration propagation.
//!
//! - **Units**: [`ModuleUnit`] wraps a [`Module`] and drives the six lifecycle verbs
//!   through an explicit phase state machine.
//! - **Loaders**: each unit's [`ModuleLoader`] discovers its children on disk, builds
//!   them from the [`Catalog`] and fans every verb out in kind order.
//! - **Dependencies**: named services resolved from the nearest enclosing level and
//!   read through live [`DependencyHandle`]s.
//! - **Configuration**: pluggable [`ConfigBackend`]s, pumped into the tree by the
//!   built-in [`ConfigurationService`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use modtree::{Catalog, ModuleKind, ModuleUnit};
//!
//! let mut b = Catalog::builder();
//! b.register::<Mailer>(ModuleKind::Service);
//! let root = ModuleUnit::root(Arc::new(b.build()?), "/srv/app", serde_json::json!({
//!     "paths": { "services": "services" }
//! }));
//! root.load(None).await?;
//! root.initialize().await?;
//! root.start().await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

// Re-export inventory for link-time registration
pub use inventory;

pub mod catalog;
pub mod config;
pub mod context;
pub mod contracts;
pub mod dependencies;
pub mod discovery;
pub mod error;
pub mod kind;
pub mod lifecycle;
pub mod loader;
pub mod phase;
pub mod runtime;
pub mod status;
pub mod unit;

pub use catalog::{short_type_name, Catalog, CatalogBuilder, Constructed, Registrator};
pub use config::{
    deep_merge, ConfigBackend, ConfigEvent, ConfigurationService, LoadedConfig,
    MemoryConfigBackend, CONFIGURATION_SERVICE,
};
pub use context::ModuleCtx;
pub use contracts::{Application, Interface, Module};
pub use dependencies::{Dependencies, DependencyHandle, DependencyList};
pub use error::{error_chain, CatalogError, LoaderError, ModuleError, Stage};
pub use kind::ModuleKind;
pub use lifecycle::{StopReason, TaskLifecycle, TaskStatus};
pub use loader::{LoaderProfile, ModuleLoader};
pub use phase::{Phase, Verb};
pub use crate::runtime::{check, run, RunOptions, ShutdownOptions};
pub use status::{filter_status, FilteredRecord, FilteredStatus, Outcome, PhaseReport, Status, StatusRecord, Summary};
pub use unit::ModuleUnit;
