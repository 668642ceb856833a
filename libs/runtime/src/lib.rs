//! Host-side plumbing shared by binaries embedding a module tree: layered
//! application configuration, home directory resolution and logging bootstrap.

pub mod config;
pub mod logging;
pub mod paths;

pub use config::{
    default_application_config, default_logging_config, AppConfig, CliArgs, HostConfig,
    LoggingConfig, ModuleSettings, Section,
};
pub use logging::init_logging_from_config;
