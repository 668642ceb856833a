use anyhow::Result;
use clap::{Parser, Subcommand};
use modtree::{
    Catalog, ConfigBackend, ConfigurationService, MemoryConfigBackend, Module, ModuleKind,
    ModuleUnit, RunOptions, ShutdownOptions, CONFIGURATION_SERVICE,
};
use runtime::{AppConfig, CliArgs};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// ModTree host - drives a module tree discovered on disk
#[derive(Parser)]
#[command(name = "modtree-host")]
#[command(about = "ModTree host - drives a module tree discovered on disk")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory the root unit discovers its children under (overrides config)
    #[arg(long)]
    app_dir: Option<String>,

    /// Print current configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the module tree up and keep it running until a shutdown signal
    Run,
    /// Load the module tree, print its status summary and unload it
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        app_dir: cli.app_dir.clone(),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Load configuration (normalized home_dir is applied inside)
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let logging_config = config.logging.clone().unwrap_or_default();
    runtime::logging::init_logging_from_config(&logging_config, Path::new(&config.host.home_dir));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ModTree host starting");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_tree(config).await,
        Commands::Check => check_tree(config).await,
    }
}

/// Root unit over `host.app_dir`, with the built-in configuration service
/// registered next to everything linked in through `inventory`.
fn build_root(config: &AppConfig) -> Result<(Arc<ModuleUnit>, Arc<dyn ConfigBackend>)> {
    let backend: Arc<dyn ConfigBackend> = Arc::new(MemoryConfigBackend::from_settings(
        config.modules.clone(),
    ));

    let service_backend = backend.clone();
    let catalog = Catalog::discover_with(|b| {
        b.register_named(ModuleKind::Service, CONFIGURATION_SERVICE, move || {
            Arc::new(ConfigurationService::new(service_backend.clone())) as Arc<dyn Module>
        });
    })?;

    let app_dir = config.host.app_dir_path()?;
    tracing::info!(app_dir = %app_dir.display(), modules = catalog.len(), "catalog ready");

    let root = ModuleUnit::root(Arc::new(catalog), app_dir, config.application.clone());
    Ok((root, backend))
}

async fn run_tree(config: AppConfig) -> Result<()> {
    let (root, backend) = build_root(&config)?;
    modtree::run(RunOptions {
        root,
        backend: Some(backend),
        shutdown: ShutdownOptions::Signals,
        phase_timeout: config.host.phase_timeout(),
    })
    .await
}

async fn check_tree(config: AppConfig) -> Result<()> {
    let (root, backend) = build_root(&config)?;
    let summary = modtree::check(&root, Some(backend), config.host.phase_timeout()).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("Module tree check passed");
    Ok(())
}
