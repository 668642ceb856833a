use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::{absolutize, expand_tilde, resolve_home_dir};

const DEFAULT_SUBDIR: &str = ".modtree";

/// Host configuration: typed global sections plus the per-module bag the in-memory
/// configuration backend is seeded from.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub host: HostConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Initial configuration of the root unit.
    #[serde(default = "default_application_config")]
    pub application: Value,
    /// Directory of per-module YAML files (optional).
    #[serde(default)]
    pub modules_dir: Option<String>,
    /// Unit path (`services/Foo`) -> stored settings.
    #[serde(default)]
    pub modules: HashMap<String, ModuleSettings>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Normalized to an absolute path on load.
    #[serde(default)]
    pub home_dir: String,
    /// Directory the root unit discovers its children under. Empty means the
    /// current directory.
    #[serde(default)]
    pub app_dir: String,
    /// Upper bound for each root phase call; 0 disables it.
    #[serde(default)]
    pub phase_timeout_sec: u64,
}

impl HostConfig {
    pub fn app_dir_path(&self) -> Result<PathBuf> {
        if self.app_dir.trim().is_empty() {
            return std::env::current_dir().context("current directory is not accessible");
        }
        absolutize(&expand_tilde(self.app_dir.trim())?)
    }

    pub fn phase_timeout(&self) -> Option<Duration> {
        (self.phase_timeout_sec > 0).then(|| Duration::from_secs(self.phase_timeout_sec))
    }
}

/// What the configuration backend stores for one unit.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleSettings {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default = "empty_object")]
    pub config: Value,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            config: empty_object(),
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/modtree.log", empty disables the file
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

/// Every kind collection under its conventional directory name.
pub fn default_application_config() -> Value {
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

pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/modtree.log".to_string(),
            file_level: "debug".to_string(),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            logging: Some(default_logging_config()),
            application: default_application_config(),
            modules_dir: None,
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Layered loading: defaults → YAML file → `APP__` environment variables.
    /// Also normalizes `host.home_dir` into an absolute path and creates the directory.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let config_path = config_path.as_ref();
        if !config_path.is_file() {
            bail!("config file not found: {}", config_path.display());
        }

        // Optional sections stay None unless YAML/ENV provide them.
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path))
            // APP__HOST__PHASE_TIMEOUT_SEC=5 maps to host.phase_timeout_sec
            .merge(Env::prefixed("APP__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .context("Failed to extract config from figment")?;

        normalize_home_dir_inplace(&mut config.host).context("Failed to resolve host.home_dir")?;

        if let Some(dir) = config.modules_dir.clone() {
            merge_module_files(&mut config.modules, dir)?;
        }

        Ok(config)
    }

    /// Load from `config_path` if given, otherwise use the defaults.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                normalize_home_dir_inplace(&mut c.host)
                    .context("Failed to resolve host.home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(dir) = &args.app_dir {
            self.host.app_dir = dir.clone();
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            match args.verbose {
                0 => {}
                1 => default_section.console_level = "debug".to_string(),
                _ => default_section.console_level = "trace".to_string(),
            }
        }
    }
}

/// Command line arguments that feed into the configuration.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub app_dir: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

fn normalize_home_dir_inplace(host: &mut HostConfig) -> Result<()> {
    let opt = if host.home_dir.trim().is_empty() {
        None
    } else {
        Some(host.home_dir.clone())
    };

    let resolved: PathBuf =
        resolve_home_dir(opt, DEFAULT_SUBDIR, true).context("home_dir normalization failed")?;

    host.home_dir = resolved.to_string_lossy().to_string();
    Ok(())
}

/// Every `*.yaml` / `*.yml` file under `dir` becomes the entry for the unit path
/// spelled by its relative path without extension (`services/Foo.yaml`).
fn merge_module_files(bag: &mut HashMap<String, ModuleSettings>, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    let mut files = Vec::new();
    collect_yaml_files(dir, &mut files)?;
    for path in files {
        let Ok(rel) = path.strip_prefix(dir) else {
            continue;
        };
        let key = rel
            .with_extension("")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings: ModuleSettings = if raw.trim().is_empty() {
            ModuleSettings::default()
        } else {
            serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid module settings in {}", path.display()))?
        };
        bag.insert(key, settings);
    }
    Ok(())
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext == "yml" || ext == "yaml" {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn is_normalized_path(p: &str) -> bool {
        let pb = PathBuf::from(p);
        pb.is_absolute() && !p.starts_with('~')
    }

    #[test]
    fn test_default_config_structure() {
        let config = AppConfig::default();

        assert_eq!(config.host.home_dir, "");
        assert_eq!(config.host.phase_timeout(), None);
        assert_eq!(config.application["paths"]["services"], "services");

        let logging = config.logging.as_ref().unwrap();
        let default_section = &logging["default"];
        assert_eq!(default_section.console_level, "info");
        assert_eq!(default_section.file, "logs/modtree.log");

        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_load_layered_reads_every_section() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("cfg.yaml");
        let home = tmp.path().join("home");

        let yaml = format!(
            r#"
host:
  home_dir: "{}"
  app_dir: "/srv/app"
  phase_timeout_sec: 30

logging:
  default:
    console_level: debug
    file: "logs/default.log"

application:
  paths:
    services: svc

modules:
  services/Foo:
    config:
      a: 1
  services/Bar:
    enabled: false
"#,
            home.to_string_lossy().replace('\\', "/")
        );
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();

        assert!(is_normalized_path(&config.host.home_dir));
        assert!(home.is_dir());
        assert_eq!(config.host.app_dir_path().unwrap(), PathBuf::from("/srv/app"));
        assert_eq!(config.host.phase_timeout(), Some(Duration::from_secs(30)));
        // Layered over the defaults: only the named collection moves.
        assert_eq!(config.application["paths"]["services"], "svc");
        assert_eq!(config.application["paths"]["components"], "components");

        let foo = &config.modules["services/Foo"];
        assert!(foo.enabled);
        assert_eq!(foo.config, json!({"a": 1}));
        let bar = &config.modules["services/Bar"];
        assert!(!bar.enabled);
        assert_eq!(bar.config, json!({}));

        let def = &config.logging.as_ref().unwrap()["default"];
        assert_eq!(def.console_level, "debug");
        assert_eq!(def.file, "logs/default.log");
    }

    #[test]
    fn test_minimal_yaml_keeps_optional_sections_empty() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("cfg.yaml");
        let yaml = format!(
            "host:\n  home_dir: \"{}\"\n",
            tmp.path().join("h").to_string_lossy().replace('\\', "/")
        );
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();
        assert!(config.logging.is_none());
        assert!(config.modules.is_empty());
        assert_eq!(config.application, default_application_config());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let tmp = tempdir().unwrap();
        let err = AppConfig::load_layered(tmp.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn test_unknown_top_level_field_is_rejected() {
        let result: Result<AppConfig, _> = serde_yaml::from_str("server:\n  port: 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_verbose_levels_matrix() {
        for (verbose, expected) in [(0, "info"), (1, "debug"), (2, "trace"), (3, "trace")] {
            let mut config = AppConfig::default();
            config.apply_cli_overrides(&CliArgs {
                verbose,
                ..CliArgs::default()
            });
            let section = &config.logging.as_ref().unwrap()["default"];
            assert_eq!(section.console_level, expected);
        }
    }

    #[test]
    fn test_cli_app_dir_override() {
        let mut config = AppConfig::default();
        config.apply_cli_overrides(&CliArgs {
            app_dir: Some("/opt/tree".into()),
            ..CliArgs::default()
        });
        assert_eq!(config.host.app_dir, "/opt/tree");
    }

    #[test]
    fn test_modules_dir_entries_are_keyed_by_relative_path() {
        let tmp = tempdir().unwrap();
        let modules_dir = tmp.path().join("modules");
        fs::create_dir_all(modules_dir.join("services/Foo/utilities")).unwrap();
        fs::write(
            modules_dir.join("services/Foo.yaml"),
            "config:\n  setting1: value1\n  setting2: 42\n",
        )
        .unwrap();
        fs::write(modules_dir.join("services/Foo/utilities/Cache.yml"), "enabled: false\n").unwrap();
        fs::write(modules_dir.join("services/notes.txt"), "ignored").unwrap();

        let cfg_path = tmp.path().join("cfg.yaml");
        let yaml = format!(
            r#"
host:
  home_dir: "{home}"
modules_dir: "{dir}"
modules:
  services/Foo:
    config:
      overridden: true
  services/Keep: {{}}
"#,
            home = tmp.path().join("h").to_string_lossy().replace('\\', "/"),
            dir = modules_dir.to_string_lossy().replace('\\', "/")
        );
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();
        assert_eq!(config.modules.len(), 3);
        assert!(config.modules.contains_key("services/Keep"));
        assert_eq!(
            config.modules["services/Foo"].config,
            json!({"setting1": "value1", "setting2": 42})
        );
        assert!(!config.modules["services/Foo/utilities/Cache"].enabled);
    }

    #[test]
    fn test_to_yaml_roundtrip_basic() {
        let mut config = AppConfig::default();
        config.modules.insert("services/Foo".into(), ModuleSettings::default());
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("host:"));
        assert!(yaml.contains("logging:"));

        let back: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.modules["services/Foo"], ModuleSettings::default());
        assert_eq!(back.application, config.application);
    }
}
