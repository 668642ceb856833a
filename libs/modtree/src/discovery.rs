//! Filesystem discovery of child units.
//!
//! A directory under a kind's collection path either *is* one unit (the kind's marker
//! file sits directly inside it) or is a plain container that is searched further.
//! Nothing below a marker directory is visited.

use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::dependencies::DependencyList;
use crate::kind::ModuleKind;

/// Contents of a marker file. Every field is optional and an empty file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Marker {
    /// Registered type name. Defaults to the directory name.
    pub module: Option<String>,
    pub dependencies: Option<DependencyList>,
    /// Defaults that the backend's configuration is merged over.
    pub config: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct DiscoveredModule {
    pub kind: ModuleKind,
    /// Directory holding the marker; becomes the unit's base path.
    pub dir: PathBuf,
    pub marker_path: PathBuf,
    pub marker: Marker,
}

impl DiscoveredModule {
    /// Name of the registered type this directory asks for.
    pub fn module_name(&self) -> String {
        self.marker.module.clone().unwrap_or_else(|| {
            self.dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

/// Paths of every `marker` file under `root`, in lexical directory order.
///
/// A missing or unreadable root yields an empty list.
pub fn scan(root: &Path, marker: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    scan_dir(root, marker, &mut found);
    found
}

fn scan_dir(dir: &Path, marker: &str, found: &mut Vec<PathBuf>) {
    let candidate = dir.join(marker);
    if candidate.is_file() {
        found.push(candidate);
        return;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "discovery skipped directory");
            return;
        }
    };
    let mut subdirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    subdirs.sort();
    for sub in subdirs {
        scan_dir(&sub, marker, found);
    }
}

/// Discover every unit of `kind` under `root`. Markers that fail to parse are logged
/// and skipped.
pub fn discover(kind: ModuleKind, root: &Path) -> Vec<DiscoveredModule> {
    scan(root, kind.marker())
        .into_iter()
        .filter_map(|marker_path| {
            let marker = match read_marker(&marker_path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(
                        marker = %marker_path.display(),
                        error = %format!("{e:#}"),
                        "invalid marker file skipped"
                    );
                    return None;
                }
            };
            let dir = marker_path.parent()?.to_path_buf();
            Some(DiscoveredModule {
                kind,
                dir,
                marker_path,
                marker,
            })
        })
        .collect()
}

fn read_marker(path: &Path) -> anyhow::Result<Marker> {
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Marker::default());
    }
    let marker: Option<Marker> = serde_yaml::from_str(&raw)?;
    Ok(marker.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn marker_directory_is_not_descended_into() {
        let tmp = TempDir::new().unwrap();
        let services = tmp.path().join("services");
        touch(&services.join("Bar/service.yaml"), "");
        touch(&services.join("Bar/nested/Inner/service.yaml"), "");

        let found = scan(&services, "service.yaml");
        assert_eq!(found, vec![services.join("Bar/service.yaml")]);
    }

    #[test]
    fn containers_are_searched_in_lexical_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("group/Zeta/component.yaml"), "");
        touch(&root.join("Alpha/component.yaml"), "");
        touch(&root.join("group/Beta/component.yaml"), "");

        let found: Vec<_> = discover(ModuleKind::Component, root)
            .iter()
            .map(DiscoveredModule::module_name)
            .collect();
        assert_eq!(found, vec!["Alpha", "Beta", "Zeta"]);
    }

    #[test]
    fn missing_root_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        assert!(scan(&tmp.path().join("absent"), "service.yaml").is_empty());
    }

    #[test]
    fn marker_fields_are_parsed() {
        let tmp = TempDir::new().unwrap();
        touch(
            &tmp.path().join("mail/service.yaml"),
            "module: Mailer\ndependencies: \"Smtp, Templates\"\nconfig:\n  retries: 3\n",
        );
        let found = discover(ModuleKind::Service, tmp.path());
        assert_eq!(found.len(), 1);
        let m = &found[0];
        assert_eq!(m.module_name(), "Mailer");
        assert_eq!(m.dir, tmp.path().join("mail"));
        assert_eq!(
            m.marker.dependencies.as_ref().map(DependencyList::names),
            Some(vec!["Smtp".to_string(), "Templates".to_string()])
        );
        assert_eq!(m.marker.config, Some(serde_json::json!({"retries": 3})));
    }

    #[test]
    fn malformed_marker_is_skipped() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("Bad/utility.yaml"), "module: [unclosed");
        touch(&tmp.path().join("Good/utility.yaml"), "");
        let names: Vec<_> = discover(ModuleKind::Utility, tmp.path())
            .iter()
            .map(DiscoveredModule::module_name)
            .collect();
        assert_eq!(names, vec!["Good"]);
    }
}
