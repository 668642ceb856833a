//! Configuration backend contract.
//!
//! The core never owns configuration storage. A backend answers
//! `load_config` for every unit during `load`, persists changes, and publishes
//! change notifications addressed by unit path. The root-level
//! [`ConfigurationService`] turns those notifications into
//! `reconfigure` / `change_state` calls on the addressed unit.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::unit::ModuleUnit;

pub mod memory;
pub mod service;

pub use memory::MemoryConfigBackend;
pub use service::{dispatch_event, ConfigurationService, CONFIGURATION_SERVICE};

/// What a backend knows about one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub configuration: Value,
    pub enabled: bool,
}

impl Default for LoadedConfig {
    fn default() -> Self {
        Self {
            configuration: Value::Object(Default::default()),
            enabled: true,
        }
    }
}

/// Change notification published by a backend. `path` addresses the unit from the
/// root (`services/Foo`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ConfigEvent {
    NewConfig { path: String, configuration: Value },
    UpdateConfig { path: String, configuration: Value },
    DeleteConfig { path: String },
    UpdateState { path: String, enabled: bool },
}

impl ConfigEvent {
    pub fn path(&self) -> &str {
        match self {
            ConfigEvent::NewConfig { path, .. }
            | ConfigEvent::UpdateConfig { path, .. }
            | ConfigEvent::DeleteConfig { path }
            | ConfigEvent::UpdateState { path, .. } => path,
        }
    }
}

#[async_trait]
pub trait ConfigBackend: Send + Sync + 'static {
    async fn load_config(&self, unit: &ModuleUnit) -> anyhow::Result<LoadedConfig>;

    async fn save_config(&self, unit: &ModuleUnit, configuration: &Value) -> anyhow::Result<()>;

    async fn get_module_state(&self, unit: &ModuleUnit) -> anyhow::Result<bool>;

    async fn set_module_state(&self, unit: &ModuleUnit, enabled: bool) -> anyhow::Result<()>;

    /// Storage key of a unit. Defaults to its path.
    fn get_module_id(&self, unit: &ModuleUnit) -> String {
        unit.path().to_string()
    }

    /// Stream of change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent>;
}

/// Recursively merge `delta` into `base`. Objects merge key by key; any other value
/// in `delta` replaces the one in `base`.
pub fn deep_merge(base: &Value, delta: &Value) -> Value {
    match (base, delta) {
        (Value::Object(b), Value::Object(d)) => {
            let mut out = b.clone();
            for (k, v) in d {
                let merged = match out.get(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (_, Value::Null) => base.clone(),
        (_, d) => d.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_recursive_and_delta_wins() {
        let base = json!({"http": {"port": 80, "host": "a"}, "debug": false});
        let delta = json!({"http": {"port": 8080}, "debug": true, "extra": [1]});
        assert_eq!(
            deep_merge(&base, &delta),
            json!({"http": {"port": 8080, "host": "a"}, "debug": true, "extra": [1]})
        );
    }

    #[test]
    fn null_delta_keeps_base() {
        let base = json!({"a": 1});
        assert_eq!(deep_merge(&base, &Value::Null), base);
    }

    #[test]
    fn merging_a_subset_is_a_fixed_point() {
        let base = json!({"a": {"b": 1, "c": 2}});
        assert_eq!(deep_merge(&base, &json!({"a": {"b": 1}})), base);
    }

    #[test]
    fn event_path_and_wire_shape() {
        let ev = ConfigEvent::UpdateState {
            path: "services/Foo".into(),
            enabled: false,
        };
        assert_eq!(ev.path(), "services/Foo");
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"event": "update-state", "path": "services/Foo", "enabled": false})
        );
    }
}
