use async_trait::async_trait;
use dashmap::DashMap;
use ::runtime::ModuleSettings;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{deep_merge, ConfigBackend, ConfigEvent, LoadedConfig};
use crate::unit::ModuleUnit;

const EVENT_CAPACITY: usize = 256;

/// Process-local backend keyed by unit path.
///
/// Seeded from the application configuration's `modules` section. Every mutation
/// publishes the matching [`ConfigEvent`].
pub struct MemoryConfigBackend {
    entries: DashMap<String, ModuleSettings>,
    events: broadcast::Sender<ConfigEvent>,
}

impl Default for MemoryConfigBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    pub fn from_settings<I>(settings: I) -> Self
    where
        I: IntoIterator<Item = (String, ModuleSettings)>,
    {
        let backend = Self::new();
        for (path, s) in settings {
            backend.entries.insert(path, s);
        }
        backend
    }

    /// Seed or overwrite an entry without publishing anything.
    pub fn insert(&self, path: impl Into<String>, settings: ModuleSettings) {
        self.entries.insert(path.into(), settings);
    }

    pub fn settings(&self, path: &str) -> Option<ModuleSettings> {
        self.entries.get(path).map(|e| e.value().clone())
    }

    /// Merge `delta` into the stored config and publish it.
    pub fn publish_config(&self, path: &str, delta: Value) {
        let existed = self.entries.contains_key(path);
        {
            let mut entry = self.entries.entry(path.to_string()).or_default();
            entry.config = deep_merge(&entry.config, &delta);
        }
        let event = if existed {
            ConfigEvent::UpdateConfig {
                path: path.to_string(),
                configuration: delta,
            }
        } else {
            ConfigEvent::NewConfig {
                path: path.to_string(),
                configuration: delta,
            }
        };
        self.emit(event);
    }

    /// Drop the stored config (the enabled flag is kept) and publish the deletion.
    pub fn remove_config(&self, path: &str) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.config = Value::Object(Default::default());
        }
        self.emit(ConfigEvent::DeleteConfig {
            path: path.to_string(),
        });
    }

    pub fn publish_state(&self, path: &str, enabled: bool) {
        self.entries.entry(path.to_string()).or_default().enabled = enabled;
        self.emit(ConfigEvent::UpdateState {
            path: path.to_string(),
            enabled,
        });
    }

    fn emit(&self, event: ConfigEvent) {
        tracing::debug!(path = %event.path(), ?event, "config event");
        // No subscribers is fine: nothing is running yet.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ConfigBackend for MemoryConfigBackend {
    async fn load_config(&self, unit: &ModuleUnit) -> anyhow::Result<LoadedConfig> {
        let id = self.get_module_id(unit);
        Ok(match self.entries.get(&id) {
            Some(e) => LoadedConfig {
                configuration: match &e.config {
                    Value::Null => Value::Object(Default::default()),
                    v => v.clone(),
                },
                enabled: e.enabled,
            },
            None => LoadedConfig::default(),
        })
    }

    async fn save_config(&self, unit: &ModuleUnit, configuration: &Value) -> anyhow::Result<()> {
        let id = self.get_module_id(unit);
        self.publish_config(&id, configuration.clone());
        Ok(())
    }

    async fn get_module_state(&self, unit: &ModuleUnit) -> anyhow::Result<bool> {
        let id = self.get_module_id(unit);
        Ok(self.entries.get(&id).map(|e| e.enabled).unwrap_or(true))
    }

    async fn set_module_state(&self, unit: &ModuleUnit, enabled: bool) -> anyhow::Result<()> {
        let id = self.get_module_id(unit);
        self.publish_state(&id, enabled);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }
}
