//! Installed plugin set and per-type activation

use crate::error::{PluginError, PluginResult};
use crate::loader::LoadedPlugin;
use crate::manifest::PluginType;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct RegistryState {
    plugins: BTreeMap<String, Arc<LoadedPlugin>>,
    active: HashMap<PluginType, String>,
}

/// Plugins the user has installed, and which one is active per type
#[derive(Default)]
pub struct PluginRegistry {
    state: RwLock<RegistryState>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install or update a plugin.
    ///
    /// A plugin id stays bound to the source it was first installed from;
    /// installing the same id from another source fails.
    pub fn install(&self, plugin: Arc<LoadedPlugin>) -> PluginResult<()> {
        let mut state = self.write();
        if let Some(existing) = state.plugins.get(plugin.id()) {
            if existing.source_key != plugin.source_key {
                return Err(PluginError::DuplicatePlugin(plugin.id().to_string()));
            }
            tracing::info!(
                plugin_id = %plugin.id(),
                from = %existing.manifest.version,
                to = %plugin.manifest.version,
                "Plugin updated"
            );
        } else {
            tracing::info!(plugin_id = %plugin.id(), tier = %plugin.tier, "Plugin installed");
        }
        state.plugins.insert(plugin.id().to_string(), plugin);
        Ok(())
    }

    /// Remove a plugin, deactivating it if it was active
    pub fn uninstall(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        let mut state = self.write();
        let removed = state.plugins.remove(plugin_id)?;
        state.active.retain(|_, active| active != plugin_id);
        tracing::info!(plugin_id = %plugin_id, "Plugin uninstalled");
        Some(removed)
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        self.read().plugins.get(plugin_id).cloned()
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.read().plugins.contains_key(plugin_id)
    }

    pub fn list(&self) -> Vec<Arc<LoadedPlugin>> {
        self.read().plugins.values().cloned().collect()
    }

    pub fn list_by_type(&self, plugin_type: PluginType) -> Vec<Arc<LoadedPlugin>> {
        self.read()
            .plugins
            .values()
            .filter(|p| p.plugin_type() == plugin_type)
            .cloned()
            .collect()
    }

    /// Make a plugin the active one of its type, returning the id it
    /// replaced
    pub fn activate(&self, plugin_id: &str) -> PluginResult<Option<String>> {
        let mut state = self.write();
        let plugin_type = state
            .plugins
            .get(plugin_id)
            .map(|p| p.plugin_type())
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        let previous = state.active.insert(plugin_type, plugin_id.to_string());
        tracing::debug!(plugin_id = %plugin_id, plugin_type = %plugin_type, "Plugin activated");
        Ok(previous.filter(|prev| prev != plugin_id))
    }

    pub fn active(&self, plugin_type: PluginType) -> Option<Arc<LoadedPlugin>> {
        let state = self.read();
        state
            .active
            .get(&plugin_type)
            .and_then(|id| state.plugins.get(id))
            .cloned()
    }

    pub fn deactivate(&self, plugin_type: PluginType) -> Option<String> {
        self.write().active.remove(&plugin_type)
    }

    pub fn len(&self) -> usize {
        self.read().plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().plugins.is_empty()
    }
}
