//! Built-in plugin registry
//!
//! Manifests shipped with the host. They are validated once at
//! registration with the builtin tier and never touch the network or the
//! cache.

use crate::capability::Tier;
use crate::error::{PluginError, PluginResult};
use crate::loader::PluginSource;
use crate::manifest::{PluginManifest, Validator};
use semver::Version;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const THEME_RETRO: &str = "org.itemdeck.theme-retro";
pub const THEME_MODERN: &str = "org.itemdeck.theme-modern";
pub const MECHANIC_MEMORY: &str = "org.itemdeck.mechanic-memory";
pub const MECHANIC_QUIZ: &str = "org.itemdeck.mechanic-quiz";
pub const MECHANIC_COMPETING: &str = "org.itemdeck.mechanic-competing";

fn first_party(id: &str, name: &str, kind: &str, description: &str, capabilities: Value, contributes: Value) -> Value {
    json!({
        "id": id,
        "name": name,
        "version": "1.0.0",
        "description": description,
        "author": { "name": "Itemdeck", "url": "https://itemdeck.app" },
        "licence": "MIT",
        "itemdeck": { "minVersion": "0.1.0", "type": kind, "tier": "builtin" },
        "capabilities": capabilities,
        "contributes": contributes
    })
}

/// Manifests of the first-party themes and mechanics
pub fn default_manifests() -> Vec<Value> {
    vec![
        first_party(
            THEME_RETRO,
            "Retro",
            "theme",
            "Pixel fonts, chunky borders and a CRT glow",
            json!(["storage:local"]),
            json!({
                "themes": [{ "id": "retro", "font": "pixel", "borderRadius": 0, "glow": true }],
                "settings": [{ "key": "retro.scanlines", "type": "boolean", "default": false }]
            }),
        ),
        first_party(
            THEME_MODERN,
            "Modern",
            "theme",
            "Clean cards with soft shadows",
            json!(["storage:local"]),
            json!({
                "themes": [{ "id": "modern", "font": "system", "borderRadius": 12, "shadow": "soft" }]
            }),
        ),
        first_party(
            MECHANIC_MEMORY,
            "Memory",
            "mechanic",
            "Flip cards and find matching pairs",
            json!(["storage:local", "collection:read", "audio:play", "ui:overlay"]),
            json!({
                "mechanics": [{ "id": "memory", "minCards": 4, "pairs": true }],
                "settings": [{ "key": "memory.pairCount", "type": "number", "default": 8 }]
            }),
        ),
        first_party(
            MECHANIC_QUIZ,
            "Quiz",
            "mechanic",
            "Answer questions about the cards in a collection",
            json!(["storage:local", "collection:read", "ui:modal"]),
            json!({
                "mechanics": [{ "id": "quiz", "questionTypes": ["name", "field"] }]
            }),
        ),
        first_party(
            MECHANIC_COMPETING,
            "Competing",
            "mechanic",
            "Compare card statistics head to head",
            json!(["storage:local", "collection:read", "audio:play", "ui:overlay"]),
            json!({
                "mechanics": [{ "id": "competing", "rounds": 10 }]
            }),
        ),
    ]
}

/// Pre-trusted manifests consulted before any network path
#[derive(Debug, Clone)]
pub struct BuiltinRegistry {
    validator: Validator,
    plugins: BTreeMap<String, Arc<PluginManifest>>,
}

impl BuiltinRegistry {
    /// Empty registry validating against `host_version`
    pub fn new(host_version: Version) -> PluginResult<Self> {
        Ok(Self {
            validator: Validator::new(host_version)?,
            plugins: BTreeMap::new(),
        })
    }

    /// Registry holding the first-party plugins
    pub fn with_defaults(host_version: Version) -> PluginResult<Self> {
        let mut registry = Self::new(host_version)?;
        for manifest in default_manifests() {
            registry.register(manifest)?;
        }
        Ok(registry)
    }

    /// Validate and admit a manifest
    pub fn register(&mut self, raw: Value) -> PluginResult<Arc<PluginManifest>> {
        let manifest = Arc::new(self.validator.validate(&raw, Tier::Builtin)?);
        if self.plugins.contains_key(&manifest.id) {
            return Err(PluginError::DuplicatePlugin(manifest.id.clone()));
        }

        tracing::debug!(plugin_id = %manifest.id, "Registered builtin plugin");
        self.plugins.insert(manifest.id.clone(), manifest.clone());
        Ok(manifest)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginManifest>> {
        self.plugins.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    /// Manifests ordered by id
    pub fn list(&self) -> Vec<Arc<PluginManifest>> {
        self.plugins.values().cloned().collect()
    }

    /// Sources for eager resolution at startup
    pub fn sources(&self) -> Vec<PluginSource> {
        self.plugins.keys().map(|id| PluginSource::builtin(id.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
