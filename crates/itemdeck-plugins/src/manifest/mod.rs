//! Plugin manifest schema
//!
//! The manifest is the JSON document a plugin ships to describe its
//! identity, host compatibility and requested capabilities. Manifests are
//! only ever constructed through [`validator::validate`], which guarantees
//! that the typed value serializes back to the document it was built from.

pub mod policy;
pub mod validator;

pub use validator::{ValidationContext, Validator, validate};

use crate::capability::{Capability, Tier};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Opaque contribution payload, shape owned by the consuming adapter
pub type ContributionPayload = Map<String, Value>;

/// Kind of plugin, used by adapters to decide who consumes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Theme,
    Mechanic,
    Source,
    Settings,
    Bundle,
}

impl PluginType {
    pub const ALL: [PluginType; 5] = [
        PluginType::Theme,
        PluginType::Mechanic,
        PluginType::Source,
        PluginType::Settings,
        PluginType::Bundle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Theme => "theme",
            Self::Mechanic => "mechanic",
            Self::Source => "source",
            Self::Settings => "settings",
            Self::Bundle => "bundle",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Author {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Host compatibility block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Compatibility {
    /// Minimum host version (semver)
    pub min_version: String,
    /// Host version range this plugin supports (semver range)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    /// Tier the author claims; the loader decides the effective tier
    pub tier: Tier,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Dependencies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<BTreeMap<String, String>>,
}

impl Dependencies {
    /// All (plugin id, range, required) triples
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, bool)> {
        let required = self
            .required
            .iter()
            .flatten()
            .map(|(id, range)| (id.as_str(), range.as_str(), true));
        let optional = self
            .optional
            .iter()
            .flatten()
            .map(|(id, range)| (id.as_str(), range.as_str(), false));
        required.chain(optional)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Assets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshots: Option<Vec<String>>,
}

impl Assets {
    /// Every referenced asset path
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        paths.extend(self.icon.as_deref());
        paths.extend(self.banner.as_deref());
        paths.extend(self.screenshots.iter().flatten().map(String::as_str));
        paths
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntryPoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub styles: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

/// Kind of contribution, one per consuming adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionKind {
    Settings,
    Themes,
    Mechanics,
    Sources,
}

impl ContributionKind {
    pub const ALL: [ContributionKind; 4] = [
        ContributionKind::Settings,
        ContributionKind::Themes,
        ContributionKind::Mechanics,
        ContributionKind::Sources,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::Themes => "themes",
            Self::Mechanics => "mechanics",
            Self::Sources => "sources",
        }
    }
}

/// A contribution handed to an adapter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution<'a> {
    pub kind: ContributionKind,
    pub payload: &'a ContributionPayload,
}

impl Contribution<'_> {
    /// Decode the payload into the adapter's own schema
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Contributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Vec<ContributionPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub themes: Option<Vec<ContributionPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanics: Option<Vec<ContributionPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<ContributionPayload>>,
}

impl Contributes {
    pub fn of_kind(&self, kind: ContributionKind) -> &[ContributionPayload] {
        let list = match kind {
            ContributionKind::Settings => &self.settings,
            ContributionKind::Themes => &self.themes,
            ContributionKind::Mechanics => &self.mechanics,
            ContributionKind::Sources => &self.sources,
        };
        list.as_deref().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = Contribution<'_>> {
        ContributionKind::ALL.into_iter().flat_map(move |kind| {
            self.of_kind(kind)
                .iter()
                .map(move |payload| Contribution { kind, payload })
        })
    }
}

/// Immutable plugin declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PluginManifest {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: Author,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    pub itemdeck: Compatibility,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Dependencies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Assets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigRefs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryPoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributes: Option<Contributes>,
}

impl PluginManifest {
    pub fn plugin_type(&self) -> PluginType {
        self.itemdeck.plugin_type
    }

    pub fn declared_tier(&self) -> Tier {
        self.itemdeck.tier
    }

    pub fn declared_capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities.iter().copied().collect()
    }

    pub fn declares(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Parsed plugin version; validated manifests always parse
    pub fn semver(&self) -> Option<semver::Version> {
        semver::Version::parse(&self.version).ok()
    }

    pub fn contributions(&self) -> impl Iterator<Item = Contribution<'_>> {
        self.contributes.iter().flat_map(Contributes::iter)
    }

    pub fn to_value(&self) -> Value {
        // Plain data with string keys; serialization cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "id": "org.itemdeck.theme-retro",
            "name": "Retro",
            "version": "1.0.0",
            "description": "Retro card theme",
            "author": { "name": "Itemdeck" },
            "itemdeck": { "minVersion": "0.1.0", "type": "theme", "tier": "builtin" },
            "capabilities": ["storage:local"],
            "contributes": {
                "themes": [{ "id": "retro", "palette": "amber" }],
                "settings": [{ "key": "retro.scanlines", "type": "boolean" }]
            }
        })
    }

    #[test]
    fn test_manifest_serialization_round_trip() {
        let value = sample();
        let manifest: PluginManifest = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(manifest.to_value(), value);
        assert_eq!(manifest.plugin_type(), PluginType::Theme);
        assert!(manifest.declares(Capability::StorageLocal));
    }

    #[test]
    fn test_contributions_are_tagged_by_kind() {
        let manifest: PluginManifest = serde_json::from_value(sample()).unwrap();
        let kinds: Vec<_> = manifest.contributions().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ContributionKind::Settings, ContributionKind::Themes]);

        #[derive(Deserialize)]
        struct ThemeContribution {
            id: String,
            palette: String,
        }

        let theme = manifest
            .contributions()
            .find(|c| c.kind == ContributionKind::Themes)
            .unwrap();
        let parsed: ThemeContribution = theme.parse().unwrap();
        assert_eq!(parsed.id, "retro");
        assert_eq!(parsed.palette, "amber");
    }

    #[test]
    fn test_dependencies_iter_marks_required() {
        let deps = Dependencies {
            required: Some(BTreeMap::from([("org.a.b".to_string(), "^1.0.0".to_string())])),
            optional: Some(BTreeMap::from([("org.c.d".to_string(), "~2.1".to_string())])),
        };
        let all: Vec<_> = deps.iter().collect();
        assert_eq!(all, vec![("org.a.b", "^1.0.0", true), ("org.c.d", "~2.1", false)]);
    }

    #[test]
    fn test_assets_paths() {
        let assets = Assets {
            icon: Some("icon.png".into()),
            banner: None,
            screenshots: Some(vec!["a.png".into(), "b.png".into()]),
        };
        assert_eq!(assets.paths(), vec!["icon.png", "a.png", "b.png"]);
    }
}
