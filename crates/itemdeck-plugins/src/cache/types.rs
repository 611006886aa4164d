//! Cache record types

use crate::capability::Tier;
use crate::manifest::PluginManifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A validated manifest with its expiry metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedManifest {
    pub plugin_id: String,
    pub manifest: PluginManifest,
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl CachedManifest {
    /// Expired from the instant `expires_at` is reached
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Binary asset belonging to a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAsset {
    /// `<plugin id>/<asset path>`
    pub key: String,
    pub plugin_id: String,
    pub asset_path: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub mime_type: String,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
}

impl CachedAsset {
    pub fn key_for(plugin_id: &str, asset_path: &str) -> String {
        format!("{}/{}", plugin_id, asset_path)
    }
}

/// Per-plugin configuration object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedConfig {
    pub plugin_id: String,
    pub config: Value,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate statistics, recomputed from the stores after every mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub manifest_count: u64,
    pub asset_count: u64,
    pub total_asset_size: u64,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a maintenance run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub expired_manifests: u64,
    pub evicted_assets: u64,
    pub stats: CacheStats,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
