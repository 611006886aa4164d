//! Persistent plugin cache
//!
//! Write-through cache over a [`KvStore`] holding validated manifests
//! (with a TTL), binary assets, plugin configuration and one aggregate
//! statistics record. Statistics are recomputed from the stores after
//! every mutation, with mutations serialized so the persisted record
//! always matches the stores.
//!
//! Assets are bounded by an optional byte budget. When the total exceeds
//! it, the oldest assets by `cachedAt` are evicted first.

pub mod types;

pub use types::{CacheStats, CachedAsset, CachedConfig, CachedManifest, MaintenanceReport};

use crate::capability::Tier;
use crate::clock::{Clock, SystemClock};
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::storage::{IndexValue, KvStore, StoredRecord, Table, index};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default manifest time-to-live, seven days
pub const DEFAULT_MANIFEST_TTL_SECS: i64 = 7 * 24 * 60 * 60;

const STATS_KEY: &str = "stats";

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub struct PluginCache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    max_asset_bytes: Option<u64>,
    /// Held across a mutation and its stats refresh
    writes: Mutex<()>,
}

impl PluginCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            default_ttl: Duration::seconds(DEFAULT_MANIFEST_TTL_SECS),
            max_asset_bytes: None,
            writes: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_asset_budget(mut self, max_bytes: u64) -> Self {
        self.max_asset_bytes = Some(max_bytes);
        self
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---------------------------------------------------------------------
    // Manifests
    // ---------------------------------------------------------------------

    /// Upsert a manifest with a fresh TTL (the default when `ttl` is None)
    pub async fn cache_manifest(
        &self,
        manifest: &PluginManifest,
        tier: Tier,
        source_url: Option<&str>,
        ttl: Option<Duration>,
    ) -> PluginResult<CachedManifest> {
        self.cache_manifest_with_etag(manifest, tier, source_url, ttl, None)
            .await
    }

    pub async fn cache_manifest_with_etag(
        &self,
        manifest: &PluginManifest,
        tier: Tier,
        source_url: Option<&str>,
        ttl: Option<Duration>,
        etag: Option<&str>,
    ) -> PluginResult<CachedManifest> {
        let _writing = self.writes.lock().await;
        let now = self.clock.now();
        let entry = CachedManifest {
            plugin_id: manifest.id.clone(),
            manifest: manifest.clone(),
            tier,
            source_url: source_url.map(str::to_string),
            cached_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
            etag: etag.map(str::to_string),
        };

        let record = StoredRecord::new(&entry.plugin_id, serde_json::to_vec(&entry)?)
            .with_index(index::TIER, tier.as_str())
            .with_index(index::EXPIRES_AT, millis(entry.expires_at))
            .with_index(index::CACHED_AT, millis(entry.cached_at))
            .with_index(index::SOURCE_URL, entry.source_url.clone());
        self.store.put(Table::Manifests, record).await?;
        self.refresh_stats().await?;

        tracing::debug!(
            plugin_id = %entry.plugin_id,
            tier = %tier,
            expires_at = %entry.expires_at,
            "Cached manifest"
        );
        Ok(entry)
    }

    /// Cached manifest for a plugin; expired entries read as missing unless
    /// `ignore_expiry` is set
    pub async fn get_cached_manifest(
        &self,
        plugin_id: &str,
        ignore_expiry: bool,
    ) -> PluginResult<Option<CachedManifest>> {
        let Some(record) = self.store.get(Table::Manifests, plugin_id).await? else {
            tracing::debug!(plugin_id = %plugin_id, "Manifest cache miss");
            return Ok(None);
        };
        let Some(entry) = self.decode_manifest(record).await? else {
            return Ok(None);
        };

        if !ignore_expiry && entry.is_expired(self.clock.now()) {
            tracing::debug!(plugin_id = %plugin_id, "Cached manifest expired");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Most recently cached manifest fetched from `source_url`
    pub async fn get_cached_manifest_for_source(
        &self,
        source_url: &str,
        ignore_expiry: bool,
    ) -> PluginResult<Option<CachedManifest>> {
        let records = self
            .store
            .list_by_index(Table::Manifests, index::SOURCE_URL, &IndexValue::from(source_url))
            .await?;
        let now = self.clock.now();

        let mut newest: Option<CachedManifest> = None;
        for entry in self.decode_manifests(records).await? {
            if !ignore_expiry && entry.is_expired(now) {
                continue;
            }
            if newest.as_ref().is_none_or(|n| entry.cached_at > n.cached_at) {
                newest = Some(entry);
            }
        }
        Ok(newest)
    }

    /// Every cached manifest, optionally filtered by tier
    pub async fn get_all_cached_manifests(
        &self,
        tier: Option<Tier>,
        include_expired: bool,
    ) -> PluginResult<Vec<CachedManifest>> {
        let records = match tier {
            Some(tier) => {
                self.store
                    .list_by_index(Table::Manifests, index::TIER, &IndexValue::from(tier.as_str()))
                    .await?
            }
            None => self.store.list(Table::Manifests).await?,
        };
        let now = self.clock.now();

        Ok(self
            .decode_manifests(records)
            .await?
            .into_iter()
            .filter(|entry| include_expired || !entry.is_expired(now))
            .collect())
    }

    /// Remove expired manifests, walking the expiry index up to now
    pub async fn clear_expired_manifests(&self) -> PluginResult<u64> {
        let _writing = self.writes.lock().await;
        let removed = self.sweep_expired().await?;
        if removed > 0 {
            self.refresh_stats().await?;
        }
        Ok(removed)
    }

    async fn sweep_expired(&self) -> PluginResult<u64> {
        let now = millis(self.clock.now());
        let expired = self
            .store
            .scan_index(
                Table::Manifests,
                index::EXPIRES_AT,
                Bound::Unbounded,
                Bound::Included(IndexValue::Int(now)),
            )
            .await?;

        let mut removed = 0;
        for record in expired {
            if self.store.delete(Table::Manifests, &record.key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(count = removed, "Cleared expired manifests");
        }
        Ok(removed)
    }

    pub async fn delete_cached_manifest(&self, plugin_id: &str) -> PluginResult<bool> {
        let _writing = self.writes.lock().await;
        let removed = self.store.delete(Table::Manifests, plugin_id).await?;
        if removed {
            self.refresh_stats().await?;
        }
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Assets
    // ---------------------------------------------------------------------

    pub async fn cache_asset(
        &self,
        plugin_id: &str,
        asset_path: &str,
        data: Vec<u8>,
        mime_type: &str,
    ) -> PluginResult<CachedAsset> {
        let size = data.len() as u64;
        if let Some(budget) = self.max_asset_bytes.filter(|budget| size > *budget) {
            return Err(PluginError::Storage(format!(
                "asset '{}' of plugin '{}' is {} bytes, larger than the {} byte cache budget",
                asset_path, plugin_id, size, budget
            )));
        }

        let _writing = self.writes.lock().await;
        let asset = CachedAsset {
            key: CachedAsset::key_for(plugin_id, asset_path),
            plugin_id: plugin_id.to_string(),
            asset_path: asset_path.to_string(),
            data,
            mime_type: mime_type.to_string(),
            size,
            cached_at: self.clock.now(),
        };

        let record = StoredRecord::new(&asset.key, serde_json::to_vec(&asset)?)
            .with_index(index::PLUGIN_ID, plugin_id)
            .with_index(index::CACHED_AT, millis(asset.cached_at))
            .with_index(index::SIZE, size as i64);
        self.store.put(Table::Assets, record).await?;

        self.evict_assets(Some(&asset.key)).await?;
        self.refresh_stats().await?;
        Ok(asset)
    }

    pub async fn get_cached_asset(
        &self,
        plugin_id: &str,
        asset_path: &str,
    ) -> PluginResult<Option<CachedAsset>> {
        let key = CachedAsset::key_for(plugin_id, asset_path);
        match self.store.get(Table::Assets, &key).await? {
            Some(record) => self.decode(Table::Assets, record).await,
            None => Ok(None),
        }
    }

    pub async fn get_plugin_assets(&self, plugin_id: &str) -> PluginResult<Vec<CachedAsset>> {
        let records = self
            .store
            .list_by_index(Table::Assets, index::PLUGIN_ID, &IndexValue::from(plugin_id))
            .await?;
        let mut assets = Vec::with_capacity(records.len());
        for record in records {
            assets.extend(self.decode::<CachedAsset>(Table::Assets, record).await?);
        }
        Ok(assets)
    }

    pub async fn delete_cached_asset(&self, plugin_id: &str, asset_path: &str) -> PluginResult<bool> {
        let _writing = self.writes.lock().await;
        let key = CachedAsset::key_for(plugin_id, asset_path);
        let removed = self.store.delete(Table::Assets, &key).await?;
        if removed {
            self.refresh_stats().await?;
        }
        Ok(removed)
    }

    /// Evict oldest assets until the total fits the budget
    pub async fn enforce_asset_budget(&self) -> PluginResult<u64> {
        let _writing = self.writes.lock().await;
        let evicted = self.evict_assets(None).await?;
        if evicted > 0 {
            self.refresh_stats().await?;
        }
        Ok(evicted)
    }

    async fn evict_assets(&self, keep: Option<&str>) -> PluginResult<u64> {
        let Some(budget) = self.max_asset_bytes else {
            return Ok(0);
        };
        let mut total = self.store.sum_index(Table::Assets, index::SIZE).await?.max(0) as u64;
        if total <= budget {
            return Ok(0);
        }

        let oldest_first = self
            .store
            .scan_index(Table::Assets, index::CACHED_AT, Bound::Unbounded, Bound::Unbounded)
            .await?;

        let mut evicted = 0;
        for record in oldest_first {
            if total <= budget {
                break;
            }
            if keep == Some(record.key.as_str()) {
                continue;
            }
            let size = match record.index(index::SIZE) {
                IndexValue::Int(size) => size.max(0) as u64,
                _ => 0,
            };
            if self.store.delete(Table::Assets, &record.key).await? {
                total = total.saturating_sub(size);
                evicted += 1;
                tracing::debug!(key = %record.key, size = size, "Evicted cached asset");
            }
        }

        tracing::info!(count = evicted, total_size = total, budget = budget, "Asset budget enforced");
        Ok(evicted)
    }

    // ---------------------------------------------------------------------
    // Configs
    // ---------------------------------------------------------------------

    /// Store a plugin's configuration, replacing any previous value
    pub async fn cache_config(&self, plugin_id: &str, config: Value) -> PluginResult<CachedConfig> {
        let _writing = self.writes.lock().await;
        let entry = CachedConfig {
            plugin_id: plugin_id.to_string(),
            config,
            updated_at: self.clock.now(),
        };
        let record = StoredRecord::new(plugin_id, serde_json::to_vec(&entry)?)
            .with_index(index::UPDATED_AT, millis(entry.updated_at));
        self.store.put(Table::Configs, record).await?;
        self.refresh_stats().await?;
        Ok(entry)
    }

    pub async fn get_cached_config(&self, plugin_id: &str) -> PluginResult<Option<CachedConfig>> {
        match self.store.get(Table::Configs, plugin_id).await? {
            Some(record) => self.decode(Table::Configs, record).await,
            None => Ok(None),
        }
    }

    pub async fn delete_cached_config(&self, plugin_id: &str) -> PluginResult<bool> {
        let _writing = self.writes.lock().await;
        let removed = self.store.delete(Table::Configs, plugin_id).await?;
        if removed {
            self.refresh_stats().await?;
        }
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Stats and bulk operations
    // ---------------------------------------------------------------------

    /// Current statistics
    ///
    /// Read under the write lock, so the record is never observed between
    /// a mutation and its refresh.
    pub async fn get_cache_stats(&self) -> PluginResult<CacheStats> {
        let _writing = self.writes.lock().await;
        let Some(record) = self.store.get(Table::Stats, STATS_KEY).await? else {
            return self.refresh_stats().await;
        };
        match serde_json::from_slice::<CacheStats>(&record.payload) {
            Ok(stats) => Ok(stats),
            Err(err) => {
                let corruption = PluginError::CacheCorruption {
                    key: format!("{}/{}", Table::Stats, STATS_KEY),
                    reason: err.to_string(),
                };
                tracing::warn!(error = %corruption, "Rebuilding corrupt cache stats");
                self.refresh_stats().await
            }
        }
    }

    /// Recount the stores and persist the result
    pub async fn recompute_stats(&self) -> PluginResult<CacheStats> {
        let _writing = self.writes.lock().await;
        self.refresh_stats().await
    }

    /// Callers hold `writes`
    async fn refresh_stats(&self) -> PluginResult<CacheStats> {
        let stats = CacheStats {
            manifest_count: self.store.count(Table::Manifests).await?,
            asset_count: self.store.count(Table::Assets).await?,
            total_asset_size: self.store.sum_index(Table::Assets, index::SIZE).await?.max(0) as u64,
            updated_at: self.clock.now(),
        };
        let record = StoredRecord::new(STATS_KEY, serde_json::to_vec(&stats)?);
        self.store.put(Table::Stats, record).await?;
        Ok(stats)
    }

    /// Remove the manifest, every asset and the config of one plugin
    pub async fn clear_plugin_cache(&self, plugin_id: &str) -> PluginResult<CacheStats> {
        let _writing = self.writes.lock().await;
        let manifest = self.store.delete(Table::Manifests, plugin_id).await?;

        let assets = self
            .store
            .list_by_index(Table::Assets, index::PLUGIN_ID, &IndexValue::from(plugin_id))
            .await?;
        let mut asset_count = 0;
        for record in assets {
            if self.store.delete(Table::Assets, &record.key).await? {
                asset_count += 1;
            }
        }

        let config = self.store.delete(Table::Configs, plugin_id).await?;

        tracing::info!(
            plugin_id = %plugin_id,
            manifest = manifest,
            assets = asset_count,
            config = config,
            "Cleared plugin cache"
        );
        self.refresh_stats().await
    }

    /// Wipe every store
    pub async fn clear_all_plugin_cache(&self) -> PluginResult<CacheStats> {
        let _writing = self.writes.lock().await;
        let mut removed = 0;
        for table in [Table::Manifests, Table::Assets, Table::Configs, Table::Stats] {
            removed += self.store.clear(table).await?;
        }
        tracing::info!(count = removed, "Cleared all plugin caches");
        self.refresh_stats().await
    }

    /// Expiry sweep plus asset budget enforcement; safe to run repeatedly
    pub async fn perform_cache_maintenance(&self) -> PluginResult<MaintenanceReport> {
        let _writing = self.writes.lock().await;
        let expired_manifests = self.sweep_expired().await?;
        let evicted_assets = self.evict_assets(None).await?;
        let stats = self.refresh_stats().await?;

        tracing::info!(
            expired = expired_manifests,
            evicted = evicted_assets,
            manifests = stats.manifest_count,
            assets = stats.asset_count,
            "Cache maintenance complete"
        );
        Ok(MaintenanceReport {
            expired_manifests,
            evicted_assets,
            stats,
        })
    }

    // ---------------------------------------------------------------------
    // Decoding
    // ---------------------------------------------------------------------

    async fn decode_manifest(&self, record: StoredRecord) -> PluginResult<Option<CachedManifest>> {
        let key = record.key.clone();
        let entry = self.decode::<CachedManifest>(Table::Manifests, record).await?;
        match entry {
            Some(entry) if entry.plugin_id != key || entry.manifest.id != key => {
                self.discard(
                    Table::Manifests,
                    &key,
                    &format!("record holds plugin '{}'", entry.manifest.id),
                )
                .await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn decode_manifests(&self, records: Vec<StoredRecord>) -> PluginResult<Vec<CachedManifest>> {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            entries.extend(self.decode_manifest(record).await?);
        }
        Ok(entries)
    }

    /// Decode a payload; corrupt records are deleted and read as missing
    async fn decode<T: DeserializeOwned>(&self, table: Table, record: StoredRecord) -> PluginResult<Option<T>> {
        match serde_json::from_slice::<T>(&record.payload) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                self.discard(table, &record.key, &err.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn discard(&self, table: Table, key: &str, reason: &str) -> PluginResult<()> {
        let corruption = PluginError::CacheCorruption {
            key: format!("{}/{}", table, key),
            reason: reason.to_string(),
        };
        tracing::warn!(error = %corruption, "Discarding corrupt cache record");
        let _writing = self.writes.lock().await;
        self.store.delete(table, key).await?;
        self.refresh_stats().await?;
        Ok(())
    }
}
