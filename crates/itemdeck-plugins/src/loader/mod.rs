//! Plugin loader
//!
//! Resolves a [`PluginSource`] to a [`LoadedPlugin`]:
//!
//! 1. compute the canonical source key
//! 2. join the in-flight pipeline for that key, or start one
//! 3. serve a fresh cached manifest, otherwise fetch, validate with the
//!    source's tier and write the result through to the cache
//! 4. evaluate the declared capabilities with the permission manager
//!
//! Pipelines run on their own tokio task. A caller that stops waiting does
//! not cancel the fetch or the cache write, and the in-flight entry is
//! removed when the pipeline settles whatever its outcome.

pub mod fetch;
pub mod source;

pub use fetch::{DefaultFetcher, FetchOutcome, FetchedManifest, ManifestFetcher};
pub use source::{PluginSource, TierPolicy, normalize_url};

use crate::cache::{CachedManifest, PluginCache};
use crate::capability::{Capability, PermissionManager, Tier};
use crate::error::{PluginError, PluginResult};
use crate::manifest::{EntryPoints, PluginManifest, PluginType, Validator};
use crate::registry::BuiltinRegistry;
use crate::signature::TrustedKeys;
use chrono::Duration;
use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};
use semver::Version;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

type SharedLoad = Shared<BoxFuture<'static, PluginResult<Arc<LoadedPlugin>>>>;

/// Entry points resolved against the plugin's source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub styles: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl ResolvedEntry {
    /// Join relative entry paths onto the manifest URL; builtin entries stay
    /// relative to the host bundle
    fn resolve(entry: Option<&EntryPoints>, base: Option<&Url>) -> PluginResult<Self> {
        let Some(entry) = entry else {
            return Ok(Self::default());
        };
        let join = |path: &Option<String>| -> PluginResult<Option<String>> {
            match (path, base) {
                (Some(path), Some(base)) => base
                    .join(path)
                    .map(|url| Some(url.to_string()))
                    .map_err(|e| PluginError::Fetch(format!("Cannot resolve entry '{}': {}", path, e))),
                (path, _) => Ok(path.clone()),
            }
        };
        Ok(Self {
            main: join(&entry.main)?,
            styles: join(&entry.styles)?,
            worker: join(&entry.worker)?,
        })
    }
}

/// A validated plugin ready for its adapter
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedPlugin {
    pub manifest: Arc<PluginManifest>,
    pub tier: Tier,
    pub source_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Capabilities usable right now
    pub granted: BTreeSet<Capability>,
    /// Capabilities whose features stay disabled until the user decides
    pub pending_consent: BTreeSet<Capability>,
    pub entry: ResolvedEntry,
    pub from_cache: bool,
    /// Served from an expired cache entry because the source was unreachable
    pub stale: bool,
}

impl LoadedPlugin {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn plugin_type(&self) -> PluginType {
        self.manifest.plugin_type()
    }

    pub fn is_granted(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }
}

struct InFlight {
    ticket: u64,
    load: SharedLoad,
}

struct LoaderInner {
    builtins: Arc<BuiltinRegistry>,
    cache: Arc<PluginCache>,
    permissions: Arc<PermissionManager>,
    fetcher: Arc<dyn ManifestFetcher>,
    validator: Validator,
    tier_policy: TierPolicy,
    manifest_ttl: Option<Duration>,
    offline_fallback: bool,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_ticket: AtomicU64,
}

/// Builder for [`PluginLoader`]
pub struct PluginLoaderBuilder {
    builtins: Option<Arc<BuiltinRegistry>>,
    cache: Option<Arc<PluginCache>>,
    permissions: Option<Arc<PermissionManager>>,
    fetcher: Option<Arc<dyn ManifestFetcher>>,
    host_version: Option<Version>,
    curated_hosts: Vec<String>,
    trusted_keys: TrustedKeys,
    manifest_ttl: Option<Duration>,
    offline_fallback: bool,
}

impl PluginLoaderBuilder {
    pub fn new() -> Self {
        Self {
            builtins: None,
            cache: None,
            permissions: None,
            fetcher: None,
            host_version: None,
            curated_hosts: Vec::new(),
            trusted_keys: TrustedKeys::default(),
            manifest_ttl: None,
            offline_fallback: false,
        }
    }

    pub fn builtins(mut self, builtins: Arc<BuiltinRegistry>) -> Self {
        self.builtins = Some(builtins);
        self
    }

    pub fn cache(mut self, cache: Arc<PluginCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn permissions(mut self, permissions: Arc<PermissionManager>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ManifestFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Host version checked against `itemdeck.minVersion`/`maxVersion`
    pub fn host_version(mut self, version: Version) -> Self {
        self.host_version = Some(version);
        self
    }

    pub fn curated_hosts(mut self, hosts: Vec<String>) -> Self {
        self.curated_hosts = hosts;
        self
    }

    pub fn trusted_keys(mut self, keys: TrustedKeys) -> Self {
        self.trusted_keys = keys;
        self
    }

    /// TTL for freshly fetched manifests, the cache default otherwise
    pub fn manifest_ttl(mut self, ttl: Duration) -> Self {
        self.manifest_ttl = Some(ttl);
        self
    }

    pub fn offline_fallback(mut self, enabled: bool) -> Self {
        self.offline_fallback = enabled;
        self
    }

    pub fn build(self) -> PluginResult<PluginLoader> {
        let cache = self
            .cache
            .ok_or_else(|| PluginError::Config("Plugin loader requires a cache".to_string()))?;
        let permissions = self
            .permissions
            .unwrap_or_else(|| Arc::new(PermissionManager::new(cache.store().clone())));
        let host_version = match self.host_version {
            Some(version) => version,
            None => crate::host_version()?,
        };
        let builtins = match self.builtins {
            Some(builtins) => builtins,
            None => Arc::new(BuiltinRegistry::new(host_version.clone())?),
        };
        let fetcher: Arc<dyn ManifestFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(DefaultFetcher::new(
                std::time::Duration::from_secs(fetch::DEFAULT_FETCH_TIMEOUT_SECS),
                fetch::DEFAULT_MAX_MANIFEST_BYTES,
            )?),
        };

        Ok(PluginLoader {
            inner: Arc::new(LoaderInner {
                builtins,
                cache,
                permissions,
                fetcher,
                validator: Validator::new(host_version)?,
                tier_policy: TierPolicy::new(&self.curated_hosts, self.trusted_keys),
                manifest_ttl: self.manifest_ttl,
                offline_fallback: self.offline_fallback,
                in_flight: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
            }),
        })
    }
}

impl Default for PluginLoaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Deduplicating plugin loader; clones share the same state
#[derive(Clone)]
pub struct PluginLoader {
    inner: Arc<LoaderInner>,
}

impl PluginLoader {
    pub fn builder() -> PluginLoaderBuilder {
        PluginLoaderBuilder::new()
    }

    pub fn cache(&self) -> &Arc<PluginCache> {
        &self.inner.cache
    }

    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.inner.permissions
    }

    pub fn builtins(&self) -> &Arc<BuiltinRegistry> {
        &self.inner.builtins
    }

    /// Number of pipelines currently running
    pub fn in_flight(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    /// Load a plugin, joining any pipeline already running for the same
    /// source key
    pub async fn load(&self, source: &PluginSource) -> PluginResult<Arc<LoadedPlugin>> {
        let key = source.source_key();
        let load = {
            let mut in_flight = self.inner.lock_in_flight();
            match in_flight.get(&key) {
                Some(running) => {
                    tracing::debug!(source_key = %key, "Joining in-flight plugin load");
                    running.load.clone()
                }
                None => {
                    let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
                    let load = self.spawn_pipeline(source.clone(), key.clone(), ticket);
                    in_flight.insert(
                        key,
                        InFlight {
                            ticket,
                            load: load.clone(),
                        },
                    );
                    load
                }
            }
        };
        load.await
    }

    fn spawn_pipeline(&self, source: PluginSource, key: String, ticket: u64) -> SharedLoad {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let result = inner.run_pipeline(&source, &key).await.map(Arc::new);
            if let Err(err) = &result {
                tracing::warn!(source_key = %key, error = %err, "Plugin load failed");
            }
            inner.settle(&key, ticket);
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(PluginError::Fetch(format!("Plugin load task failed: {}", e))))
        }
        .boxed()
        .shared()
    }

    /// Resolve several sources concurrently
    pub async fn preload(&self, sources: &[PluginSource]) -> Vec<(PluginSource, PluginResult<Arc<LoadedPlugin>>)> {
        let loads = sources.iter().map(|source| async move {
            (source.clone(), self.load(source).await)
        });
        join_all(loads).await
    }

    /// Load every builtin plugin
    pub async fn preload_builtins(&self) -> Vec<(PluginSource, PluginResult<Arc<LoadedPlugin>>)> {
        let sources = self.inner.builtins.sources();
        self.preload(&sources).await
    }

    /// Drop the cached data and capability decisions of an uninstalled
    /// plugin
    pub async fn forget(&self, plugin_id: &str) -> PluginResult<()> {
        self.inner.cache.clear_plugin_cache(plugin_id).await?;
        self.inner.permissions.forget_plugin(plugin_id).await?;
        Ok(())
    }
}

impl LoaderInner {
    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove the in-flight entry unless a newer pipeline replaced it
    fn settle(&self, key: &str, ticket: u64) {
        let mut in_flight = self.lock_in_flight();
        if in_flight.get(key).is_some_and(|running| running.ticket == ticket) {
            in_flight.remove(key);
        }
    }

    async fn run_pipeline(&self, source: &PluginSource, key: &str) -> PluginResult<LoadedPlugin> {
        match source {
            PluginSource::Builtin(id) => {
                let manifest = self
                    .builtins
                    .get(id)
                    .ok_or_else(|| PluginError::NotFound(source.to_string()))?;
                self.finish(manifest, Tier::Builtin, key, None, None, false, false)
                    .await
            }
            PluginSource::Url(url) => self.load_url(source, url, key).await,
        }
    }

    async fn load_url(&self, source: &PluginSource, url: &Url, key: &str) -> PluginResult<LoadedPlugin> {
        let normalized = normalize_url(url);
        let now = self.cache.now();

        let cached = self
            .cache
            .get_cached_manifest_for_source(&normalized, true)
            .await?;
        let stale = match cached {
            Some(entry) if !entry.is_expired(now) => {
                tracing::debug!(source_key = %key, plugin_id = %entry.plugin_id, "Manifest cache hit");
                return self.finish_cached(entry, url, key, false).await;
            }
            other => other,
        };

        let etag = stale.as_ref().and_then(|entry| entry.etag.as_deref());
        let outcome = self.fetcher.fetch(url, etag).await;
        let fetched = match outcome {
            Ok(FetchOutcome::Fresh(fetched)) => fetched,
            Ok(FetchOutcome::NotModified) => {
                let entry = stale.ok_or_else(|| {
                    PluginError::Fetch(format!("{} reported not modified without a cached copy", url))
                })?;
                tracing::debug!(source_key = %key, "Manifest not modified, refreshing TTL");
                let refreshed = self
                    .cache
                    .cache_manifest_with_etag(
                        &entry.manifest,
                        entry.tier,
                        Some(&normalized),
                        self.manifest_ttl,
                        entry.etag.as_deref(),
                    )
                    .await?;
                return self.finish_cached(refreshed, url, key, false).await;
            }
            Err(err @ PluginError::Fetch(_)) if self.offline_fallback && stale.is_some() => {
                tracing::warn!(source_key = %key, error = %err, "Source unreachable, serving stale manifest");
                return match stale {
                    Some(entry) => self.finish_cached(entry, url, key, true).await,
                    None => Err(err),
                };
            }
            Err(err) => return Err(err),
        };

        let tier = self
            .tier_policy
            .resolve(source, &fetched.bytes, fetched.signature.as_deref())?;
        let manifest = self.validator.validate_bytes(&fetched.bytes, tier)?;
        if self.builtins.contains(&manifest.id) {
            return Err(PluginError::DuplicatePlugin(manifest.id));
        }

        self.cache
            .cache_manifest_with_etag(
                &manifest,
                tier,
                Some(&normalized),
                self.manifest_ttl,
                fetched.etag.as_deref(),
            )
            .await?;

        self.finish(Arc::new(manifest), tier, key, Some(normalized), Some(url), false, false)
            .await
    }

    async fn finish_cached(
        &self,
        entry: CachedManifest,
        url: &Url,
        key: &str,
        stale: bool,
    ) -> PluginResult<LoadedPlugin> {
        self.finish(
            Arc::new(entry.manifest),
            entry.tier,
            key,
            entry.source_url,
            Some(url),
            true,
            stale,
        )
        .await
    }

    async fn finish(
        &self,
        manifest: Arc<PluginManifest>,
        tier: Tier,
        key: &str,
        source_url: Option<String>,
        base: Option<&Url>,
        from_cache: bool,
        stale: bool,
    ) -> PluginResult<LoadedPlugin> {
        let snapshot = self
            .permissions
            .sync_plugin(&manifest.id, tier, &manifest.declared_capabilities())
            .await?;

        // Relative to the URL as requested; the normalized form drops a
        // directory's trailing slash
        let entry = ResolvedEntry::resolve(manifest.entry.as_ref(), base)?;

        tracing::info!(
            plugin_id = %manifest.id,
            version = %manifest.version,
            tier = %tier,
            from_cache = from_cache,
            stale = stale,
            granted = snapshot.granted.len(),
            pending = snapshot.pending_consent.len(),
            "Plugin loaded"
        );

        Ok(LoadedPlugin {
            manifest,
            tier,
            source_key: key.to_string(),
            source_url,
            granted: snapshot.granted,
            pending_consent: snapshot.pending_consent,
            entry,
            from_cache,
            stale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct StaticFetcher {
        body: Vec<u8>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ManifestFetcher for StaticFetcher {
        async fn fetch(&self, _url: &Url, _etag: Option<&str>) -> PluginResult<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchOutcome::Fresh(FetchedManifest {
                bytes: self.body.clone(),
                etag: None,
                signature: None,
            }))
        }
    }

    fn loader_with(body: serde_json::Value) -> (PluginLoader, Arc<StaticFetcher>) {
        let fetcher = Arc::new(StaticFetcher {
            body: serde_json::to_vec(&body).unwrap(),
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(PluginCache::new(Arc::new(MemoryStore::new())));
        let loader = PluginLoader::builder()
            .cache(cache)
            .builtins(Arc::new(BuiltinRegistry::with_defaults(Version::new(0, 1, 0)).unwrap()))
            .host_version(Version::new(0, 1, 0))
            .fetcher(fetcher.clone())
            .build()
            .unwrap();
        (loader, fetcher)
    }

    fn remote_manifest() -> serde_json::Value {
        json!({
            "id": "org.example.remote-theme",
            "name": "Remote",
            "version": "0.3.0",
            "description": "Fetched theme",
            "author": { "name": "Someone" },
            "itemdeck": { "minVersion": "0.1.0", "type": "theme", "tier": "community" },
            "capabilities": ["storage:local", "ui:toolbar"],
            "entry": { "main": "dist/index.js" }
        })
    }

    #[tokio::test]
    async fn test_builtin_load_skips_fetch() {
        let (loader, fetcher) = loader_with(remote_manifest());
        let plugin = loader
            .load(&PluginSource::builtin("org.itemdeck.theme-retro"))
            .await
            .unwrap();

        assert_eq!(plugin.tier, Tier::Builtin);
        assert!(plugin.is_granted(Capability::StorageLocal));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(loader.cache().get_cache_stats().await.unwrap().manifest_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_builtin_is_not_found() {
        let (loader, _) = loader_with(remote_manifest());
        let err = loader
            .load(&PluginSource::builtin("org.itemdeck.missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
        assert_eq!(loader.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_url_load_resolves_entry_and_caches() {
        let (loader, fetcher) = loader_with(remote_manifest());
        let source = PluginSource::url("https://plugins.example.org/remote/manifest.json").unwrap();

        let first = loader.load(&source).await.unwrap();
        assert_eq!(first.tier, Tier::Community);
        assert!(!first.from_cache);
        assert_eq!(
            first.entry.main.as_deref(),
            Some("https://plugins.example.org/remote/dist/index.js")
        );
        assert!(first.pending_consent.contains(&Capability::UiToolbar));

        let second = loader.load(&source).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.manifest, first.manifest);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_directory_source_resolves_entry_inside_directory() {
        let mut manifest = remote_manifest();
        manifest["entry"] = json!({ "main": "main.js" });
        let (loader, _) = loader_with(manifest);
        let source = PluginSource::url("https://h.example/plugins/retro/").unwrap();

        let fresh = loader.load(&source).await.unwrap();
        assert_eq!(fresh.source_url.as_deref(), Some("https://h.example/plugins/retro"));
        assert_eq!(fresh.entry.main.as_deref(), Some("https://h.example/plugins/retro/main.js"));

        let cached = loader.load(&source).await.unwrap();
        assert!(cached.from_cache);
        assert_eq!(cached.entry.main, fresh.entry.main);
    }

    #[tokio::test]
    async fn test_url_cannot_shadow_builtin() {
        let mut manifest = remote_manifest();
        manifest["id"] = json!("org.itemdeck.theme-retro");
        let (loader, _) = loader_with(manifest);

        let err = loader
            .load(&PluginSource::url("https://example.org/retro.json").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::DuplicatePlugin(_)));
    }

    #[test]
    fn test_builder_requires_cache() {
        assert!(matches!(
            PluginLoader::builder().build(),
            Err(PluginError::Config(_))
        ));
    }
}
