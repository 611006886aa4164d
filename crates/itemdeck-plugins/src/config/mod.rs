//! Configuration management with file persistence

use crate::cache::{DEFAULT_MANIFEST_TTL_SECS, PluginCache};
use crate::capability::PermissionManager;
use crate::loader::fetch::{DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_MAX_MANIFEST_BYTES};
use crate::loader::{DefaultFetcher, PluginLoader};
use crate::registry::BuiltinRegistry;
use crate::signature::TrustedKeys;
use crate::storage::{Database, KvStore, SqliteStore};
use anyhow::{Context, anyhow};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "ITEMDECK_CONFIG_DIR";

/// Default asset budget: 50 MiB
pub const DEFAULT_MAX_ASSET_BYTES: u64 = 50 * 1024 * 1024;

const CONFIG_FILE: &str = "plugins.toml";
const DATABASE_FILE: &str = "plugins.db";

/// Plugin subsystem configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Host application version used for compatibility checks
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite file; `<config_dir>/plugins.db` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    pub manifest_ttl_secs: i64,
    pub max_asset_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Hosts whose manifests load with the official tier
    pub curated_hosts: Vec<String>,
    /// Base64 Ed25519 public keys accepted for signed manifests
    pub trusted_keys: Vec<String>,
    pub fetch_timeout_secs: u64,
    pub max_manifest_bytes: usize,
    /// Serve an expired cached manifest when the network is unreachable
    pub offline_fallback: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            manifest_ttl_secs: DEFAULT_MANIFEST_TTL_SECS,
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            curated_hosts: Vec::new(),
            trusted_keys: Vec::new(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_manifest_bytes: DEFAULT_MAX_MANIFEST_BYTES,
            offline_fallback: false,
        }
    }
}

const KEYS: [&str; 9] = [
    "host.version",
    "cache.database_path",
    "cache.manifest_ttl_secs",
    "cache.max_asset_bytes",
    "loader.curated_hosts",
    "loader.trusted_keys",
    "loader.fetch_timeout_secs",
    "loader.max_manifest_bytes",
    "loader.offline_fallback",
];

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_positive<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let parsed: T = value
        .parse()
        .map_err(|_| anyhow!("Invalid {} value: {}", key, value))?;
    if parsed <= T::default() {
        return Err(anyhow!("{} must be greater than zero", key));
    }
    Ok(parsed)
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("itemdeck")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.host_version()?;

        if self.cache.manifest_ttl_secs <= 0 {
            return Err(anyhow!("cache.manifest_ttl_secs must be greater than zero"));
        }
        if self.cache.max_asset_bytes == 0 {
            return Err(anyhow!("cache.max_asset_bytes must be greater than zero"));
        }
        if self.loader.fetch_timeout_secs == 0 {
            return Err(anyhow!("loader.fetch_timeout_secs must be greater than zero"));
        }
        if self.loader.max_manifest_bytes == 0 {
            return Err(anyhow!("loader.max_manifest_bytes must be greater than zero"));
        }
        if self.loader.curated_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(anyhow!("loader.curated_hosts must not contain empty hosts"));
        }
        self.trusted_keys()?;
        Ok(())
    }

    pub fn host_version(&self) -> anyhow::Result<Version> {
        Version::parse(&self.host.version)
            .with_context(|| format!("Invalid host.version: {}", self.host.version))
    }

    pub fn trusted_keys(&self) -> anyhow::Result<TrustedKeys> {
        TrustedKeys::from_base64(&self.loader.trusted_keys).context("Invalid loader.trusted_keys")
    }

    /// Database file, falling back to the config directory
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.cache.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join(DATABASE_FILE)),
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "host.version" => Ok(self.host.version.clone()),

            "cache.database_path" => Ok(self.database_path()?.display().to_string()),
            "cache.manifest_ttl_secs" => Ok(self.cache.manifest_ttl_secs.to_string()),
            "cache.max_asset_bytes" => Ok(self.cache.max_asset_bytes.to_string()),

            "loader.curated_hosts" => Ok(self.loader.curated_hosts.join(", ")),
            "loader.trusted_keys" => Ok(self.loader.trusted_keys.join(", ")),
            "loader.fetch_timeout_secs" => Ok(self.loader.fetch_timeout_secs.to_string()),
            "loader.max_manifest_bytes" => Ok(self.loader.max_manifest_bytes.to_string()),
            "loader.offline_fallback" => Ok(self.loader.offline_fallback.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `itemdeck-plugins config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "host.version" => {
                Version::parse(value).with_context(|| format!("Invalid host.version value: {}", value))?;
                self.host.version = value.to_string();
            }

            "cache.database_path" => {
                self.cache.database_path = if value.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "cache.manifest_ttl_secs" => {
                self.cache.manifest_ttl_secs = parse_positive(key, value)?;
            }
            "cache.max_asset_bytes" => {
                self.cache.max_asset_bytes = parse_positive(key, value)?;
            }

            "loader.curated_hosts" => {
                self.loader.curated_hosts = split_list(value)
                    .into_iter()
                    .map(|host| host.to_ascii_lowercase())
                    .collect();
            }
            "loader.trusted_keys" => {
                let keys = split_list(value);
                TrustedKeys::from_base64(&keys).context("Invalid loader.trusted_keys value")?;
                self.loader.trusted_keys = keys;
            }
            "loader.fetch_timeout_secs" => {
                self.loader.fetch_timeout_secs = parse_positive(key, value)?;
            }
            "loader.max_manifest_bytes" => {
                self.loader.max_manifest_bytes = parse_positive(key, value)?;
            }
            "loader.offline_fallback" => {
                self.loader.offline_fallback = value
                    .parse()
                    .with_context(|| format!("Invalid offline_fallback value: {}", value))?;
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `itemdeck-plugins config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.into_iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }

    /// Open the persistent store at [`Config::database_path`]
    pub async fn open_store(&self) -> anyhow::Result<Arc<dyn KvStore>> {
        let db = Database::open(self.database_path()?).await?;
        Ok(Arc::new(SqliteStore::from_database(&db)))
    }

    /// Cache over `store` with the configured TTL and asset budget
    pub fn plugin_cache(&self, store: Arc<dyn KvStore>) -> PluginCache {
        PluginCache::new(store)
            .with_default_ttl(chrono::Duration::seconds(self.cache.manifest_ttl_secs))
            .with_asset_budget(self.cache.max_asset_bytes)
    }

    /// Loader wired to `store`, the first-party builtins and the
    /// configured fetch and trust settings
    pub fn plugin_loader(&self, store: Arc<dyn KvStore>) -> anyhow::Result<PluginLoader> {
        let host_version = self.host_version()?;
        let cache = Arc::new(self.plugin_cache(store.clone()));
        let builtins = BuiltinRegistry::with_defaults(host_version.clone())?;
        let fetcher = DefaultFetcher::new(
            std::time::Duration::from_secs(self.loader.fetch_timeout_secs),
            self.loader.max_manifest_bytes,
        )?;

        let loader = PluginLoader::builder()
            .cache(cache)
            .permissions(Arc::new(PermissionManager::new(store)))
            .builtins(Arc::new(builtins))
            .fetcher(Arc::new(fetcher))
            .host_version(host_version)
            .curated_hosts(self.loader.curated_hosts.clone())
            .trusted_keys(self.trusted_keys()?)
            .manifest_ttl(chrono::Duration::seconds(self.cache.manifest_ttl_secs))
            .offline_fallback(self.loader.offline_fallback)
            .build()?;
        Ok(loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::decode_public_key;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use ed25519_dalek::SigningKey;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.host.version, env!("CARGO_PKG_VERSION"));
        assert!(config.cache.database_path.is_none());
        assert_eq!(config.cache.manifest_ttl_secs, 604_800);
        assert_eq!(config.cache.max_asset_bytes, 50 * 1024 * 1024);
        assert!(config.loader.curated_hosts.is_empty());
        assert_eq!(config.loader.fetch_timeout_secs, 30);
        assert_eq!(config.loader.max_manifest_bytes, 65_536);
        assert!(!config.loader.offline_fallback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = Config::default();
        config.set("loader.curated_hosts", "Plugins.Itemdeck.app, cdn.itemdeck.app").unwrap();
        config.set("cache.manifest_ttl_secs", "3600").unwrap();
        config.set("loader.offline_fallback", "true").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.loader.curated_hosts,
            vec!["plugins.itemdeck.app".to_string(), "cdn.itemdeck.app".to_string()]
        );
    }

    #[test]
    fn test_missing_file_gives_defaults_without_creating_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
        assert!(!path.exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[loader]\noffline_fallback = true\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.loader.offline_fallback);
        assert_eq!(config.cache.manifest_ttl_secs, DEFAULT_MANIFEST_TTL_SECS);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[cache]\nmanifest_ttl_secs = 0\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_set_validates_values() {
        let mut config = Config::default();

        assert!(config.set("cache.manifest_ttl_secs", "0").is_err());
        assert!(config.set("cache.manifest_ttl_secs", "-5").is_err());
        assert!(config.set("cache.max_asset_bytes", "lots").is_err());
        assert!(config.set("host.version", "one").is_err());
        assert!(config.set("loader.trusted_keys", "not-a-key").is_err());
        assert!(config.set("loader.offline_fallback", "maybe").is_err());
        assert!(config.set("nope.key", "1").is_err());
        assert_eq!(config, Config::default());

        config.set("host.version", "2.3.0").unwrap();
        assert_eq!(config.host_version().unwrap(), Version::new(2, 3, 0));
    }

    #[test]
    fn test_trusted_keys_decode() {
        let verifying = SigningKey::from_bytes(&[3u8; 32]).verifying_key();
        let encoded = STANDARD.encode(verifying.as_bytes());
        assert!(decode_public_key(&encoded).is_ok());

        let mut config = Config::default();
        config.set("loader.trusted_keys", &encoded).unwrap();
        assert_eq!(config.trusted_keys().unwrap().len(), 1);
        assert_eq!(config.get("loader.trusted_keys").unwrap(), encoded);
    }

    #[test]
    fn test_list_covers_every_key() {
        let mut config = Config::default();
        config.cache.database_path = Some(PathBuf::from("/tmp/plugins.db"));

        let items = config.list().unwrap();
        assert_eq!(items.len(), KEYS.len());
        assert!(items.contains(&("cache.database_path".to_string(), "/tmp/plugins.db".to_string())));
        assert!(items.contains(&("loader.offline_fallback".to_string(), "false".to_string())));
    }

    #[tokio::test]
    async fn test_plugin_loader_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache.database_path = Some(dir.path().join(DATABASE_FILE));

        let store = config.open_store().await.unwrap();
        let loader = config.plugin_loader(store).unwrap();
        assert_eq!(loader.builtins().len(), 5);
        assert_eq!(loader.cache().default_ttl(), chrono::Duration::seconds(604_800));
    }
}
