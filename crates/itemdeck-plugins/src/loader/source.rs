//! Plugin sources, canonical source keys and tier resolution

use crate::capability::Tier;
use crate::error::{PluginError, PluginResult};
use crate::signature::TrustedKeys;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use url::Url;

const BUILTIN_PREFIX: &str = "builtin:";

/// Where a plugin comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PluginSource {
    /// Entry of the built-in registry
    Builtin(String),
    /// Manifest URL (`https`, `http` or `file`)
    Url(Url),
}

impl PluginSource {
    pub fn builtin(id: impl Into<String>) -> Self {
        Self::Builtin(id.into())
    }

    pub fn url(url: &str) -> PluginResult<Self> {
        let parsed = Url::parse(url).map_err(|e| PluginError::Fetch(format!("Invalid plugin URL '{}': {}", url, e)))?;
        Ok(Self::Url(parsed))
    }

    /// Canonical key used to deduplicate loads
    pub fn source_key(&self) -> String {
        match self {
            Self::Builtin(id) => format!("{}{}", BUILTIN_PREFIX, id),
            Self::Url(url) => format!("url:{}", normalize_url(url)),
        }
    }

    /// Normalised URL for URL sources
    pub fn normalized_url(&self) -> Option<String> {
        match self {
            Self::Builtin(_) => None,
            Self::Url(url) => Some(normalize_url(url)),
        }
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::Builtin(_))
    }
}

impl FromStr for PluginSource {
    type Err = PluginError;

    /// `builtin:<id>` or a URL
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(BUILTIN_PREFIX) {
            Some(id) if !id.is_empty() => Ok(Self::builtin(id)),
            Some(_) => Err(PluginError::NotFound("empty builtin plugin id".to_string())),
            None => Self::url(s),
        }
    }
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(id) => write!(f, "{}{}", BUILTIN_PREFIX, id),
            Self::Url(url) => f.write_str(url.as_str()),
        }
    }
}

/// Lowercased scheme and host, no default port, no fragment, no trailing
/// slash
pub fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    url.to_string()
}

/// Decides the tier of a manifest from its provenance
#[derive(Debug, Clone, Default)]
pub struct TierPolicy {
    curated_hosts: BTreeSet<String>,
    trusted_keys: TrustedKeys,
}

impl TierPolicy {
    pub fn new<S: AsRef<str>>(curated_hosts: &[S], trusted_keys: TrustedKeys) -> Self {
        Self {
            curated_hosts: curated_hosts
                .iter()
                .map(|host| host.as_ref().trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect(),
            trusted_keys,
        }
    }

    /// Whether the URL is served over https from a curated host or one of
    /// its subdomains
    pub fn is_curated(&self, url: &Url) -> bool {
        if url.scheme() != "https" {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        self.curated_hosts.iter().any(|curated| {
            host == curated
                || host
                    .strip_suffix(curated.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Tier implied by the source alone
    pub fn source_tier(&self, source: &PluginSource) -> Tier {
        match source {
            PluginSource::Builtin(_) => Tier::Builtin,
            PluginSource::Url(url) if self.is_curated(url) => Tier::Official,
            PluginSource::Url(_) => Tier::Community,
        }
    }

    /// Tier for fetched bytes, taking a detached signature into account.
    ///
    /// A signature that fails verification rejects the manifest. Signatures
    /// are ignored when no trusted keys are configured.
    pub fn resolve(&self, source: &PluginSource, bytes: &[u8], signature: Option<&str>) -> PluginResult<Tier> {
        let tier = self.source_tier(source);
        if tier != Tier::Community {
            return Ok(tier);
        }
        match signature {
            Some(signature) if !self.trusted_keys.is_empty() => {
                self.trusted_keys.verify(bytes, signature)?;
                tracing::debug!(source = %source, "Manifest signature verified");
                Ok(Tier::Official)
            }
            Some(_) => {
                tracing::debug!(source = %source, "Ignoring signature, no trusted keys configured");
                Ok(tier)
            }
            None => Ok(tier),
        }
    }
}
