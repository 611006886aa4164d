//! Itemdeck Plugin System
//!
//! Loads, validates, secures and caches Itemdeck plugins:
//! - Manifest validation in four stages (structural, semantic, security, content)
//! - Capability checks by trust tier with persisted grants
//! - Deduplicated loading from builtin and URL sources
//! - Manifest, asset and config caching with TTL expiry and an asset budget
//! - Signed manifests (ed25519) for off-list official publishers

pub mod cache;
pub mod capability;
pub mod clock;
pub mod config;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod signature;
pub mod storage;

pub use error::{PluginError, PluginResult, ValidationError, ValidationStage};

use semver::Version;

/// Version of the host this crate ships with
pub fn host_version() -> PluginResult<Version> {
    Version::parse(env!("CARGO_PKG_VERSION"))
        .map_err(|err| PluginError::Config(format!("Invalid host version: {}", err)))
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::PluginCache;
    pub use crate::capability::{Capability, CapabilityAccess, PermissionManager, PermissionState, Tier};
    pub use crate::config::Config;
    pub use crate::error::{PluginError, PluginResult};
    pub use crate::loader::{LoadedPlugin, PluginLoader, PluginSource};
    pub use crate::manifest::{PluginManifest, PluginType, Validator};
    pub use crate::registry::{BuiltinRegistry, PluginRegistry};
    pub use crate::storage::{KvStore, MemoryStore, SqliteStore};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_version_parses() {
        let version = host_version().unwrap();
        assert_eq!(version.to_string(), env!("CARGO_PKG_VERSION"));
    }
}
