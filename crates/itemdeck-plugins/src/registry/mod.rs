//! Plugin registries
//!
//! - `builtin`: manifests shipped with the host, trusted by construction
//! - `installed`: the installed set and the active plugin of each type

pub mod builtin;
pub mod installed;

pub use builtin::{BuiltinRegistry, default_manifests};
pub use installed::PluginRegistry;
