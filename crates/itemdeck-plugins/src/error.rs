//! Error types for the plugin system

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the plugin system's error
pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Validation pipeline stage that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Structural,
    Semantic,
    Security,
    Content,
}

impl ValidationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Semantic => "semantic",
            Self::Security => "security",
            Self::Content => "content",
        }
    }
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single manifest problem, addressed by a dotted field path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub stage: ValidationStage,
    /// Field path such as `itemdeck.minVersion` or `assets.screenshots[2]`
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(stage: ValidationStage, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "[{}] {}", self.stage, self.message)
        } else {
            write!(f, "[{}] {}: {}", self.stage, self.path, self.message)
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Plugin system errors
///
/// Cloneable so a single load pipeline can hand the same failure to every
/// caller waiting on it.
#[derive(Error, Debug, Clone)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin validation failed: {}", join_errors(.0))]
    ValidationFailed(Vec<ValidationError>),

    #[error("Capability '{capability}' is not available to plugin '{plugin_id}'")]
    CapabilityDenied {
        plugin_id: String,
        capability: String,
    },

    #[error("Plugin fetch failed: {0}")]
    Fetch(String),

    #[error("Corrupted cache record '{key}': {reason}")]
    CacheCorruption { key: String, reason: String },

    #[error("Plugin storage error: {0}")]
    Storage(String),

    #[error("Plugin '{0}' is already installed from a different source")]
    DuplicatePlugin(String),

    #[error("Manifest signature rejected: {0}")]
    Signature(String),

    #[error("Plugin configuration error: {0}")]
    Config(String),
}

impl PluginError {
    /// Build a validation failure from a single error
    pub fn invalid(stage: ValidationStage, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationFailed(vec![ValidationError::new(stage, path, message)])
    }

    pub fn capability_denied(plugin_id: impl Into<String>, capability: impl fmt::Display) -> Self {
        Self::CapabilityDenied {
            plugin_id: plugin_id.into(),
            capability: capability.to_string(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E500",
            Self::ValidationFailed(_) => "E501",
            Self::CapabilityDenied { .. } => "E502",
            Self::Fetch(_) => "E503",
            Self::CacheCorruption { .. } => "E504",
            Self::Storage(_) => "E505",
            Self::DuplicatePlugin(_) => "E506",
            Self::Signature(_) => "E507",
            Self::Config(_) => "E508",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NotFound(_) => Some("itemdeck-plugins builtins".to_string()),
            Self::Fetch(_) => Some("Check your internet connection and the plugin URL".to_string()),
            Self::CacheCorruption { .. } | Self::Storage(_) => {
                Some("itemdeck-plugins cache clear".to_string())
            }
            Self::DuplicatePlugin(id) => Some(format!("Uninstall '{}' before installing it again", id)),
            Self::Config(_) => Some("itemdeck-plugins config list".to_string()),
            _ => None,
        }
    }

    /// Validation errors carried by this error, if any
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Self::ValidationFailed(errors) => errors,
            _ => &[],
        }
    }

    /// Whether a retry of the same operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Storage(_))
    }
}

impl From<sqlx::Error> for PluginError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for PluginError {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch(err.to_string())
    }
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        Self::Fetch(err.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization failed: {}", err))
    }
}
