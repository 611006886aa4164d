//! Capability model
//!
//! A plugin declares the capabilities it needs in its manifest. Whether a
//! capability is usable depends on the plugin's trust tier, looked up in a
//! static access matrix:
//!
//! | capability          | builtin | official | community |
//! |---------------------|---------|----------|-----------|
//! | storage:local       | allowed | allowed  | allowed   |
//! | storage:sync        | allowed | allowed  | consent   |
//! | storage:unlimited   | allowed | consent  | consent   |
//! | ui:notifications    | allowed | allowed  | consent   |
//! | ui:modal            | allowed | allowed  | consent   |
//! | ui:overlay          | allowed | allowed  | consent   |
//! | ui:toolbar          | allowed | allowed  | consent   |
//! | collection:read     | allowed | allowed  | allowed   |
//! | collection:write    | allowed | consent  | consent   |
//! | collection:delete   | allowed | consent  | blocked   |
//! | fetch:sameorigin    | allowed | allowed  | allowed   |
//! | fetch:external      | allowed | consent  | consent   |
//! | audio:play          | allowed | allowed  | allowed   |
//! | dangerous:eval      | allowed | blocked  | blocked   |
//! | dangerous:dom       | allowed | blocked  | blocked   |

pub mod permission;

pub use permission::{
    ConsentPrompt, FixedConsent, PermissionManager, PermissionRecord, PermissionSnapshot,
    PermissionState,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provenance-based trust level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Builtin,
    Official,
    Community,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Builtin, Tier::Official, Tier::Community];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Official => "official",
            Self::Community => "community",
        }
    }

    /// Higher is more trusted
    pub fn trust_rank(&self) -> u8 {
        match self {
            Self::Builtin => 2,
            Self::Official => 1,
            Self::Community => 0,
        }
    }

    /// Whether a plugin of this tier may claim to be `other`
    pub fn permits_claim(&self, other: Tier) -> bool {
        other.trust_rank() <= self.trust_rank()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "builtin" => Ok(Self::Builtin),
            "official" => Ok(Self::Official),
            "community" => Ok(Self::Community),
            other => Err(format!(
                "unknown tier '{}' (expected builtin, official or community)",
                other
            )),
        }
    }
}

/// Discrete permission a plugin can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "storage:local")]
    StorageLocal,
    #[serde(rename = "storage:sync")]
    StorageSync,
    #[serde(rename = "storage:unlimited")]
    StorageUnlimited,
    #[serde(rename = "ui:notifications")]
    UiNotifications,
    #[serde(rename = "ui:modal")]
    UiModal,
    #[serde(rename = "ui:overlay")]
    UiOverlay,
    #[serde(rename = "ui:toolbar")]
    UiToolbar,
    #[serde(rename = "collection:read")]
    CollectionRead,
    #[serde(rename = "collection:write")]
    CollectionWrite,
    #[serde(rename = "collection:delete")]
    CollectionDelete,
    #[serde(rename = "fetch:sameorigin")]
    FetchSameOrigin,
    #[serde(rename = "fetch:external")]
    FetchExternal,
    #[serde(rename = "audio:play")]
    AudioPlay,
    #[serde(rename = "dangerous:eval")]
    DangerousEval,
    #[serde(rename = "dangerous:dom")]
    DangerousDom,
}

impl Capability {
    pub const ALL: [Capability; 15] = [
        Capability::StorageLocal,
        Capability::StorageSync,
        Capability::StorageUnlimited,
        Capability::UiNotifications,
        Capability::UiModal,
        Capability::UiOverlay,
        Capability::UiToolbar,
        Capability::CollectionRead,
        Capability::CollectionWrite,
        Capability::CollectionDelete,
        Capability::FetchSameOrigin,
        Capability::FetchExternal,
        Capability::AudioPlay,
        Capability::DangerousEval,
        Capability::DangerousDom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StorageLocal => "storage:local",
            Self::StorageSync => "storage:sync",
            Self::StorageUnlimited => "storage:unlimited",
            Self::UiNotifications => "ui:notifications",
            Self::UiModal => "ui:modal",
            Self::UiOverlay => "ui:overlay",
            Self::UiToolbar => "ui:toolbar",
            Self::CollectionRead => "collection:read",
            Self::CollectionWrite => "collection:write",
            Self::CollectionDelete => "collection:delete",
            Self::FetchSameOrigin => "fetch:sameorigin",
            Self::FetchExternal => "fetch:external",
            Self::AudioPlay => "audio:play",
            Self::DangerousEval => "dangerous:eval",
            Self::DangerousDom => "dangerous:dom",
        }
    }

    pub fn is_dangerous(&self) -> bool {
        matches!(self, Self::DangerousEval | Self::DangerousDom)
    }

    /// Access this capability has for the given tier
    pub fn access_for(&self, tier: Tier) -> CapabilityAccess {
        use CapabilityAccess::{Allowed, Blocked, Consent};

        if tier == Tier::Builtin {
            return Allowed;
        }
        if self.is_dangerous() {
            return Blocked;
        }

        let community = tier == Tier::Community;
        match self {
            Self::StorageLocal | Self::CollectionRead | Self::FetchSameOrigin | Self::AudioPlay => {
                Allowed
            }
            Self::StorageSync
            | Self::UiNotifications
            | Self::UiModal
            | Self::UiOverlay
            | Self::UiToolbar => {
                if community {
                    Consent
                } else {
                    Allowed
                }
            }
            Self::StorageUnlimited | Self::CollectionWrite | Self::FetchExternal => Consent,
            Self::CollectionDelete => {
                if community {
                    Blocked
                } else {
                    Consent
                }
            }
            Self::DangerousEval | Self::DangerousDom => Blocked,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|cap| cap.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}

/// Outcome of looking a (capability, tier) pair up in the matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityAccess {
    Allowed,
    Consent,
    Blocked,
}

impl CapabilityAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Consent => "consent",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for CapabilityAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convenience lookup into the static matrix
pub fn access(capability: Capability, tier: Tier) -> CapabilityAccess {
    capability.access_for(tier)
}
