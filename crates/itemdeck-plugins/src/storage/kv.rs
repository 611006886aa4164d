//! Generic key-value store interface
//!
//! Every persistent store of the plugin system is a [`Table`] of
//! [`StoredRecord`]s addressed by primary key. Records also carry values for
//! the table's declared secondary indexes, which back equality lookups and
//! ordered range scans (the expiry sweep walks manifests by `expires_at`).

use crate::error::{PluginError, PluginResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

/// Secondary index names
pub mod index {
    pub const TIER: &str = "tier";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const CACHED_AT: &str = "cached_at";
    pub const SOURCE_URL: &str = "source_url";
    pub const PLUGIN_ID: &str = "plugin_id";
    pub const SIZE: &str = "size";
    pub const UPDATED_AT: &str = "updated_at";
}

/// Column type of a secondary index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Text,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub kind: IndexKind,
}

const fn text(name: &'static str) -> IndexSpec {
    IndexSpec {
        name,
        kind: IndexKind::Text,
    }
}

const fn integer(name: &'static str) -> IndexSpec {
    IndexSpec {
        name,
        kind: IndexKind::Integer,
    }
}

const MANIFEST_INDEXES: &[IndexSpec] = &[
    text(index::TIER),
    integer(index::EXPIRES_AT),
    integer(index::CACHED_AT),
    text(index::SOURCE_URL),
];
const ASSET_INDEXES: &[IndexSpec] = &[
    text(index::PLUGIN_ID),
    integer(index::CACHED_AT),
    integer(index::SIZE),
];
const CONFIG_INDEXES: &[IndexSpec] = &[integer(index::UPDATED_AT)];
const GRANT_INDEXES: &[IndexSpec] = &[text(index::PLUGIN_ID)];

/// Logical stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Manifests,
    Assets,
    Configs,
    Stats,
    Grants,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Manifests,
        Table::Assets,
        Table::Configs,
        Table::Stats,
        Table::Grants,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manifests => "manifests",
            Self::Assets => "assets",
            Self::Configs => "configs",
            Self::Stats => "stats",
            Self::Grants => "grants",
        }
    }

    /// SQL table backing this store
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Manifests => "plugin_manifests",
            Self::Assets => "plugin_assets",
            Self::Configs => "plugin_configs",
            Self::Stats => "plugin_cache_stats",
            Self::Grants => "plugin_grants",
        }
    }

    pub fn indexes(&self) -> &'static [IndexSpec] {
        match self {
            Self::Manifests => MANIFEST_INDEXES,
            Self::Assets => ASSET_INDEXES,
            Self::Configs => CONFIG_INDEXES,
            Self::Stats => &[],
            Self::Grants => GRANT_INDEXES,
        }
    }

    /// Look up a declared index, rejecting anything else
    pub fn index(&self, name: &str) -> PluginResult<&'static IndexSpec> {
        self.indexes()
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| {
                PluginError::Storage(format!(
                    "table '{}' has no index named '{}'",
                    self.as_str(),
                    name
                ))
            })
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a secondary index; `Null` sorts first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexValue {
    Null,
    Int(i64),
    Text(String),
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<IndexValue>> From<Option<T>> for IndexValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// A record: primary key, index values, opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub indices: BTreeMap<&'static str, IndexValue>,
    pub payload: Vec<u8>,
}

impl StoredRecord {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            indices: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_index(mut self, name: &'static str, value: impl Into<IndexValue>) -> Self {
        self.indices.insert(name, value.into());
        self
    }

    /// Index value, `Null` when unset
    pub fn index(&self, name: &str) -> IndexValue {
        self.indices.get(name).cloned().unwrap_or(IndexValue::Null)
    }

    /// Reject index values that do not belong to `table` or have the wrong type
    pub fn check_indices(&self, table: Table) -> PluginResult<()> {
        for (name, value) in &self.indices {
            let spec = table.index(name)?;
            let matches = match (spec.kind, value) {
                (_, IndexValue::Null) => true,
                (IndexKind::Text, IndexValue::Text(_)) => true,
                (IndexKind::Integer, IndexValue::Int(_)) => true,
                _ => false,
            };
            if !matches {
                return Err(PluginError::Storage(format!(
                    "index '{}' of table '{}' has the wrong type",
                    name, table
                )));
            }
        }
        Ok(())
    }
}

/// Persistent key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, table: Table, key: &str) -> PluginResult<Option<StoredRecord>>;

    /// Insert or replace by primary key
    async fn put(&self, table: Table, record: StoredRecord) -> PluginResult<()>;

    /// Returns whether a record was removed
    async fn delete(&self, table: Table, key: &str) -> PluginResult<bool>;

    /// All records ordered by primary key
    async fn list(&self, table: Table) -> PluginResult<Vec<StoredRecord>>;

    async fn list_by_index(
        &self,
        table: Table,
        index: &str,
        value: &IndexValue,
    ) -> PluginResult<Vec<StoredRecord>>;

    /// Records whose index value lies within the bounds, ascending by that
    /// value then by key
    async fn scan_index(
        &self,
        table: Table,
        index: &str,
        lower: Bound<IndexValue>,
        upper: Bound<IndexValue>,
    ) -> PluginResult<Vec<StoredRecord>>;

    async fn count(&self, table: Table) -> PluginResult<u64>;

    /// Sum of an integer index over the whole table
    async fn sum_index(&self, table: Table, index: &str) -> PluginResult<i64>;

    /// Remove every record, returning how many were removed
    async fn clear(&self, table: Table) -> PluginResult<u64>;
}
