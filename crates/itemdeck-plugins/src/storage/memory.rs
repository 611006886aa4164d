//! In-memory key-value store

use super::kv::{IndexValue, KvStore, StoredRecord, Table};
use crate::error::{PluginError, PluginResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, RangeBounds};
use tokio::sync::RwLock;

/// Volatile store for tests and hosts without a persistent backend
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, BTreeMap<String, StoredRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, table: Table, key: &str) -> PluginResult<Option<StoredRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.get(&table).and_then(|t| t.get(key)).cloned())
    }

    async fn put(&self, table: Table, record: StoredRecord) -> PluginResult<()> {
        record.check_indices(table)?;
        let mut tables = self.tables.write().await;
        tables
            .entry(table)
            .or_default()
            .insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> PluginResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .get_mut(&table)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, table: Table) -> PluginResult<Vec<StoredRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_by_index(
        &self,
        table: Table,
        index: &str,
        value: &IndexValue,
    ) -> PluginResult<Vec<StoredRecord>> {
        table.index(index)?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|t| {
                t.values()
                    .filter(|record| &record.index(index) == value)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn scan_index(
        &self,
        table: Table,
        index: &str,
        lower: Bound<IndexValue>,
        upper: Bound<IndexValue>,
    ) -> PluginResult<Vec<StoredRecord>> {
        table.index(index)?;
        let range = (lower, upper);
        let tables = self.tables.read().await;

        let mut matched: Vec<(IndexValue, StoredRecord)> = tables
            .get(&table)
            .map(|t| {
                t.values()
                    .filter_map(|record| {
                        let value = record.index(index);
                        range.contains(&value).then(|| (value, record.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        matched.sort_by(|(a_value, a), (b_value, b)| {
            a_value.cmp(b_value).then_with(|| a.key.cmp(&b.key))
        });

        Ok(matched.into_iter().map(|(_, record)| record).collect())
    }

    async fn count(&self, table: Table) -> PluginResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables.get(&table).map(|t| t.len() as u64).unwrap_or(0))
    }

    async fn sum_index(&self, table: Table, index: &str) -> PluginResult<i64> {
        table.index(index)?;
        let tables = self.tables.read().await;
        let Some(records) = tables.get(&table) else {
            return Ok(0);
        };

        let mut total: i64 = 0;
        for record in records.values() {
            if let IndexValue::Int(value) = record.index(index) {
                total = total.checked_add(value).ok_or_else(|| {
                    PluginError::Storage(format!("sum of '{}' overflowed", index))
                })?;
            }
        }
        Ok(total)
    }

    async fn clear(&self, table: Table) -> PluginResult<u64> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .remove(&table)
            .map(|t| t.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::index;

    fn manifest_record(key: &str, expires_at: i64) -> StoredRecord {
        StoredRecord::new(key, key.as_bytes().to_vec())
            .with_index(index::TIER, "community")
            .with_index(index::EXPIRES_AT, expires_at)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store
            .put(Table::Manifests, manifest_record("a", 10))
            .await
            .unwrap();

        let record = store.get(Table::Manifests, "a").await.unwrap().unwrap();
        assert_eq!(record.payload, b"a".to_vec());

        assert!(store.delete(Table::Manifests, "a").await.unwrap());
        assert!(!store.delete(Table::Manifests, "a").await.unwrap());
        assert!(store.get(Table::Manifests, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_index_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        for (key, expires) in [("c", 30), ("a", 10), ("b", 20), ("d", 40)] {
            store
                .put(Table::Manifests, manifest_record(key, expires))
                .await
                .unwrap();
        }

        let records = store
            .scan_index(
                Table::Manifests,
                index::EXPIRES_AT,
                Bound::Unbounded,
                Bound::Included(IndexValue::Int(30)),
            )
            .await
            .unwrap();

        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_list_by_index_and_sum() {
        let store = MemoryStore::new();
        for (key, plugin, size) in [("p/a", "p", 5), ("p/b", "p", 7), ("q/a", "q", 11)] {
            let record = StoredRecord::new(key, vec![])
                .with_index(index::PLUGIN_ID, plugin)
                .with_index(index::SIZE, size);
            store.put(Table::Assets, record).await.unwrap();
        }

        let p_assets = store
            .list_by_index(Table::Assets, index::PLUGIN_ID, &IndexValue::from("p"))
            .await
            .unwrap();
        assert_eq!(p_assets.len(), 2);
        assert_eq!(store.sum_index(Table::Assets, index::SIZE).await.unwrap(), 23);
        assert_eq!(store.count(Table::Assets).await.unwrap(), 3);
        assert_eq!(store.clear(Table::Assets).await.unwrap(), 3);
        assert_eq!(store.count(Table::Assets).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_rejects_undeclared_index() {
        let store = MemoryStore::new();
        let record = StoredRecord::new("x", vec![]).with_index(index::SIZE, 1);
        assert!(store.put(Table::Configs, record).await.is_err());
    }
}
