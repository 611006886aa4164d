//! SQLite-backed key-value store
//!
//! Each [`Table`] maps to one SQL table with a `key` primary key, one real
//! column per declared secondary index and a `payload` blob. Column names
//! only ever come from the static index declarations.

use super::database::Database;
use super::kv::{IndexKind, IndexValue, KvStore, StoredRecord, Table};
use crate::error::PluginResult;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use std::ops::Bound;
use tracing::debug;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Key-value store persisted in the plugin database
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store from an existing connection pool
    ///
    /// The pool must already carry the plugin schema (see
    /// [`run_migrations`](super::migrations::run_migrations)).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }

    fn columns(table: Table) -> String {
        let mut columns = vec!["key"];
        columns.extend(table.indexes().iter().map(|spec| spec.name));
        columns.push("payload");
        columns.join(", ")
    }

    fn decode_row(table: Table, row: &SqliteRow) -> PluginResult<StoredRecord> {
        let key: String = row.try_get("key")?;
        let payload: Vec<u8> = row.try_get("payload")?;
        let mut record = StoredRecord::new(key, payload);

        for spec in table.indexes() {
            let value = match spec.kind {
                IndexKind::Text => IndexValue::from(row.try_get::<Option<String>, _>(spec.name)?),
                IndexKind::Integer => IndexValue::from(row.try_get::<Option<i64>, _>(spec.name)?),
            };
            record.indices.insert(spec.name, value);
        }

        Ok(record)
    }

    fn decode_rows(table: Table, rows: &[SqliteRow]) -> PluginResult<Vec<StoredRecord>> {
        rows.iter().map(|row| Self::decode_row(table, row)).collect()
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &IndexValue) -> SqliteQuery<'q> {
    match value {
        IndexValue::Null => query.bind(None::<i64>),
        IndexValue::Int(v) => query.bind(*v),
        IndexValue::Text(v) => query.bind(v.clone()),
    }
}

/// SQL predicate for one end of a range; NULL sorts below every value
fn bound_clause(column: &str, bound: &Bound<IndexValue>, lower: bool) -> Option<(String, Option<IndexValue>)> {
    match (bound, lower) {
        (Bound::Unbounded, _) => None,
        (Bound::Included(IndexValue::Null), true) => None,
        (Bound::Excluded(IndexValue::Null), true) => Some((format!("{column} IS NOT NULL"), None)),
        (Bound::Included(v), true) => Some((format!("{column} >= ?"), Some(v.clone()))),
        (Bound::Excluded(v), true) => Some((format!("{column} > ?"), Some(v.clone()))),
        (Bound::Included(IndexValue::Null), false) => Some((format!("{column} IS NULL"), None)),
        (Bound::Excluded(IndexValue::Null), false) => Some(("0".to_string(), None)),
        (Bound::Included(v), false) => Some((
            format!("({column} IS NULL OR {column} <= ?)"),
            Some(v.clone()),
        )),
        (Bound::Excluded(v), false) => Some((
            format!("({column} IS NULL OR {column} < ?)"),
            Some(v.clone()),
        )),
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, table: Table, key: &str) -> PluginResult<Option<StoredRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE key = ?",
            Self::columns(table),
            table.sql_name()
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::decode_row(table, &row)).transpose()
    }

    async fn put(&self, table: Table, record: StoredRecord) -> PluginResult<()> {
        record.check_indices(table)?;

        let index_names: Vec<&str> = table.indexes().iter().map(|spec| spec.name).collect();
        let placeholders = vec!["?"; index_names.len() + 2].join(", ");
        let updates = index_names
            .iter()
            .chain(std::iter::once(&"payload"))
            .map(|name| format!("{name} = excluded.{name}"))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(key) DO UPDATE SET {}",
            table.sql_name(),
            Self::columns(table),
            placeholders,
            updates
        );

        let mut query = sqlx::query(&sql).bind(record.key.clone());
        for name in &index_names {
            query = bind_value(query, &record.index(name));
        }
        query = query.bind(record.payload.clone());
        query.execute(&self.pool).await?;

        debug!(table = %table, key = %record.key, "Stored record");
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> PluginResult<bool> {
        let sql = format!("DELETE FROM {} WHERE key = ?", table.sql_name());
        let result = sqlx::query(&sql).bind(key).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, table: Table) -> PluginResult<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY key",
            Self::columns(table),
            table.sql_name()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Self::decode_rows(table, &rows)
    }

    async fn list_by_index(
        &self,
        table: Table,
        index: &str,
        value: &IndexValue,
    ) -> PluginResult<Vec<StoredRecord>> {
        let spec = table.index(index)?;
        let rows = if matches!(value, IndexValue::Null) {
            let sql = format!(
                "SELECT {} FROM {} WHERE {} IS NULL ORDER BY key",
                Self::columns(table),
                table.sql_name(),
                spec.name
            );
            sqlx::query(&sql).fetch_all(&self.pool).await?
        } else {
            let sql = format!(
                "SELECT {} FROM {} WHERE {} = ? ORDER BY key",
                Self::columns(table),
                table.sql_name(),
                spec.name
            );
            bind_value(sqlx::query(&sql), value)
                .fetch_all(&self.pool)
                .await?
        };
        Self::decode_rows(table, &rows)
    }

    async fn scan_index(
        &self,
        table: Table,
        index: &str,
        lower: Bound<IndexValue>,
        upper: Bound<IndexValue>,
    ) -> PluginResult<Vec<StoredRecord>> {
        let spec = table.index(index)?;

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for (bound, is_lower) in [(&lower, true), (&upper, false)] {
            if let Some((clause, param)) = bound_clause(spec.name, bound, is_lower) {
                clauses.push(clause);
                params.extend(param);
            }
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} ASC, key ASC",
            Self::columns(table),
            table.sql_name(),
            where_clause,
            spec.name
        );

        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_value(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Self::decode_rows(table, &rows)
    }

    async fn count(&self, table: Table) -> PluginResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.sql_name());
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn sum_index(&self, table: Table, index: &str) -> PluginResult<i64> {
        let spec = table.index(index)?;
        let sql = format!(
            "SELECT COALESCE(SUM({}), 0) FROM {}",
            spec.name,
            table.sql_name()
        );
        let (sum,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(sum)
    }

    async fn clear(&self, table: Table) -> PluginResult<u64> {
        let sql = format!("DELETE FROM {}", table.sql_name());
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::index;

    async fn setup_store() -> SqliteStore {
        let db = Database::in_memory()
            .await
            .expect("Failed to create in-memory database");
        SqliteStore::from_database(&db)
    }

    fn manifest_record(key: &str, expires_at: i64, source: Option<&str>) -> StoredRecord {
        StoredRecord::new(key, format!("{{\"id\":\"{key}\"}}").into_bytes())
            .with_index(index::TIER, "community")
            .with_index(index::EXPIRES_AT, expires_at)
            .with_index(index::CACHED_AT, 0)
            .with_index(index::SOURCE_URL, source)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = setup_store().await;
        let record = manifest_record("org.example.a", 100, Some("https://example.com/a.json"));
        store.put(Table::Manifests, record.clone()).await.unwrap();

        let loaded = store
            .get(Table::Manifests, "org.example.a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_put_upserts() {
        let store = setup_store().await;
        store
            .put(Table::Manifests, manifest_record("a.b", 1, None))
            .await
            .unwrap();
        store
            .put(Table::Manifests, manifest_record("a.b", 2, None))
            .await
            .unwrap();

        assert_eq!(store.count(Table::Manifests).await.unwrap(), 1);
        let loaded = store.get(Table::Manifests, "a.b").await.unwrap().unwrap();
        assert_eq!(loaded.index(index::EXPIRES_AT), IndexValue::Int(2));
    }

    #[tokio::test]
    async fn test_scan_index_ascending_with_upper_bound() {
        let store = setup_store().await;
        for (key, expires) in [("c.c", 30), ("a.a", 10), ("d.d", 40), ("b.b", 20)] {
            store
                .put(Table::Manifests, manifest_record(key, expires, None))
                .await
                .unwrap();
        }

        let expired = store
            .scan_index(
                Table::Manifests,
                index::EXPIRES_AT,
                Bound::Unbounded,
                Bound::Included(IndexValue::Int(25)),
            )
            .await
            .unwrap();
        let keys: Vec<_> = expired.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a.a", "b.b"]);
    }

    #[tokio::test]
    async fn test_list_by_null_index() {
        let store = setup_store().await;
        store
            .put(Table::Manifests, manifest_record("a.a", 1, None))
            .await
            .unwrap();
        store
            .put(Table::Manifests, manifest_record("b.b", 1, Some("https://x.test/m.json")))
            .await
            .unwrap();

        let without_source = store
            .list_by_index(Table::Manifests, index::SOURCE_URL, &IndexValue::Null)
            .await
            .unwrap();
        assert_eq!(without_source.len(), 1);
        assert_eq!(without_source[0].key, "a.a");
    }

    #[tokio::test]
    async fn test_sum_and_clear_assets() {
        let store = setup_store().await;
        for (key, size) in [("p/a.png", 10), ("p/b.png", 32)] {
            let record = StoredRecord::new(key, vec![0u8; size as usize])
                .with_index(index::PLUGIN_ID, "p")
                .with_index(index::CACHED_AT, 0)
                .with_index(index::SIZE, size);
            store.put(Table::Assets, record).await.unwrap();
        }

        assert_eq!(store.sum_index(Table::Assets, index::SIZE).await.unwrap(), 42);
        assert_eq!(store.clear(Table::Assets).await.unwrap(), 2);
        assert_eq!(store.sum_index(Table::Assets, index::SIZE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let store = setup_store().await;
        let record = StoredRecord::new("stats", b"{}".to_vec());
        store.put(Table::Stats, record).await.unwrap();

        assert!(store.delete(Table::Stats, "stats").await.unwrap());
        assert!(!store.delete(Table::Stats, "stats").await.unwrap());
    }
}
