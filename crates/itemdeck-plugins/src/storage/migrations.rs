//! Database migrations
//!
//! Versioned SQLite schema for the plugin stores, applied automatically on
//! database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Cache stores
const MIGRATION_V1: &str = r#"
    -- Validated manifests, keyed by plugin id
    CREATE TABLE IF NOT EXISTS plugin_manifests (
        key TEXT PRIMARY KEY NOT NULL,
        tier TEXT CHECK (tier IN ('builtin', 'official', 'community')),
        expires_at INTEGER,
        cached_at INTEGER,
        source_url TEXT,
        payload BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_plugin_manifests_tier ON plugin_manifests(tier);
    CREATE INDEX IF NOT EXISTS idx_plugin_manifests_expires_at ON plugin_manifests(expires_at);
    CREATE INDEX IF NOT EXISTS idx_plugin_manifests_cached_at ON plugin_manifests(cached_at);
    CREATE INDEX IF NOT EXISTS idx_plugin_manifests_source_url ON plugin_manifests(source_url);

    -- Binary assets, keyed by "<plugin id>/<asset path>"
    CREATE TABLE IF NOT EXISTS plugin_assets (
        key TEXT PRIMARY KEY NOT NULL,
        plugin_id TEXT,
        cached_at INTEGER,
        size INTEGER,
        payload BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_plugin_assets_plugin_id ON plugin_assets(plugin_id);
    CREATE INDEX IF NOT EXISTS idx_plugin_assets_cached_at ON plugin_assets(cached_at);
    CREATE INDEX IF NOT EXISTS idx_plugin_assets_size ON plugin_assets(size);

    -- Per-plugin configuration, last write wins
    CREATE TABLE IF NOT EXISTS plugin_configs (
        key TEXT PRIMARY KEY NOT NULL,
        updated_at INTEGER,
        payload BLOB NOT NULL
    );

    -- Aggregate statistics (single record)
    CREATE TABLE IF NOT EXISTS plugin_cache_stats (
        key TEXT PRIMARY KEY NOT NULL,
        payload BLOB NOT NULL
    );
"#;

/// Migration 2: Capability grants
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS plugin_grants (
        key TEXT PRIMARY KEY NOT NULL,
        plugin_id TEXT,
        payload BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_plugin_grants_plugin_id ON plugin_grants(plugin_id);
"#;

/// Get the current schema version
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking plugin database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Plugin database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Cache stores");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Capability grants");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool")
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await;

        assert_eq!(get_current_version(&pool).await.unwrap(), 0);

        run_migrations(&pool).await.unwrap();

        assert_eq!(get_current_version(&pool).await.unwrap(), CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = create_test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        assert_eq!(get_current_version(&pool).await.unwrap(), CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_all_store_tables_exist() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        for table in [
            "plugin_manifests",
            "plugin_assets",
            "plugin_configs",
            "plugin_cache_stats",
            "plugin_grants",
        ] {
            let row: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(row.0, 1, "missing table {table}");
        }
    }
}
