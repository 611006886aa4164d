//! Storage layer - generic key-value stores
//!
//! # Architecture
//!
//! - `kv`: the [`KvStore`] trait, tables and secondary indexes
//! - `memory`: volatile store for tests and ephemeral hosts
//! - `database`: migrated SQLite connection pool
//! - `migrations`: schema versioning and automatic migration
//! - `sqlite`: [`KvStore`] over the SQLite database
//!
//! # Usage
//!
//! ```ignore
//! use itemdeck_plugins::storage::{Database, SqliteStore};
//!
//! let db = Database::in_memory().await?;
//! let store = SqliteStore::from_database(&db);
//! ```

pub mod database;
pub mod kv;
pub mod memory;
pub mod migrations;
pub mod sqlite;

pub use database::Database;
pub use kv::{IndexKind, IndexSpec, IndexValue, KvStore, StoredRecord, Table, index};
pub use memory::MemoryStore;
pub use migrations::{CURRENT_VERSION, run_migrations};
pub use sqlite::SqliteStore;
