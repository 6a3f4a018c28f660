use thiserror::Error;

pub mod index;
pub mod keys;
pub mod kv;
pub mod sqlite;

pub use index::KeyIndex;
pub use kv::{read_json, write_json, KvStore, MemoryStore};
pub use sqlite::SqliteStore;

pub const KV_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store lock poisoned")]
    Poisoned,
}
