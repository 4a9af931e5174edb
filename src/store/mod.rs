//! Crash-safe local persistence for NIC status records.
//!
//! A single key→bytes table keyed by subnet id. Every allocator mutation is
//! written through here before it is considered applied; the allocator rolls
//! its in-memory copy back when a write fails.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

#[derive(Debug, thiserror::Error)]
pub enum NicStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type NicStoreResult<T> = Result<T, NicStoreError>;

/// The operations the allocator needs from its backing store. A successful
/// `set` must be durable across a process crash; `iterate` sees a snapshot
/// at least as new as the last successful write.
#[async_trait::async_trait]
pub trait NicStore: Send + Sync {
    async fn get(&self, subnet_id: &str) -> NicStoreResult<Option<Vec<u8>>>;
    async fn set(&self, subnet_id: &str, value: &[u8]) -> NicStoreResult<()>;
    async fn delete(&self, subnet_id: &str) -> NicStoreResult<()>;
    async fn iterate(&self) -> NicStoreResult<Vec<(String, Vec<u8>)>>;
}

/// SQLite-backed store (WAL, full sync), one file under the agent's state
/// directory.
pub struct SqliteNicStore {
    pool: SqlitePool,
}

impl SqliteNicStore {
    pub async fn open(path: &str) -> NicStoreResult<SqliteNicStore> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS nic_status (
                subnet_id TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;

        Ok(SqliteNicStore { pool })
    }
}

#[async_trait::async_trait]
impl NicStore for SqliteNicStore {
    async fn get(&self, subnet_id: &str) -> NicStoreResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM nic_status WHERE subnet_id = ?")
            .bind(subnet_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn set(&self, subnet_id: &str, value: &[u8]) -> NicStoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO nic_status (subnet_id, value) VALUES (?, ?)")
            .bind(subnet_id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, subnet_id: &str) -> NicStoreResult<()> {
        sqlx::query("DELETE FROM nic_status WHERE subnet_id = ?")
            .bind(subnet_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn iterate(&self) -> NicStoreResult<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query("SELECT subnet_id, value FROM nic_status ORDER BY subnet_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("subnet_id"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }
}
