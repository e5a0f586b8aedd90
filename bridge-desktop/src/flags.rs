//! Shared flag storage using SQLite

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    flags::SharedFlagStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

const CREATE_FLAGS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS flags (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
"#;

/// SQLite-backed flag store shared by every process instance.
///
/// Each instance opens the same file; WAL mode and a busy timeout let
/// concurrent writers queue instead of failing. Single statements are atomic,
/// which is all the lock protocol needs.
pub struct SqliteFlagStore {
    pool: SqlitePool,
}

impl SqliteFlagStore {
    /// Open (or create) the flag database at `db_path`.
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BridgeError::Io)?;
        }

        let path_str = db_path.to_string_lossy().replace('\\', "/");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))
            .map_err(|e| BridgeError::FlagStore(format!("Invalid flag store path: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| BridgeError::FlagStore(format!("Failed to connect to DB: {}", e)))?;

        Self::create_table(&pool).await?;
        debug!(path = ?db_path, "Initialized shared flag store");

        Ok(Self { pool })
    }

    /// Create an in-memory store (for testing).
    ///
    /// Limited to a single connection: every connection to `:memory:` is its
    /// own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BridgeError::FlagStore(format!("Failed to connect to DB: {}", e)))?;

        Self::create_table(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_table(pool: &SqlitePool) -> Result<()> {
        sqlx::query(CREATE_FLAGS_TABLE)
            .execute(pool)
            .await
            .map_err(|e| BridgeError::FlagStore(format!("Failed to create table: {}", e)))?;
        Ok(())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[async_trait]
impl SharedFlagStore for SqliteFlagStore {
    async fn get_flag(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT value FROM flags WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::FlagStore(format!("Failed to read flag: {}", e)))?;

        Ok(row.map(|r| r.get::<i64, _>(0) != 0).unwrap_or(false))
    }

    async fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flags (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(i64::from(value))
        .bind(Self::now())
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::FlagStore(format!("Failed to write flag: {}", e)))?;

        debug!(key = key, value = value, "Stored flag");
        Ok(())
    }

    async fn try_set_flag(&self, key: &str) -> Result<bool> {
        // The conditional upsert touches no row when the flag is already set.
        let result = sqlx::query(
            r#"
            INSERT INTO flags (key, value, updated_at)
            VALUES (?, 1, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = 1,
                updated_at = excluded.updated_at
            WHERE flags.value = 0
            "#,
        )
        .bind(key)
        .bind(Self::now())
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::FlagStore(format!("Failed to claim flag: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn clear_flag(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM flags WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::FlagStore(format!("Failed to clear flag: {}", e)))?;
        Ok(())
    }

    async fn list_set_flags(&self, prefix: &str) -> Result<Vec<String>> {
        // instr counts characters, so multi-byte prefixes match too.
        let rows = sqlx::query("SELECT key FROM flags WHERE value != 0 AND instr(key, ?) = 1 ORDER BY key")
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BridgeError::FlagStore(format!("Failed to list flags: {}", e)))?;

        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }
}
